//! Murmur LAN messenger protocol.
//! Host-driven: no I/O; host passes datagrams and clock ticks and receives actions.

pub mod cipher;
pub mod config;
pub mod delivery;
pub mod dh;
pub mod event;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod wire;

pub mod core;

pub use config::ProtocolConfig;
pub use self::core::{MurmurCore, SendError};
pub use delivery::{DeliveryKey, DeliveryState, RetryPolicy};
pub use event::{Action, Direction, Event};
pub use protocol::{Packet, PacketType, Payload, PeerId};
pub use session::{GlobalEntry, HistoryEntry, LocalIdentity, PeerInfo};
pub use wire::{decode, encode, DecodeError};
