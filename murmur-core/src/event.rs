//! What the core hands back to its host: datagrams to transmit and collaborator events.

use crate::protocol::PeerId;

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send this datagram to the multicast group.
    Transmit(Vec<u8>),
    /// Forward this event to collaborators (UI, experience tracker, ...).
    Notify(Event),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeerDiscovered {
        peer: PeerId,
        name: String,
    },
    PeerExpired {
        peer: PeerId,
    },
    SecretEstablished {
        peer: PeerId,
    },
    MessageReceived {
        peer: PeerId,
        message_id: u16,
        text: String,
    },
    GlobalMessageReceived {
        peer: PeerId,
        text: String,
    },
    MessageDelivered {
        peer: PeerId,
        message_id: u16,
    },
    /// Retry budget exhausted for a text message or for any chunk of a file.
    MessageDeliveryFailed {
        peer: PeerId,
        message_id: u16,
    },
    FileTransferProgress {
        peer: PeerId,
        file_id: u8,
        direction: Direction,
        transferred: u64,
        total: u64,
    },
    FileTransferComplete {
        peer: PeerId,
        file_id: u8,
        direction: Direction,
    },
    FileReceived {
        peer: PeerId,
        file_id: u8,
        name: String,
        data: Vec<u8>,
    },
}

impl Action {
    pub fn event(&self) -> Option<&Event> {
        match self {
            Action::Notify(e) => Some(e),
            Action::Transmit(_) => None,
        }
    }

    pub fn datagram(&self) -> Option<&[u8]> {
        match self {
            Action::Transmit(bytes) => Some(bytes),
            Action::Notify(_) => None,
        }
    }
}
