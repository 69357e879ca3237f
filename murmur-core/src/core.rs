//! Host-driven API: MurmurCore receives datagrams, clock ticks and user intents from the
//! host and returns actions. Every method takes `&self`, so one `Arc<MurmurCore>` can be
//! shared by the receive loop, the heartbeat loop, the retry loop and the command surface.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cipher;
use crate::config::ProtocolConfig;
use crate::delivery::{DeliveryEngine, DeliveryKey, RetryOutcome};
use crate::event::{Action, Direction, Event};
use crate::presence::PresenceEngine;
use crate::protocol::{
    Acknowledgement, EncryptedMessage, FileChunk, GlobalMessage, Packet, Payload, PeerId,
};
use crate::session::{GlobalEntry, HistoryEntry, LocalIdentity, PeerInfo, Session};
use crate::transfer::{
    self, ChunkReceiveResult, FileTooLarge, OutgoingFile, TransferTable, MAX_CHUNK_SIZE,
};
use crate::wire::{self, MAX_SEND_LEN};

/// Main coordinator. Host passes events; core returns actions.
pub struct MurmurCore {
    session: Arc<Session>,
    presence: PresenceEngine,
    delivery: DeliveryEngine,
    transfers: Mutex<TransferTable>,
    chunk_size: usize,
    /// Idle time after which a partial incoming file is abandoned.
    transfer_timeout: Duration,
    global_message_id: AtomicU16,
    discarded: AtomicU64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("no shared secret with {0} yet")]
    NoSharedSecret(PeerId),
    #[error(transparent)]
    FileTooLarge(#[from] FileTooLarge),
    #[error("datagram of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

impl MurmurCore {
    pub fn new(identity: LocalIdentity, config: &ProtocolConfig) -> Self {
        let session = Arc::new(Session::new(identity, config.peer_ttl));
        let policy = config.retry_policy();
        let chunk_size = match config.chunk_size {
            0 => transfer::DEFAULT_CHUNK_SIZE,
            n if n > MAX_CHUNK_SIZE => {
                warn!(configured = n, max = MAX_CHUNK_SIZE, "chunk size lowered to fit one datagram");
                MAX_CHUNK_SIZE
            }
            n => n,
        };
        Self {
            presence: PresenceEngine::new(session.clone()),
            delivery: DeliveryEngine::new(session.clone(), policy),
            session,
            transfers: Mutex::new(TransferTable::new()),
            chunk_size,
            transfer_timeout: policy.interval * policy.max_retries.saturating_add(1),
            global_message_id: AtomicU16::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.session.local_id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn delivery(&self) -> &DeliveryEngine {
        &self.delivery
    }

    fn transfers(&self) -> MutexGuard<'_, TransferTable> {
        self.transfers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encrypt `text` under the pairwise key and send it reliably.
    pub fn send_text(
        &self,
        peer: PeerId,
        text: &str,
        now: Instant,
    ) -> Result<Vec<Action>, SendError> {
        if !self.session.is_known(peer) {
            return Err(SendError::UnknownPeer(peer));
        }
        let key = self
            .session
            .secret_for(peer)
            .ok_or(SendError::NoSharedSecret(peer))?;
        let ciphertext = cipher::encrypt(&key, text.as_bytes());
        let len = wire::ENCRYPTED_OVERHEAD + ciphertext.len();
        if len > MAX_SEND_LEN {
            return Err(SendError::TooLarge {
                len,
                max: MAX_SEND_LEN,
            });
        }
        let message_id = self
            .session
            .next_message_id(peer)
            .ok_or(SendError::UnknownPeer(peer))?;
        let payload = Payload::EncryptedMessage(EncryptedMessage {
            sender: self.local_id(),
            recipient: peer,
            message_id,
            ciphertext,
        });
        self.session.record_outbound(peer, message_id, text);
        let datagram = self.delivery.send(
            DeliveryKey {
                peer,
                message_id,
                chunk_index: 0,
            },
            payload,
            now,
        );
        Ok(vec![Action::Transmit(datagram)])
    }

    /// Unencrypted, unacknowledged text for the whole group.
    pub fn send_global_text(&self, text: &str) -> Result<Vec<Action>, SendError> {
        let mut message = GlobalMessage {
            sender: self.local_id(),
            message_id: 0,
            text: text.to_string(),
        };
        let len = wire::encoded_len(&Payload::GlobalMessage(message.clone()));
        if len > MAX_SEND_LEN {
            return Err(SendError::TooLarge {
                len,
                max: MAX_SEND_LEN,
            });
        }
        message.message_id = self.global_message_id.fetch_add(1, Ordering::AcqRel);
        let packet = Packet::new(
            self.session.next_sequence_number(),
            Payload::GlobalMessage(message),
        );
        self.session.record_global(self.local_id(), text);
        Ok(vec![Action::Transmit(wire::encode(&packet))])
    }

    /// Split `data` into chunks and send each one reliably.
    pub fn send_file_bytes(
        &self,
        peer: PeerId,
        name: &str,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<Action>, SendError> {
        if !self.session.is_known(peer) {
            return Err(SendError::UnknownPeer(peer));
        }
        let chunks = transfer::split_into_chunks(data, self.chunk_size)?;
        let total_length = u32::try_from(data.len()).map_err(|_| FileTooLarge {
            len: data.len(),
            chunk_size: self.chunk_size,
        })?;
        let (Some(message_id), Some(file_id)) = (
            self.session.next_message_id(peer),
            self.session.next_file_id(peer),
        ) else {
            return Err(SendError::UnknownPeer(peer));
        };
        self.transfers()
            .start_outgoing(OutgoingFile::new(peer, file_id, message_id, &chunks));
        debug!(%peer, file_id, chunks = chunks.len(), bytes = data.len(), "sending file");
        let actions = chunks
            .iter()
            .map(|chunk| {
                let payload = Payload::FileChunk(FileChunk {
                    sender: self.local_id(),
                    recipient: peer,
                    message_id,
                    total_length,
                    file_id,
                    chunk_index: chunk.index,
                    name: name.to_string(),
                    data: chunk.data.to_vec(),
                });
                let key = DeliveryKey {
                    peer,
                    message_id,
                    chunk_index: chunk.index,
                };
                Action::Transmit(self.delivery.send(key, payload, now))
            })
            .collect();
        Ok(actions)
    }

    pub fn known_peers(&self) -> Vec<PeerInfo> {
        self.session.known_peers()
    }

    pub fn chat_history(&self, peer: PeerId) -> Vec<HistoryEntry> {
        self.session.chat_history(peer)
    }

    pub fn global_history(&self) -> Vec<GlobalEntry> {
        self.session.global_history()
    }

    /// Frames dropped as undecodable or undecryptable since startup.
    pub fn discarded_frames(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Periodic heartbeat: pulse, key-exchange retries, peer aging and abandoned
    /// incoming files.
    pub fn heartbeat(&self, now: Instant) -> Vec<Action> {
        let actions = self.presence.tick();
        let mut transfers = self.transfers();
        for action in &actions {
            if let Some(Event::PeerExpired { peer }) = action.event() {
                transfers.forget_peer(*peer);
            }
        }
        for (peer, file_id) in transfers.expire_stale(now, self.transfer_timeout) {
            info!(%peer, file_id, "abandoning incomplete incoming file");
        }
        actions
    }

    /// Fire due retransmissions and report exhausted deliveries.
    pub fn poll_retries(&self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut failed = HashSet::new();
        for outcome in self.delivery.poll_retries(now) {
            match outcome {
                RetryOutcome::Resend { datagram, .. } => actions.push(Action::Transmit(datagram)),
                RetryOutcome::Exhausted { key } => {
                    if !failed.insert((key.peer, key.message_id)) {
                        continue;
                    }
                    let file = self.transfers().finish_outgoing(key.peer, key.message_id);
                    if let Some(file) = file {
                        let dropped = self.delivery.cancel_message(key.peer, key.message_id);
                        warn!(peer = %key.peer, file_id = file.file_id, dropped, "file transfer failed");
                    }
                    actions.push(Action::Notify(Event::MessageDeliveryFailed {
                        peer: key.peer,
                        message_id: key.message_id,
                    }));
                }
            }
        }
        actions
    }

    /// Decode one received datagram and route it. Never fails; bad frames are counted.
    pub fn on_datagram(&self, bytes: &[u8], now: Instant) -> Vec<Action> {
        let packet = match wire::decode(bytes) {
            Ok(p) => p,
            Err(e) => {
                self.discard(&e);
                return Vec::new();
            }
        };
        let me = self.local_id();
        let payload = packet.payload;
        if payload.sender() == me {
            return Vec::new();
        }
        if payload.recipient().is_some_and(|to| to != me) {
            return Vec::new();
        }
        debug!(seq = packet.sequence, ty = ?payload.packet_type(), from = %payload.sender(), "datagram");
        match payload {
            Payload::Pulse(pulse) => self.presence.on_pulse(&pulse),
            Payload::Acknowledgement(ack) => self.on_ack(ack),
            Payload::KeyExchange(kx) => {
                let outcome = self.presence.on_key_exchange(&kx);
                if outcome.renewed {
                    self.transfers().forget_peer(kx.sender);
                }
                outcome.actions
            }
            Payload::EncryptedMessage(msg) => self.on_encrypted(msg),
            Payload::FileChunk(chunk) => self.on_chunk(chunk, now),
            Payload::GlobalMessage(msg) => {
                self.session.record_global(msg.sender, &msg.text);
                vec![Action::Notify(Event::GlobalMessageReceived {
                    peer: msg.sender,
                    text: msg.text,
                })]
            }
        }
    }

    fn discard(&self, reason: &dyn std::fmt::Display) {
        let total = self.discarded.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(%reason, total, "discarding frame");
    }

    fn on_ack(&self, ack: Acknowledgement) -> Vec<Action> {
        let key = DeliveryKey {
            peer: ack.sender,
            message_id: ack.message_id,
            chunk_index: ack.chunk_index,
        };
        if !self.delivery.acknowledge(key) {
            debug!(peer = %ack.sender, message_id = ack.message_id, "duplicate ack");
            return Vec::new();
        }
        let mut transfers = self.transfers();
        if let Some(file) = transfers.outgoing_mut(ack.sender, ack.message_id) {
            let mut actions = Vec::new();
            let file_id = file.file_id;
            if let Some((transferred, total)) = file.mark_acked(ack.chunk_index) {
                actions.push(Action::Notify(Event::FileTransferProgress {
                    peer: ack.sender,
                    file_id,
                    direction: Direction::Outgoing,
                    transferred,
                    total,
                }));
            }
            if file.is_complete() {
                transfers.finish_outgoing(ack.sender, ack.message_id);
                actions.push(Action::Notify(Event::FileTransferComplete {
                    peer: ack.sender,
                    file_id,
                    direction: Direction::Outgoing,
                }));
            }
            return actions;
        }
        drop(transfers);
        self.session.mark_delivered(ack.sender, ack.message_id);
        vec![Action::Notify(Event::MessageDelivered {
            peer: ack.sender,
            message_id: ack.message_id,
        })]
    }

    fn on_encrypted(&self, msg: EncryptedMessage) -> Vec<Action> {
        let Some(key) = self.session.secret_for(msg.sender) else {
            // Not acknowledged: the sender keeps retrying while the exchange completes.
            debug!(peer = %msg.sender, "no shared secret, dropping message");
            return Vec::new();
        };
        let plain = match cipher::decrypt(&key, &msg.ciphertext) {
            Ok(p) => p,
            Err(e) => {
                self.discard(&e);
                return Vec::new();
            }
        };
        let mut actions = vec![Action::Transmit(self.ack_datagram(
            msg.sender,
            msg.message_id,
            0,
        ))];
        if self.session.note_inbound_message(msg.sender, msg.message_id) {
            let text = String::from_utf8_lossy(&plain).into_owned();
            self.session.record_inbound(msg.sender, msg.message_id, &text);
            actions.push(Action::Notify(Event::MessageReceived {
                peer: msg.sender,
                message_id: msg.message_id,
                text,
            }));
        }
        actions
    }

    fn on_chunk(&self, chunk: FileChunk, now: Instant) -> Vec<Action> {
        let (peer, file_id) = (chunk.sender, chunk.file_id);
        if !self.session.is_known(peer) {
            // Not acknowledged: the sender retries until our pulse-based discovery catches up.
            debug!(%peer, file_id, "chunk from unknown peer");
            return Vec::new();
        }
        let mut actions = vec![Action::Transmit(self.ack_datagram(
            peer,
            chunk.message_id,
            chunk.chunk_index,
        ))];
        let result = self.transfers().on_chunk(chunk, now);
        match result {
            ChunkReceiveResult::InProgress { received, total } => {
                actions.push(Action::Notify(Event::FileTransferProgress {
                    peer,
                    file_id,
                    direction: Direction::Incoming,
                    transferred: received,
                    total,
                }));
            }
            ChunkReceiveResult::Complete { name, data } => {
                debug!(%peer, file_id, bytes = data.len(), "file reassembled");
                actions.push(Action::Notify(Event::FileTransferComplete {
                    peer,
                    file_id,
                    direction: Direction::Incoming,
                }));
                actions.push(Action::Notify(Event::FileReceived {
                    peer,
                    file_id,
                    name,
                    data,
                }));
            }
            ChunkReceiveResult::Duplicate => {}
        }
        actions
    }

    fn ack_datagram(&self, to: PeerId, message_id: u16, chunk_index: u8) -> Vec<u8> {
        wire::encode(&Packet::new(
            self.session.next_sequence_number(),
            Payload::Acknowledgement(Acknowledgement {
                sender: self.local_id(),
                recipient: to,
                message_id,
                chunk_index,
            }),
        ))
    }
}
