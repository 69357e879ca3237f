//! Session state shared by every engine: identity, known peers, pairwise secrets,
//! the outbound sequence counter, per-peer ID counters and the in-memory chat log.
//!
//! Each structure sits behind its own lock and no method holds two locks at once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::dh::{should_initiate, KeyAgreement, Role, SharedKey};
use crate::event::Direction;
use crate::protocol::{ExchangeStep, PeerId};

/// Heartbeat ticks a peer survives without a pulse.
pub const DEFAULT_PEER_TTL: u8 = 5;

/// Inbound message IDs remembered per peer for duplicate suppression.
const RECENT_INBOUND: usize = 256;

#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub id: PeerId,
    pub name: String,
    pub level: u8,
}

/// A known remote peer.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub level: u8,
    pub ttl: u8,
    pub agreement: Option<KeyAgreement>,
    recent_inbound: VecDeque<u16>,
}

impl Peer {
    fn new(id: PeerId, name: String, level: u8, ttl: u8) -> Self {
        Self {
            id,
            name,
            level,
            ttl,
            agreement: None,
            recent_inbound: VecDeque::new(),
        }
    }

    /// Forget which inbound message IDs were seen. Used when the pairwise secret is renewed.
    pub fn clear_inbound(&mut self) {
        self.recent_inbound.clear();
    }
}

/// Outbound ID counters for one peer. Kept across expiry so a rejoining peer never sees a
/// reused message or file ID from us.
#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    message: u16,
    file: u8,
}

/// Read-only snapshot of a peer for collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    pub level: u8,
    pub ttl: u8,
    pub has_secret: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Discovered,
    Refreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub direction: Direction,
    pub message_id: u16,
    pub text: String,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalEntry {
    pub peer: PeerId,
    pub text: String,
}

#[derive(Default)]
struct ChatLog {
    private: HashMap<PeerId, Vec<HistoryEntry>>,
    global: Vec<GlobalEntry>,
}

pub struct Session {
    identity: LocalIdentity,
    peer_ttl: u8,
    sequence: AtomicU16,
    peers: Mutex<HashMap<PeerId, Peer>>,
    secrets: Mutex<HashMap<PeerId, SharedKey>>,
    counters: Mutex<HashMap<PeerId, Counters>>,
    log: Mutex<ChatLog>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(identity: LocalIdentity, peer_ttl: u8) -> Self {
        Self {
            identity,
            peer_ttl: peer_ttl.max(1),
            sequence: AtomicU16::new(0),
            peers: Mutex::new(HashMap::new()),
            secrets: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            log: Mutex::new(ChatLog::default()),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn local_id(&self) -> PeerId {
        self.identity.id
    }

    /// Next outbound sequence number. Shared by every packet type; wraps at 2^16.
    pub fn next_sequence_number(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::AcqRel)
    }

    pub fn known_peers(&self) -> Vec<PeerInfo> {
        let peers: Vec<(PeerId, String, u8, u8)> = lock(&self.peers)
            .values()
            .map(|p| (p.id, p.name.clone(), p.level, p.ttl))
            .collect();
        let secrets = lock(&self.secrets);
        let mut out: Vec<PeerInfo> = peers
            .into_iter()
            .map(|(id, name, level, ttl)| PeerInfo {
                id,
                name,
                level,
                ttl,
                has_secret: secrets.contains_key(&id),
            })
            .collect();
        out.sort_by_key(|p| p.id);
        out
    }

    pub fn is_known(&self, id: PeerId) -> bool {
        lock(&self.peers).contains_key(&id)
    }

    /// Reset the TTL of a known peer, or create it.
    pub fn upsert_peer(&self, id: PeerId, name: &str, level: u8) -> Upsert {
        let mut peers = lock(&self.peers);
        match peers.get_mut(&id) {
            Some(peer) => {
                peer.ttl = self.peer_ttl;
                peer.level = level;
                if peer.name != name {
                    peer.name = name.to_string();
                }
                Upsert::Refreshed
            }
            None => {
                peers.insert(id, Peer::new(id, name.to_string(), level, self.peer_ttl));
                Upsert::Discovered
            }
        }
    }

    /// Decrement every TTL by one. Peers reaching zero are removed together with their
    /// secret; their IDs are returned so the caller can signal the expiry once.
    pub fn age_all_peers(&self) -> Vec<PeerId> {
        let expired: Vec<PeerId> = {
            let mut peers = lock(&self.peers);
            for peer in peers.values_mut() {
                peer.ttl = peer.ttl.saturating_sub(1);
            }
            let mut gone: Vec<PeerId> = peers
                .values()
                .filter(|p| p.ttl == 0)
                .map(|p| p.id)
                .collect();
            gone.sort();
            for id in &gone {
                peers.remove(id);
            }
            gone
        };
        if !expired.is_empty() {
            let mut secrets = lock(&self.secrets);
            for id in &expired {
                secrets.remove(id);
            }
        }
        expired
    }

    pub fn secret_for(&self, peer: PeerId) -> Option<SharedKey> {
        lock(&self.secrets).get(&peer).copied()
    }

    pub fn install_secret(&self, peer: PeerId, key: SharedKey) {
        lock(&self.secrets).insert(peer, key);
    }

    /// Drop the secret for `peer`. Returns whether one was held.
    pub fn remove_secret(&self, peer: PeerId) -> bool {
        lock(&self.secrets).remove(&peer).is_some()
    }

    /// Run `f` against a known peer under the peer-table lock.
    pub fn with_peer<R>(&self, id: PeerId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        lock(&self.peers).get_mut(&id).map(f)
    }

    /// Next message ID towards a known peer. Continues where it left off if the peer
    /// expired and came back.
    pub fn next_message_id(&self, peer: PeerId) -> Option<u16> {
        if !self.is_known(peer) {
            return None;
        }
        let mut counters = lock(&self.counters);
        let c = counters.entry(peer).or_default();
        let id = c.message;
        c.message = c.message.wrapping_add(1);
        Some(id)
    }

    pub fn next_file_id(&self, peer: PeerId) -> Option<u8> {
        if !self.is_known(peer) {
            return None;
        }
        let mut counters = lock(&self.counters);
        let c = counters.entry(peer).or_default();
        let id = c.file;
        c.file = c.file.wrapping_add(1);
        Some(id)
    }

    /// Offers still awaiting a reply, for peers this node initiated with.
    pub fn outstanding_offers(&self) -> Vec<(PeerId, ExchangeStep)> {
        let peers = lock(&self.peers);
        let mut out: Vec<(PeerId, ExchangeStep)> = peers
            .values()
            .filter_map(|p| {
                let a = p.agreement.as_ref()?;
                (a.role() == Role::Initiator && !a.is_acknowledged()).then(|| (p.id, a.offer()))
            })
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Known peers we must wait on for an offer but hold no secret with.
    pub fn peers_awaiting_offer(&self) -> Vec<PeerId> {
        let me = self.local_id();
        let mut candidates: Vec<PeerId> = lock(&self.peers)
            .keys()
            .copied()
            .filter(|id| !should_initiate(me, *id))
            .collect();
        let secrets = lock(&self.secrets);
        candidates.retain(|id| !secrets.contains_key(id));
        candidates.sort();
        candidates
    }

    /// Record an inbound message ID. Returns `false` if it was seen recently.
    pub fn note_inbound_message(&self, peer: PeerId, message_id: u16) -> bool {
        self.with_peer(peer, |p| {
            if p.recent_inbound.contains(&message_id) {
                return false;
            }
            if p.recent_inbound.len() == RECENT_INBOUND {
                p.recent_inbound.pop_front();
            }
            p.recent_inbound.push_back(message_id);
            true
        })
        .unwrap_or(false)
    }

    pub fn record_outbound(&self, peer: PeerId, message_id: u16, text: &str) {
        self.push_history(
            peer,
            HistoryEntry {
                direction: Direction::Outgoing,
                message_id,
                text: text.to_string(),
                delivered: false,
            },
        );
    }

    pub fn record_inbound(&self, peer: PeerId, message_id: u16, text: &str) {
        self.push_history(
            peer,
            HistoryEntry {
                direction: Direction::Incoming,
                message_id,
                text: text.to_string(),
                delivered: true,
            },
        );
    }

    fn push_history(&self, peer: PeerId, entry: HistoryEntry) {
        lock(&self.log).private.entry(peer).or_default().push(entry);
    }

    /// Flag the newest outbound entry with this ID as delivered.
    pub fn mark_delivered(&self, peer: PeerId, message_id: u16) -> bool {
        let mut log = lock(&self.log);
        let Some(entries) = log.private.get_mut(&peer) else {
            return false;
        };
        match entries
            .iter_mut()
            .rev()
            .find(|e| e.direction == Direction::Outgoing && e.message_id == message_id)
        {
            Some(entry) => {
                entry.delivered = true;
                true
            }
            None => false,
        }
    }

    pub fn record_global(&self, peer: PeerId, text: &str) {
        lock(&self.log).global.push(GlobalEntry {
            peer,
            text: text.to_string(),
        });
    }

    pub fn chat_history(&self, peer: PeerId) -> Vec<HistoryEntry> {
        lock(&self.log)
            .private
            .get(&peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn global_history(&self) -> Vec<GlobalEntry> {
        lock(&self.log).global.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session(ttl: u8) -> Session {
        Session::new(
            LocalIdentity {
                id: PeerId(1),
                name: "me".into(),
                level: 1,
            },
            ttl,
        )
    }

    #[test]
    fn sequence_numbers_increase_and_wrap() {
        let s = session(3);
        assert_eq!(s.next_sequence_number(), 0);
        assert_eq!(s.next_sequence_number(), 1);
        s.sequence.store(u16::MAX, Ordering::Release);
        assert_eq!(s.next_sequence_number(), u16::MAX);
        assert_eq!(s.next_sequence_number(), 0);
    }

    #[test]
    fn concurrent_sequence_numbers_are_unique() {
        let s = Arc::new(session(3));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || {
                    (0..1000).map(|_| s.next_sequence_number()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }

    #[test]
    fn upsert_creates_then_refreshes() {
        let s = session(3);
        assert_eq!(s.upsert_peer(PeerId(2), "bob", 1), Upsert::Discovered);
        s.age_all_peers();
        assert_eq!(s.known_peers()[0].ttl, 2);
        assert_eq!(s.upsert_peer(PeerId(2), "bobby", 4), Upsert::Refreshed);
        let peers = s.known_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ttl, 3);
        assert_eq!(peers[0].name, "bobby");
        assert_eq!(peers[0].level, 4);
    }

    #[test]
    fn peer_expires_exactly_once() {
        let s = session(2);
        s.upsert_peer(PeerId(2), "bob", 1);
        s.install_secret(PeerId(2), SharedKey::render(4));
        assert!(s.age_all_peers().is_empty());
        assert_eq!(s.age_all_peers(), vec![PeerId(2)]);
        assert!(s.age_all_peers().is_empty());
        assert!(s.known_peers().is_empty());
        assert!(s.secret_for(PeerId(2)).is_none());
    }

    #[test]
    fn per_peer_counters_are_independent() {
        let s = session(3);
        s.upsert_peer(PeerId(2), "bob", 1);
        s.upsert_peer(PeerId(3), "cat", 1);
        assert_eq!(s.next_message_id(PeerId(2)), Some(0));
        assert_eq!(s.next_message_id(PeerId(2)), Some(1));
        assert_eq!(s.next_message_id(PeerId(3)), Some(0));
        assert_eq!(s.next_file_id(PeerId(2)), Some(0));
        assert_eq!(s.next_message_id(PeerId(9)), None);
    }

    #[test]
    fn counters_survive_expiry() {
        let s = session(1);
        s.upsert_peer(PeerId(2), "bob", 1);
        assert_eq!(s.next_message_id(PeerId(2)), Some(0));
        assert_eq!(s.next_file_id(PeerId(2)), Some(0));
        assert_eq!(s.age_all_peers(), vec![PeerId(2)]);
        assert_eq!(s.next_message_id(PeerId(2)), None);
        s.upsert_peer(PeerId(2), "bob", 1);
        assert_eq!(s.next_message_id(PeerId(2)), Some(1));
        assert_eq!(s.next_file_id(PeerId(2)), Some(1));
    }

    #[test]
    fn only_smaller_peers_without_secret_await_offers() {
        let s = Session::new(
            LocalIdentity {
                id: PeerId(5),
                name: "me".into(),
                level: 1,
            },
            3,
        );
        s.upsert_peer(PeerId(2), "a", 1);
        s.upsert_peer(PeerId(3), "b", 1);
        s.upsert_peer(PeerId(9), "c", 1);
        s.install_secret(PeerId(3), SharedKey::render(4));
        assert_eq!(s.peers_awaiting_offer(), vec![PeerId(2)]);
        assert!(s.remove_secret(PeerId(3)));
        assert!(!s.remove_secret(PeerId(3)));
        assert_eq!(s.peers_awaiting_offer(), vec![PeerId(2), PeerId(3)]);
    }

    #[test]
    fn inbound_duplicates_detected() {
        let s = session(3);
        s.upsert_peer(PeerId(2), "bob", 1);
        assert!(s.note_inbound_message(PeerId(2), 7));
        assert!(!s.note_inbound_message(PeerId(2), 7));
        assert!(s.note_inbound_message(PeerId(2), 8));
        s.with_peer(PeerId(2), Peer::clear_inbound);
        assert!(s.note_inbound_message(PeerId(2), 7));
    }

    #[test]
    fn history_tracks_delivery() {
        let s = session(3);
        s.record_outbound(PeerId(2), 0, "hi");
        s.record_inbound(PeerId(2), 5, "hey");
        assert!(s.mark_delivered(PeerId(2), 0));
        assert!(!s.mark_delivered(PeerId(2), 5));
        let h = s.chat_history(PeerId(2));
        assert_eq!(h.len(), 2);
        assert!(h[0].delivered);
        assert_eq!(h[1].direction, Direction::Incoming);
        assert!(s.chat_history(PeerId(3)).is_empty());
    }
}
