//! Reliable delivery: acknowledgable packets stay pending until their ack arrives or the
//! retry budget runs out.
//!
//! One schedule serves every pending entry. The host calls [`DeliveryEngine::poll_retries`]
//! from a single periodic task; due entries are re-sent with a fresh sequence number and
//! the same delivery key. Lifecycle per entry: `Sent -> Acknowledged | Exhausted`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::protocol::{Packet, Payload, PeerId};
use crate::session::Session;
use crate::wire;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Finished deliveries whose outcome stays queryable through [`DeliveryEngine::state`].
const FINISHED_MEMORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Retransmissions after the original send.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Logical identity of a delivery; stable across retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryKey {
    pub peer: PeerId,
    pub message_id: u16,
    pub chunk_index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Sent,
    Acknowledged,
    Exhausted,
}

#[derive(Debug)]
struct PendingDelivery {
    payload: Payload,
    retries: u32,
    ticket: u64,
}

/// Result of one retry poll for a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Resend { key: DeliveryKey, datagram: Vec<u8> },
    Exhausted { key: DeliveryKey },
}

#[derive(Default)]
struct Schedule {
    entries: HashMap<DeliveryKey, PendingDelivery>,
    /// Min-heap of (due, ticket, key). Tickets of removed or rescheduled entries go stale.
    timers: BinaryHeap<Reverse<(Instant, u64, DeliveryKey)>>,
    next_ticket: u64,
    finished: HashMap<DeliveryKey, DeliveryState>,
    finished_order: VecDeque<DeliveryKey>,
}

impl Schedule {
    fn arm(&mut self, key: DeliveryKey, due: Instant) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.timers.push(Reverse((due, ticket, key)));
        ticket
    }

    fn finish(&mut self, key: DeliveryKey, state: DeliveryState) {
        if self.finished.insert(key, state).is_none() {
            if self.finished_order.len() == FINISHED_MEMORY {
                if let Some(oldest) = self.finished_order.pop_front() {
                    self.finished.remove(&oldest);
                }
            }
            self.finished_order.push_back(key);
        }
    }
}

pub struct DeliveryEngine {
    session: Arc<Session>,
    policy: RetryPolicy,
    schedule: Mutex<Schedule>,
}

impl DeliveryEngine {
    pub fn new(session: Arc<Session>, policy: RetryPolicy) -> Self {
        Self {
            session,
            policy,
            schedule: Mutex::new(Schedule::default()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encode `payload` with a fresh sequence number and register it as pending.
    /// Returns the datagram for the first transmission.
    pub fn send(&self, key: DeliveryKey, payload: Payload, now: Instant) -> Vec<u8> {
        let datagram = self.encode(&payload);
        let mut schedule = self.schedule();
        let ticket = schedule.arm(key, now + self.policy.interval);
        // A reused key starts over; its old outcome no longer applies.
        if schedule.finished.remove(&key).is_some() {
            schedule.finished_order.retain(|k| *k != key);
        }
        schedule.entries.insert(
            key,
            PendingDelivery {
                payload,
                retries: 0,
                ticket,
            },
        );
        debug!(peer = %key.peer, message_id = key.message_id, chunk = key.chunk_index, "pending");
        datagram
    }

    /// Remove the entry matching an arrived ack. Returns `false` for duplicates and
    /// unknown keys.
    pub fn acknowledge(&self, key: DeliveryKey) -> bool {
        let mut schedule = self.schedule();
        if schedule.entries.remove(&key).is_none() {
            return false;
        }
        schedule.finish(key, DeliveryState::Acknowledged);
        true
    }

    /// Drop every pending entry of one logical message (e.g. the other chunks of a failed
    /// file). Returns how many were dropped.
    pub fn cancel_message(&self, peer: PeerId, message_id: u16) -> usize {
        let mut schedule = self.schedule();
        let mut dropped: Vec<DeliveryKey> = schedule
            .entries
            .keys()
            .filter(|k| k.peer == peer && k.message_id == message_id)
            .copied()
            .collect();
        dropped.sort();
        for key in &dropped {
            schedule.entries.remove(key);
            schedule.finish(*key, DeliveryState::Exhausted);
        }
        dropped.len()
    }

    /// Fire every timer due at `now`.
    pub fn poll_retries(&self, now: Instant) -> Vec<RetryOutcome> {
        let mut out = Vec::new();
        let mut schedule = self.schedule();
        while let Some(Reverse((due, ticket, key))) = schedule.timers.peek().copied() {
            if due > now {
                break;
            }
            schedule.timers.pop();
            let live = schedule
                .entries
                .get(&key)
                .map(|e| (e.ticket == ticket, e.retries));
            match live {
                Some((true, retries)) if retries >= self.policy.max_retries => {
                    schedule.entries.remove(&key);
                    schedule.finish(key, DeliveryState::Exhausted);
                    warn!(
                        peer = %key.peer,
                        message_id = key.message_id,
                        chunk = key.chunk_index,
                        retries,
                        "delivery exhausted"
                    );
                    out.push(RetryOutcome::Exhausted { key });
                }
                Some((true, _)) => {
                    let ticket = schedule.arm(key, now + self.policy.interval);
                    let Some(entry) = schedule.entries.get_mut(&key) else {
                        continue;
                    };
                    entry.retries += 1;
                    entry.ticket = ticket;
                    let retries = entry.retries;
                    let datagram = self.encode(&entry.payload);
                    debug!(peer = %key.peer, message_id = key.message_id, retries, "retransmit");
                    out.push(RetryOutcome::Resend { key, datagram });
                }
                // Acknowledged, cancelled or rescheduled since this timer was armed.
                _ => {}
            }
        }
        out
    }

    /// `Sent` while pending, then the outcome for as long as it is remembered.
    pub fn state(&self, key: DeliveryKey) -> Option<DeliveryState> {
        let schedule = self.schedule();
        if schedule.entries.contains_key(&key) {
            return Some(DeliveryState::Sent);
        }
        schedule.finished.get(&key).copied()
    }

    pub fn retries(&self, key: DeliveryKey) -> Option<u32> {
        self.schedule().entries.get(&key).map(|e| e.retries)
    }

    pub fn pending_count(&self) -> usize {
        self.schedule().entries.len()
    }

    fn encode(&self, payload: &Payload) -> Vec<u8> {
        wire::encode(&Packet::new(
            self.session.next_sequence_number(),
            payload.clone(),
        ))
    }
}
