//! Several in-process nodes on a simulated multicast group.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use murmur_core::protocol::{ExchangeStep, KeyExchange, Payload};
use murmur_core::{
    decode, Action, Direction, Event, LocalIdentity, MurmurCore, PacketType, PeerId,
    ProtocolConfig,
};

struct Group {
    nodes: Vec<MurmurCore>,
    events: Vec<Vec<Event>>,
    now: Instant,
    /// Returns true to drop a datagram sent by node `from` carrying `payload`.
    lossy: Box<dyn FnMut(usize, &Payload) -> bool>,
}

impl Group {
    fn new(ids: &[u16]) -> Self {
        let nodes = ids
            .iter()
            .map(|&id| {
                MurmurCore::new(
                    LocalIdentity {
                        id: PeerId(id),
                        name: format!("node{id}"),
                        level: 1,
                    },
                    &ProtocolConfig {
                        chunk_size: 1000,
                        ..ProtocolConfig::default()
                    },
                )
            })
            .collect::<Vec<_>>();
        Self {
            events: vec![Vec::new(); nodes.len()],
            nodes,
            now: Instant::now(),
            lossy: Box::new(|_, _| false),
        }
    }

    /// Multicast every datagram in `actions` from node `from`, following replies to quiescence.
    fn deliver(&mut self, from: usize, actions: Vec<Action>) {
        let mut queue = VecDeque::from([(from, actions)]);
        while let Some((src, actions)) = queue.pop_front() {
            for action in actions {
                match action {
                    Action::Notify(e) => self.events[src].push(e),
                    Action::Transmit(d) => {
                        let packet = decode(&d).unwrap();
                        if (self.lossy)(src, &packet.payload) {
                            continue;
                        }
                        for dst in 0..self.nodes.len() {
                            if dst != src {
                                let out = self.nodes[dst].on_datagram(&d, self.now);
                                queue.push_back((dst, out));
                            }
                        }
                    }
                }
            }
        }
    }

    fn heartbeat_all(&mut self) {
        for i in 0..self.nodes.len() {
            let out = self.nodes[i].heartbeat(self.now);
            self.deliver(i, out);
        }
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        for i in 0..self.nodes.len() {
            let out = self.nodes[i].poll_retries(self.now);
            self.deliver(i, out);
        }
    }

    fn events_of(&self, node: usize) -> &[Event] {
        &self.events[node]
    }
}

#[test]
fn every_pair_establishes_a_secret() {
    let mut g = Group::new(&[3, 8, 12]);
    g.heartbeat_all();
    g.heartbeat_all();
    for node in &g.nodes {
        let peers = node.known_peers();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|p| p.has_secret), "{peers:?}");
    }
    let k = |a: usize, b: u16| g.nodes[a].session().secret_for(PeerId(b)).unwrap();
    assert_eq!(k(0, 8), k(1, 3));
    assert_eq!(k(0, 12), k(2, 3));
    assert_eq!(k(1, 12), k(2, 8));
}

#[test]
fn lost_reply_is_recovered_by_offer_resend() {
    let mut g = Group::new(&[1, 2]);
    let mut replies_dropped = 0;
    g.lossy = Box::new(move |from, p| {
        let is_reply = matches!(
            p,
            Payload::KeyExchange(KeyExchange {
                step: ExchangeStep::Reply { .. },
                ..
            })
        );
        if from == 1 && is_reply && replies_dropped < 2 {
            replies_dropped += 1;
            return true;
        }
        false
    });
    g.heartbeat_all();
    assert!(!g.nodes[0].known_peers()[0].has_secret);
    g.heartbeat_all();
    g.heartbeat_all();
    assert!(g.nodes[0].known_peers()[0].has_secret);
    assert!(g.nodes[1].known_peers()[0].has_secret);
}

#[test]
fn lost_message_is_retransmitted_and_surfaces_once() {
    let mut g = Group::new(&[1, 2]);
    g.heartbeat_all();
    g.heartbeat_all();
    let mut dropped = false;
    g.lossy = Box::new(move |from, p| {
        if from == 0 && p.packet_type() == PacketType::EncryptedMessage && !dropped {
            dropped = true;
            return true;
        }
        false
    });
    let out = g.nodes[0].send_text(PeerId(2), "are you there", g.now).unwrap();
    g.deliver(0, out);
    assert!(g.events_of(1).iter().all(|e| !matches!(e, Event::MessageReceived { .. })));

    g.advance(Duration::from_millis(1000));
    g.advance(Duration::from_millis(1000));
    let received: Vec<_> = g
        .events_of(1)
        .iter()
        .filter(|e| matches!(e, Event::MessageReceived { .. }))
        .collect();
    assert_eq!(received.len(), 1);
    assert!(g.events_of(0).contains(&Event::MessageDelivered {
        peer: PeerId(2),
        message_id: 0
    }));
    assert_eq!(g.nodes[0].delivery().pending_count(), 0);
}

#[test]
fn lost_ack_causes_duplicate_that_is_suppressed() {
    let mut g = Group::new(&[1, 2]);
    g.heartbeat_all();
    g.heartbeat_all();
    let mut dropped = false;
    g.lossy = Box::new(move |from, p| {
        if from == 1 && p.packet_type() == PacketType::Acknowledgement && !dropped {
            dropped = true;
            return true;
        }
        false
    });
    let out = g.nodes[0].send_text(PeerId(2), "once", g.now).unwrap();
    g.deliver(0, out);
    g.advance(Duration::from_millis(1000));
    assert_eq!(g.nodes[1].chat_history(PeerId(1)).len(), 1);
    assert!(g.nodes[0].chat_history(PeerId(2))[0].delivered);
}

#[test]
fn file_survives_lost_chunk() {
    let mut g = Group::new(&[1, 2]);
    g.heartbeat_all();
    g.heartbeat_all();
    let mut chunks_seen = 0;
    g.lossy = Box::new(move |from, p| {
        if from == 0 && p.packet_type() == PacketType::FileChunk {
            chunks_seen += 1;
            return chunks_seen == 2;
        }
        false
    });
    let data: Vec<u8> = (0..4500u32).map(|i| (i * 7 % 256) as u8).collect();
    let out = g.nodes[0]
        .send_file_bytes(PeerId(2), "notes.txt", &data, g.now)
        .unwrap();
    assert_eq!(out.len(), 5);
    g.deliver(0, out);
    assert!(!g
        .events_of(1)
        .iter()
        .any(|e| matches!(e, Event::FileReceived { .. })));

    g.advance(Duration::from_millis(1000));
    let file = g.events_of(1).iter().find_map(|e| match e {
        Event::FileReceived { name, data, .. } => Some((name.clone(), data.clone())),
        _ => None,
    });
    assert_eq!(file, Some(("notes.txt".to_string(), data)));
    assert!(g.events_of(0).contains(&Event::FileTransferComplete {
        peer: PeerId(2),
        file_id: 0,
        direction: Direction::Outgoing,
    }));
    let progress: Vec<u64> = g
        .events_of(1)
        .iter()
        .filter_map(|e| match e {
            Event::FileTransferProgress { transferred, .. } => Some(*transferred),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] < w[1]), "{progress:?}");
}

#[test]
fn unreachable_peer_reports_failure_once_per_file() {
    let mut g = Group::new(&[1, 2]);
    g.heartbeat_all();
    g.heartbeat_all();
    g.lossy = Box::new(|from, p| from == 0 && p.packet_type() == PacketType::FileChunk);
    let out = g.nodes[0]
        .send_file_bytes(PeerId(2), "lost.bin", &[9u8; 2500], g.now)
        .unwrap();
    g.deliver(0, out);
    for _ in 0..8 {
        g.advance(Duration::from_millis(1000));
    }
    let failed = g
        .events_of(0)
        .iter()
        .filter(|e| matches!(e, Event::MessageDeliveryFailed { .. }))
        .count();
    assert_eq!(failed, 1);
    assert_eq!(g.nodes[0].delivery().pending_count(), 0);
}

#[test]
fn silent_peer_expires_and_rejoins_with_new_secret() {
    let mut g = Group::new(&[1, 2]);
    g.heartbeat_all();
    g.heartbeat_all();
    g.lossy = Box::new(|from, _| from == 1);
    for _ in 0..5 {
        g.heartbeat_all();
    }
    assert!(g.events_of(0).contains(&Event::PeerExpired { peer: PeerId(2) }));
    assert!(g.nodes[0].known_peers().is_empty());
    assert!(g.nodes[0].session().secret_for(PeerId(2)).is_none());

    g.lossy = Box::new(|_, _| false);
    g.heartbeat_all();
    g.heartbeat_all();
    let rediscovered = g
        .events_of(0)
        .iter()
        .filter(|e| **e == Event::PeerDiscovered { peer: PeerId(2), name: "node2".into() })
        .count();
    assert_eq!(rediscovered, 2);
    assert!(g.nodes[0].known_peers()[0].has_secret);
    let out = g.nodes[0].send_text(PeerId(2), "welcome back", g.now).unwrap();
    g.deliver(0, out);
    assert!(g.events_of(1).iter().any(
        |e| matches!(e, Event::MessageReceived { text, .. } if text == "welcome back")
    ));
}

#[test]
fn global_messages_are_not_acknowledged() {
    let mut g = Group::new(&[1, 2, 3]);
    g.heartbeat_all();
    let out = g.nodes[2].send_global_text("lunch?").unwrap();
    for a in &out {
        let p = decode(a.datagram().unwrap()).unwrap();
        assert!(matches!(p.payload, Payload::GlobalMessage(_)));
    }
    g.deliver(2, out);
    for node in 0..2 {
        assert!(g.events_of(node).contains(&Event::GlobalMessageReceived {
            peer: PeerId(3),
            text: "lunch?".into()
        }));
    }
    assert_eq!(g.nodes[2].delivery().pending_count(), 0);
}

fn received_texts(g: &Group, node: usize) -> Vec<String> {
    g.events_of(node)
        .iter()
        .filter_map(|e| match e {
            Event::MessageReceived { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn received_files(g: &Group, node: usize) -> Vec<String> {
    g.events_of(node)
        .iter()
        .filter_map(|e| match e {
            Event::FileReceived { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn responder_only_expiry_rekeys() {
    let mut g = Group::new(&[1, 2]);
    g.heartbeat_all();
    g.heartbeat_all();
    // Node 2 stops hearing node 1 and forgets it; node 1 still hears node 2.
    g.lossy = Box::new(|from, _| from == 0);
    for _ in 0..5 {
        g.heartbeat_all();
    }
    assert!(g.events_of(1).contains(&Event::PeerExpired { peer: PeerId(1) }));
    assert!(g.nodes[0].session().secret_for(PeerId(2)).is_some());

    g.lossy = Box::new(|_, _| false);
    g.heartbeat_all();
    let k1 = g.nodes[0].session().secret_for(PeerId(2)).unwrap();
    let k2 = g.nodes[1].session().secret_for(PeerId(1)).unwrap();
    assert_eq!(k1, k2);

    let out = g.nodes[0].send_text(PeerId(2), "still here", g.now).unwrap();
    g.deliver(0, out);
    let out = g.nodes[1].send_text(PeerId(1), "me too", g.now).unwrap();
    g.deliver(1, out);
    assert_eq!(received_texts(&g, 1), vec!["still here".to_string()]);
    assert_eq!(received_texts(&g, 0), vec!["me too".to_string()]);
}

#[test]
fn initiator_only_expiry_keeps_later_transfers() {
    let mut g = Group::new(&[1, 2]);
    g.heartbeat_all();
    g.heartbeat_all();
    let out = g.nodes[0].send_text(PeerId(2), "first", g.now).unwrap();
    g.deliver(0, out);
    let out = g.nodes[0]
        .send_file_bytes(PeerId(2), "one.txt", &[1u8; 1500], g.now)
        .unwrap();
    g.deliver(0, out);

    // Node 1 stops hearing node 2 and forgets it; node 2 keeps the old session.
    g.lossy = Box::new(|from, _| from == 1);
    for _ in 0..5 {
        g.heartbeat_all();
    }
    assert!(g.events_of(0).contains(&Event::PeerExpired { peer: PeerId(2) }));

    g.lossy = Box::new(|_, _| false);
    g.heartbeat_all();
    g.heartbeat_all();
    let out = g.nodes[0].send_text(PeerId(2), "second", g.now).unwrap();
    g.deliver(0, out);
    let out = g.nodes[0]
        .send_file_bytes(PeerId(2), "two.txt", &[2u8; 1500], g.now)
        .unwrap();
    g.deliver(0, out);

    assert_eq!(received_texts(&g, 1), vec!["first".to_string(), "second".to_string()]);
    assert_eq!(received_files(&g, 1), vec!["one.txt".to_string(), "two.txt".to_string()]);
    assert_eq!(g.nodes[0].delivery().pending_count(), 0);
}
