//! Presence: periodic pulses, TTL aging and the key-exchange negotiation that presence
//! discovery triggers.

use std::sync::Arc;

use tracing::{debug, info};

use crate::dh::{should_initiate, KeyAgreement, Parameters, PARAMETER_TABLE};
use crate::event::{Action, Event};
use crate::protocol::{ExchangeStep, KeyExchange, Packet, Payload, PeerId, Pulse};
use crate::session::{Session, Upsert};
use crate::wire;

pub struct PresenceEngine {
    session: Arc<Session>,
}

/// What one key-exchange step produced.
#[derive(Debug, Default)]
pub struct ExchangeOutcome {
    pub actions: Vec<Action>,
    /// An earlier agreement with the sender was replaced, so anything remembered about its
    /// previous session is stale.
    pub renewed: bool,
}

impl ExchangeOutcome {
    fn quiet() -> Self {
        Self::default()
    }
}

impl PresenceEngine {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Encoded pulse announcing the local identity.
    pub fn pulse(&self) -> Vec<u8> {
        let me = self.session.identity();
        let packet = Packet::new(
            self.session.next_sequence_number(),
            Payload::Pulse(Pulse {
                sender: me.id,
                level: me.level,
                name: me.name.clone(),
            }),
        );
        wire::encode(&packet)
    }

    /// One heartbeat: announce ourselves, re-send unanswered offers, ask for missing ones,
    /// age out silent peers.
    pub fn tick(&self) -> Vec<Action> {
        let mut actions = vec![Action::Transmit(self.pulse())];
        for (peer, offer) in self.session.outstanding_offers() {
            debug!(%peer, "re-sending key exchange offer");
            actions.push(Action::Transmit(self.exchange_datagram(peer, offer)));
        }
        for peer in self.session.peers_awaiting_offer() {
            debug!(%peer, "requesting key exchange");
            actions.push(Action::Transmit(
                self.exchange_datagram(peer, ExchangeStep::Rekey),
            ));
        }
        for peer in self.session.age_all_peers() {
            info!(%peer, "peer expired");
            actions.push(Action::Notify(Event::PeerExpired { peer }));
        }
        actions
    }

    pub fn on_pulse(&self, pulse: &Pulse) -> Vec<Action> {
        let mut actions = Vec::new();
        let upsert = self
            .session
            .upsert_peer(pulse.sender, &pulse.name, pulse.level);
        if upsert == Upsert::Refreshed {
            return actions;
        }
        info!(peer = %pulse.sender, name = %pulse.name, "peer discovered");
        actions.push(Action::Notify(Event::PeerDiscovered {
            peer: pulse.sender,
            name: pulse.name.clone(),
        }));
        if should_initiate(self.session.local_id(), pulse.sender) {
            let offer = self.session.with_peer(pulse.sender, |peer| {
                let state = KeyAgreement::initiate(&mut rand::thread_rng());
                let offer = state.offer();
                peer.agreement = Some(state);
                offer
            });
            if let Some(offer) = offer {
                debug!(peer = %pulse.sender, "initiating key exchange");
                actions.push(Action::Transmit(
                    self.exchange_datagram(pulse.sender, offer),
                ));
            }
        } else {
            // The initiator may still hold a secret we no longer have.
            actions.push(Action::Transmit(
                self.exchange_datagram(pulse.sender, ExchangeStep::Rekey),
            ));
        }
        actions
    }

    pub fn on_key_exchange(&self, kx: &KeyExchange) -> ExchangeOutcome {
        match kx.step {
            ExchangeStep::Offer {
                prime,
                generator,
                half_key,
            } => self.on_offer(kx.sender, Parameters { prime, generator }, half_key),
            ExchangeStep::Reply { half_key } => ExchangeOutcome {
                actions: self.on_reply(kx.sender, half_key),
                renewed: false,
            },
            ExchangeStep::Rekey => self.on_rekey(kx.sender),
        }
    }

    fn on_offer(&self, from: PeerId, params: Parameters, remote_half: u8) -> ExchangeOutcome {
        if should_initiate(self.session.local_id(), from) {
            debug!(peer = %from, "ignoring offer from peer that should respond");
            return ExchangeOutcome::quiet();
        }
        if !PARAMETER_TABLE.contains(&(params.prime, params.generator)) {
            debug!(peer = %from, prime = params.prime, "ignoring offer with unknown parameters");
            return ExchangeOutcome::quiet();
        }
        let outcome = self.session.with_peer(from, |peer| {
            // Same offer again: our reply was lost. Answer without touching state.
            if let Some(state) = peer
                .agreement
                .as_ref()
                .filter(|s| s.matches(params) && s.remote_half() == Some(remote_half))
            {
                return (state.reply(), None, false);
            }
            let renewed = peer.agreement.is_some();
            if renewed {
                peer.clear_inbound();
            }
            let (state, key) = KeyAgreement::respond(&mut rand::thread_rng(), params, remote_half);
            let reply = state.reply();
            peer.agreement = Some(state);
            (reply, Some(key), renewed)
        });
        let Some((reply, key, renewed)) = outcome else {
            debug!(peer = %from, "offer from unknown peer");
            return ExchangeOutcome::quiet();
        };
        let mut actions = Vec::new();
        if let Some(key) = key {
            self.session.install_secret(from, key);
            info!(peer = %from, renewed, "shared secret established");
            actions.push(Action::Notify(Event::SecretEstablished { peer: from }));
        }
        actions.push(Action::Transmit(self.exchange_datagram(from, reply)));
        ExchangeOutcome { actions, renewed }
    }

    /// The responder holds no secret with us. Re-send a pending offer, or start over.
    fn on_rekey(&self, from: PeerId) -> ExchangeOutcome {
        if !should_initiate(self.session.local_id(), from) {
            debug!(peer = %from, "ignoring rekey from peer that should offer");
            return ExchangeOutcome::quiet();
        }
        let outcome = self.session.with_peer(from, |peer| {
            if let Some(state) = peer.agreement.as_ref().filter(|s| !s.is_acknowledged()) {
                return (state.offer(), false);
            }
            let renewed = peer.agreement.is_some();
            if renewed {
                peer.clear_inbound();
            }
            let state = KeyAgreement::initiate(&mut rand::thread_rng());
            let offer = state.offer();
            peer.agreement = Some(state);
            (offer, renewed)
        });
        let Some((offer, renewed)) = outcome else {
            debug!(peer = %from, "rekey from unknown peer");
            return ExchangeOutcome::quiet();
        };
        if renewed {
            self.session.remove_secret(from);
            info!(peer = %from, "peer lost our secret, renegotiating");
        }
        ExchangeOutcome {
            actions: vec![Action::Transmit(self.exchange_datagram(from, offer))],
            renewed,
        }
    }

    fn on_reply(&self, from: PeerId, remote_half: u8) -> Vec<Action> {
        let key = self
            .session
            .with_peer(from, |peer| {
                peer.agreement
                    .as_mut()
                    .and_then(|state| state.complete(remote_half))
            })
            .flatten();
        match key {
            Some(key) => {
                self.session.install_secret(from, key);
                info!(peer = %from, "shared secret established");
                vec![Action::Notify(Event::SecretEstablished { peer: from })]
            }
            None => {
                debug!(peer = %from, "discarding reply");
                Vec::new()
            }
        }
    }

    fn exchange_datagram(&self, to: PeerId, step: ExchangeStep) -> Vec<u8> {
        let packet = Packet::new(
            self.session.next_sequence_number(),
            Payload::KeyExchange(KeyExchange {
                sender: self.session.local_id(),
                recipient: to,
                step,
            }),
        );
        wire::encode(&packet)
    }
}
