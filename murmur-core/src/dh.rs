//! Pairwise Diffie-Hellman over a small demonstration prime table.
//!
//! Known weakness: every prime is below 100 and local secrets fall in `[1, 10]`, so the
//! shared key space is a few dozen values and trivially brute-forced. The table exists to
//! exercise the negotiation protocol, not to protect traffic.

use rand::Rng;

use crate::protocol::{ExchangeStep, PeerId};

/// (prime, primitive root) pairs.
pub const PARAMETER_TABLE: [(u8, u8); 17] = [
    (23, 5),
    (29, 2),
    (31, 3),
    (37, 2),
    (41, 6),
    (43, 3),
    (47, 5),
    (53, 2),
    (59, 2),
    (61, 2),
    (67, 2),
    (71, 7),
    (73, 5),
    (79, 3),
    (83, 2),
    (89, 3),
    (97, 5),
];

/// Upper bound (inclusive) of a locally generated secret exponent.
pub const MAX_SECRET: u8 = 10;

/// Width of the rendered shared secret, which is also the AES-128 key length.
pub const SHARED_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    pub prime: u8,
    pub generator: u8,
}

/// Pick a random entry from the parameter table.
pub fn choose_parameters<R: Rng + ?Sized>(rng: &mut R) -> Parameters {
    let (prime, generator) = PARAMETER_TABLE[rng.gen_range(0..PARAMETER_TABLE.len())];
    Parameters { prime, generator }
}

/// Local secret exponent in `[1, 10]`, kept below `prime - 1`.
pub fn produce_secret_key<R: Rng + ?Sized>(rng: &mut R, prime: u8) -> u8 {
    let upper = MAX_SECRET.min(prime.saturating_sub(2)).max(1);
    rng.gen_range(1..=upper)
}

/// `generator ^ secret mod prime`.
pub fn compute_half_key(generator: u8, secret: u8, prime: u8) -> u8 {
    mod_pow(generator, secret, prime)
}

/// `remote_half_key ^ local_secret mod prime`, rendered as key material.
pub fn compute_shared_secret(remote_half_key: u8, local_secret: u8, prime: u8) -> SharedKey {
    SharedKey::render(mod_pow(remote_half_key, local_secret, prime))
}

fn mod_pow(base: u8, exp: u8, modulus: u8) -> u8 {
    if modulus <= 1 {
        return 0;
    }
    let m = u32::from(modulus);
    let mut result = 1u32;
    let mut b = u32::from(base) % m;
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result = result * b % m;
        }
        b = b * b % m;
        e >>= 1;
    }
    result as u8
}

/// Symmetric key material: the shared value as decimal digits, right-padded with `'0'`
/// to 16 characters.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SharedKey([u8; SHARED_KEY_LEN]);

impl SharedKey {
    pub fn render(value: u8) -> Self {
        let mut out = [b'0'; SHARED_KEY_LEN];
        let digits = value.to_string();
        out[..digits.len()].copy_from_slice(digits.as_bytes());
        SharedKey(out)
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_KEY_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII digits are ever written.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// The smaller ID initiates, so exactly one side of a pair ever picks parameters.
pub fn should_initiate(local: PeerId, remote: PeerId) -> bool {
    local < remote
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Per-peer negotiation state.
#[derive(Debug, Clone)]
pub struct KeyAgreement {
    params: Parameters,
    secret: u8,
    local_half: u8,
    remote_half: Option<u8>,
    acknowledged: bool,
    role: Role,
}

impl KeyAgreement {
    /// Start as initiator with random parameters and secret.
    pub fn initiate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let params = choose_parameters(rng);
        let secret = produce_secret_key(rng, params.prime);
        Self::with_secret(params, secret, Role::Initiator)
    }

    /// Adopt an offer as responder. The offer already carries the initiator's half-key,
    /// so the shared secret is available immediately.
    pub fn respond<R: Rng + ?Sized>(
        rng: &mut R,
        params: Parameters,
        remote_half: u8,
    ) -> (Self, SharedKey) {
        let secret = produce_secret_key(rng, params.prime);
        let mut state = Self::with_secret(params, secret, Role::Responder);
        let key = state.accept_half_key(remote_half);
        (state, key)
    }

    pub fn with_secret(params: Parameters, secret: u8, role: Role) -> Self {
        Self {
            params,
            secret,
            local_half: compute_half_key(params.generator, secret, params.prime),
            remote_half: None,
            acknowledged: false,
            role,
        }
    }

    /// Complete an initiated exchange with the responder's half-key. Returns `None` when
    /// already acknowledged (duplicate reply) or when this side is the responder.
    pub fn complete(&mut self, remote_half: u8) -> Option<SharedKey> {
        if self.acknowledged || self.role != Role::Initiator {
            return None;
        }
        Some(self.accept_half_key(remote_half))
    }

    fn accept_half_key(&mut self, remote_half: u8) -> SharedKey {
        self.remote_half = Some(remote_half);
        self.acknowledged = true;
        compute_shared_secret(remote_half, self.secret, self.params.prime)
    }

    pub fn params(&self) -> Parameters {
        self.params
    }

    pub fn local_half(&self) -> u8 {
        self.local_half
    }

    pub fn remote_half(&self) -> Option<u8> {
        self.remote_half
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether an offer carries the parameters this state was built from.
    pub fn matches(&self, params: Parameters) -> bool {
        self.params == params
    }

    pub fn offer(&self) -> ExchangeStep {
        ExchangeStep::Offer {
            prime: self.params.prime,
            generator: self.params.generator,
            half_key: self.local_half,
        }
    }

    pub fn reply(&self) -> ExchangeStep {
        ExchangeStep::Reply {
            half_key: self.local_half,
        }
    }
}
