//! Node identity — an RSA keypair and the peer ID derived from it.
//!
//! Determinism is controlled entirely by the randomness source the caller
//! passes in: a seeded RNG yields the same [`PeerId`] on every run, the OS
//! RNG yields a fresh one.

use crate::error::{WireError, WireResult};

use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use rand::{CryptoRng, RngCore};
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::RsaPrivateKey;
use std::fmt;

/// Modulus size of every generated identity key.
pub const RSA_KEY_BITS: usize = 2048;

/// A keypair plus the peer ID bound to its public half. Immutable.
#[derive(Clone)]
pub struct Identity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a 2048-bit RSA identity from the given randomness source.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> WireResult<Self> {
        Self::generate_rsa(rng, RSA_KEY_BITS)
    }

    pub(crate) fn generate_rsa<R: RngCore + CryptoRng>(
        rng: &mut R,
        bits: usize,
    ) -> WireResult<Self> {
        let key = RsaPrivateKey::new(rng, bits)
            .map_err(|e| WireError::KeyGeneration(e.to_string()))?;
        let key = larger_prime_first(key)?;
        let der = key
            .to_pkcs8_der()
            .map_err(|e| WireError::KeyGeneration(e.to_string()))?;

        let mut bytes = der.as_bytes().to_vec();
        let keypair = Keypair::rsa_from_pkcs8(&mut bytes)
            .map_err(|e| WireError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_keypair(keypair))
    }

    /// Wrap an existing keypair.
    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    /// The full keypair, private half included.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Order the primes p > q, as the PKCS#8 importer's CRT precomputation expects.
fn larger_prime_first(key: RsaPrivateKey) -> WireResult<RsaPrivateKey> {
    let primes = key.primes();
    if primes.len() != 2 || primes[0] > primes[1] {
        return Ok(key);
    }

    let ordered = vec![primes[1].clone(), primes[0].clone()];
    let mut swapped =
        RsaPrivateKey::from_components(key.n().clone(), key.e().clone(), key.d().clone(), ordered)
            .map_err(|e| WireError::KeyGeneration(e.to_string()))?;
    swapped
        .precompute()
        .map_err(|e| WireError::KeyGeneration(e.to_string()))?;
    Ok(swapped)
}
