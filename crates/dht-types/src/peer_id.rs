//! 160-bit peer identifier.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::TypesError;

/// Width of a peer identifier in bytes.
pub const PEER_ID_BYTES: usize = 20;

/// Width of a peer identifier in bits.
pub const PEER_ID_BITS: usize = PEER_ID_BYTES * 8;

/// Fixed-width 160-bit identifier of a peer.
///
/// Stored big-endian, so the derived `Ord` over the byte array is the order
/// of the unsigned integer the bytes represent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_BYTES]);

impl PeerId {
    /// The all-zero identifier.
    pub const ZERO: PeerId = PeerId([0u8; PEER_ID_BYTES]);

    /// The largest identifier (all bits set).
    pub const MAX: PeerId = PeerId([0xff; PEER_ID_BYTES]);

    /// Create an identifier from its raw big-endian bytes.
    #[must_use]
    pub const fn new(bytes: [u8; PEER_ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Create an identifier from a slice that must be exactly 20 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypesError> {
        let raw: [u8; PEER_ID_BYTES] =
            bytes.try_into().map_err(|_| TypesError::InvalidLength {
                expected: PEER_ID_BYTES,
                actual: bytes.len(),
            })?;
        Ok(Self(raw))
    }

    /// Draw a random identifier from the thread-local generator.
    #[must_use]
    pub fn random() -> Self {
        Self::from_rng(&mut rand::thread_rng())
    }

    /// Draw a random identifier from the given source.
    ///
    /// Seeded generators produce reproducible identifiers, which the test
    /// suites rely on.
    pub fn from_rng<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; PEER_ID_BYTES];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Derive an identifier from public key material (SHA-256, truncated).
    #[must_use]
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut bytes = [0u8; PEER_ID_BYTES];
        bytes.copy_from_slice(&digest[..PEER_ID_BYTES]);
        Self(bytes)
    }

    /// Parse a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypesError> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| TypesError::InvalidHex(e.to_string()))?;
        Self::from_slice(&raw)
    }

    /// Raw big-endian bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PEER_ID_BYTES] {
        &self.0
    }

    /// Lowercase hex rendering without prefix.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to another identifier.
    #[must_use]
    pub fn xor(&self, other: &PeerId) -> PeerId {
        let mut out = [0u8; PEER_ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        PeerId(out)
    }

    /// Number of leading zero bits.
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut zeros = 0;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        zeros
    }

    /// True for the all-zero identifier.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first 4 bytes are enough to tell peers apart in logs
        write!(f, "PeerId({}..)", hex::encode(&self.0[..4]))
    }
}

impl FromStr for PeerId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; PEER_ID_BYTES]> for PeerId {
    fn from(bytes: [u8; PEER_ID_BYTES]) -> Self {
        Self(bytes)
    }
}
