//! Shared-secret packet authentication
//!
//! Every datagram is framed as:
//!
//! ```text
//! +-------+---------+----------+------------+-------------+------+--------+---------+
//! | magic | version | salt_len | digest_len | payload_len | salt | digest | payload |
//! |  4B   |   1B    |    1B    |     1B     |   2B (BE)   |  ..  |   ..   |   ..    |
//! +-------+---------+----------+------------+-------------+------+--------+---------+
//! ```
//!
//! The digest is HMAC-SHA256 over `version || salt || payload`, keyed with
//! the cluster secret. Anyone holding the secret can forge packets; the
//! scheme only keeps outsiders from injecting membership state.

use crate::{GossipError, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Current signature format version
pub const SIGNATURE_VERSION: u8 = 1;

/// Datagram prefix identifying swim packets
pub const MAGIC: &[u8; 4] = b"SWIM";

/// Random salt length per packet
pub const SALT_LEN: usize = 16;

/// HMAC-SHA256 digest length
pub const DIGEST_LEN: usize = 32;

/// Fixed header length before the salt
pub const HEADER_LEN: usize = MAGIC.len() + 1 + 1 + 1 + 2;

/// Reasons a signed datagram is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("datagram truncated ({0} bytes)")]
    Truncated(usize),

    #[error("bad magic prefix")]
    BadMagic,

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("unexpected salt or digest length")]
    BadLength,

    #[error("digest mismatch")]
    BadDigest,

    #[error("payload too large to sign ({0} bytes)")]
    PayloadTooLarge(usize),
}

/// Signs and verifies datagrams with the cluster secret
#[derive(Clone)]
pub struct Signatures {
    mac: HmacSha256,
    version: u8,
}

impl Signatures {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(GossipError::Configuration(
                "cluster secret cannot be empty".to_string(),
            ));
        }

        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| GossipError::Configuration(format!("invalid secret: {}", e)))?;

        Ok(Self {
            mac,
            version: SIGNATURE_VERSION,
        })
    }

    /// Override the embedded version tag, used when rotating secrets or formats
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Frame `payload` with a fresh salt and its digest
    pub fn sign(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, SignatureError> {
        let payload_len = u16::try_from(payload.len())
            .map_err(|_| SignatureError::PayloadTooLarge(payload.len()))?;

        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let digest = self.digest(&salt, payload);

        let mut out = Vec::with_capacity(HEADER_LEN + SALT_LEN + DIGEST_LEN + payload.len());
        out.extend_from_slice(MAGIC);
        out.push(self.version);
        out.push(SALT_LEN as u8);
        out.push(DIGEST_LEN as u8);
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&digest);
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Check the framing and digest, returning the payload
    pub fn verify<'a>(&self, data: &'a [u8]) -> std::result::Result<&'a [u8], SignatureError> {
        if data.len() < HEADER_LEN {
            return Err(SignatureError::Truncated(data.len()));
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(SignatureError::BadMagic);
        }

        let found = data[4];
        if found != self.version {
            return Err(SignatureError::VersionMismatch {
                expected: self.version,
                found,
            });
        }

        let salt_len = data[5] as usize;
        let digest_len = data[6] as usize;
        let payload_len = u16::from_be_bytes([data[7], data[8]]) as usize;
        if salt_len != SALT_LEN || digest_len != DIGEST_LEN {
            return Err(SignatureError::BadLength);
        }

        let digest_start = HEADER_LEN + salt_len;
        let payload_start = digest_start + digest_len;
        if data.len() != payload_start + payload_len {
            return Err(SignatureError::Truncated(data.len()));
        }

        let salt = &data[HEADER_LEN..digest_start];
        let digest = &data[digest_start..payload_start];
        let payload = &data[payload_start..];

        let mut mac = self.mac.clone();
        mac.update(&[self.version]);
        mac.update(salt);
        mac.update(payload);
        mac.verify_slice(digest)
            .map_err(|_| SignatureError::BadDigest)?;

        Ok(payload)
    }

    fn digest(&self, salt: &[u8], payload: &[u8]) -> [u8; DIGEST_LEN] {
        let mut mac = self.mac.clone();
        mac.update(&[self.version]);
        mac.update(salt);
        mac.update(payload);
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }
}

impl fmt::Debug for Signatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signatures")
            .field("secret", &"<redacted>")
            .field("version", &self.version)
            .finish()
    }
}
