//! Packet packing and signed framing

use crate::packet::{GossipEntry, Packet};
use crate::sign::{Signatures, DIGEST_LEN, HEADER_LEN, SALT_LEN};
use crate::Result;
use bincode::Options;
use std::sync::Arc;

/// Bytes added to every packed payload by the signed framing
pub const SIGNATURE_OVERHEAD: usize = HEADER_LEN + SALT_LEN + DIGEST_LEN;

/// Converts packets to and from bytes
pub trait Pack: Send + Sync {
    fn pack(&self, packet: &Packet) -> Result<Vec<u8>>;

    /// Malformed or truncated input must fail, never panic
    fn unpack(&self, bytes: &[u8]) -> Result<Packet>;
}

/// bincode packing with a hard size limit
#[derive(Debug, Clone)]
pub struct BincodePack {
    limit: u64,
}

impl BincodePack {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit as u64,
        }
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new().with_limit(self.limit)
    }
}

impl Default for BincodePack {
    fn default() -> Self {
        Self::new(u16::MAX as usize)
    }
}

impl Pack for BincodePack {
    fn pack(&self, packet: &Packet) -> Result<Vec<u8>> {
        Ok(self.options().serialize(packet)?)
    }

    fn unpack(&self, bytes: &[u8]) -> Result<Packet> {
        Ok(self.options().deserialize(bytes)?)
    }
}

/// Packs and signs outgoing packets, verifies and unpacks incoming ones
#[derive(Clone)]
pub struct Codec {
    pack: Arc<dyn Pack>,
    signatures: Signatures,
}

impl Codec {
    pub fn new(pack: Arc<dyn Pack>, signatures: Signatures) -> Self {
        Self { pack, signatures }
    }

    /// bincode packing keyed with the given secret
    pub fn with_secret(secret: impl AsRef<[u8]>) -> Result<Self> {
        Ok(Self::new(
            Arc::new(BincodePack::default()),
            Signatures::new(secret)?,
        ))
    }

    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        let payload = self.pack.pack(packet)?;
        Ok(self.signatures.sign(&payload)?)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Packet> {
        let payload = self.signatures.verify(bytes)?;
        self.pack.unpack(payload)
    }

    /// Number of leading `entries` that fit in one datagram of `max_size`
    /// bytes once wrapped by `build`
    pub fn fit_entries<F>(&self, entries: &[GossipEntry], max_size: usize, build: F) -> Result<usize>
    where
        F: Fn(Vec<GossipEntry>) -> Packet,
    {
        let budget = max_size.saturating_sub(SIGNATURE_OVERHEAD);
        let mut count = 0;
        while count < entries.len() {
            let candidate = build(entries[..=count].to_vec());
            if self.pack.pack(&candidate)?.len() > budget {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Split `entries` into signed datagrams of at most `max_size` bytes.
    ///
    /// An entry too large for a datagram on its own is dropped.
    pub fn encode_batches<F>(
        &self,
        entries: Vec<GossipEntry>,
        max_size: usize,
        build: F,
    ) -> Result<Vec<Vec<u8>>>
    where
        F: Fn(Vec<GossipEntry>) -> Packet,
    {
        let mut datagrams = Vec::new();
        let mut rest = entries.as_slice();
        while !rest.is_empty() {
            let count = self.fit_entries(rest, max_size, &build)?;
            if count == 0 {
                tracing::warn!(member = %rest[0].name, "Gossip entry exceeds packet size, dropping");
                rest = &rest[1..];
                continue;
            }
            datagrams.push(self.encode(&build(rest[..count].to_vec()))?);
            rest = &rest[count..];
        }
        Ok(datagrams)
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("signatures", &self.signatures)
            .finish_non_exhaustive()
    }
}
