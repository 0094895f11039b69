//! # swim-gossip
//!
//! SWIM-style membership protocol engine for swimmesh.
//!
//! This crate provides:
//! - The member status state machine and its transition table
//! - The membership table with clock-based conflict resolution
//! - Failure detection (ping, indirect ping-req, suspicion) and gossip
//!   dissemination loops
//! - HMAC-signed packet framing and a pluggable datagram transport
//!
//! ## Example
//!
//! ```rust,no_run
//! use swim_core::{Config, MemberName};
//! use swim_gossip::GossipNode;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = Config::default();
//! config.node.name = MemberName::new("127.0.0.1:7946");
//! config.node.peers = vec![MemberName::new("127.0.0.1:7947")];
//! config.node.secret = Some("cluster-secret".to_string());
//!
//! let mut node = GossipNode::bind(&config).await?;
//! let mut changes = node.subscribe();
//! while let Ok(change) = changes.recv().await {
//!     println!("{} is now {}", change.name, change.status);
//! }
//! node.stop().await?;
//! # Ok(())
//! # }
//! ```

use swim_core::MemberName;
use thiserror::Error;

pub mod codec;
pub mod listener;
pub mod members;
pub mod node;
pub mod packet;
pub mod shuffle;
pub mod sign;
pub mod status;
pub mod transport;
pub mod worker;

// Re-export commonly used types
pub use codec::{BincodePack, Codec, Pack};
pub use listener::{CallbackPoll, Listener};
pub use members::{Member, MemberChange, MemberHandle, Members, MembersStats, Metadata, METADATA_UNKNOWN};
pub use node::{GossipNode, GossipNodeBuilder};
pub use packet::{EntryAck, GossipEntry, Packet, PacketKind, Payload, Source};
pub use shuffle::{Resolve, Shuffle, WeakShuffle};
pub use sign::{SignatureError, Signatures};
pub use status::{Status, StatusMask};
pub use transport::{Datagram, MemoryNetwork, MemoryTransport, Transport, UdpTransport};
pub use worker::Worker;

/// Result type for gossip operations
pub type Result<T> = std::result::Result<T, GossipError>;

/// Errors that can occur during gossip operations
#[derive(Error, Debug)]
pub enum GossipError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("Invalid transition for {name}: {from} -> {to}")]
    InvalidTransition {
        name: MemberName,
        from: Status,
        to: Status,
    },

    #[error("Member not found: {0}")]
    MemberNotFound(MemberName),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Core error: {0}")]
    Core(#[from] swim_core::Error),
}

impl GossipError {
    /// Whether the error stems from network behaviour rather than misuse.
    ///
    /// Transient errors are absorbed by the worker; the rest are returned to
    /// the caller that triggered them.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GossipError::Network(_)
                | GossipError::Codec(_)
                | GossipError::Signature(_)
                | GossipError::Transport(_)
        )
    }
}
