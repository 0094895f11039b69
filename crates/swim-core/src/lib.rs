//! # swim-core
//!
//! Core types, errors and configuration shared by the swimmesh crates.
//!
//! This crate provides:
//! - The stable member identity type ([`MemberName`])
//! - A unified error type and result alias
//! - The layered configuration schema (defaults, YAML file, `SWIM_` environment)

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{Config, LoggingConfig, NodeConfig, ProtocolConfig};
pub use error::{Error, Result};
pub use types::MemberName;
