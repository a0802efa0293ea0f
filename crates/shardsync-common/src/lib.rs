//! ShardSync Common - Shared types and utilities
//!
//! This crate provides identifiers, the shared error type, checksums and
//! configuration used across all ShardSync components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, ChecksumCalculator};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
