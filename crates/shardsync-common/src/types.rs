//! Core type definitions for ShardSync
//!
//! Identifiers for indices, shards, nodes and replication attempts.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Name of an index (a logical collection of shards)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct IndexName(String);

impl IndexName {
    /// Create a new index name (validates naming rules)
    pub fn new(name: impl Into<String>) -> Result<Self, IndexNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the index name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Index names become directory names, so they are restricted to a
    /// filesystem- and URL-safe alphabet.
    fn validate(name: &str) -> Result<(), IndexNameError> {
        if name.is_empty() {
            return Err(IndexNameError::Empty);
        }
        if name.len() > 255 {
            return Err(IndexNameError::TooLong);
        }

        let first = name.chars().next().unwrap_or('_');
        if first == '_' || first == '-' || first == '.' {
            return Err(IndexNameError::InvalidStartChar(first));
        }

        for c in name.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '_' && c != '.'
            {
                return Err(IndexNameError::InvalidChar(c));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexName({:?})", self.0)
    }
}

impl TryFrom<String> for IndexName {
    type Error = IndexNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IndexName> for String {
    fn from(value: IndexName) -> Self {
        value.0
    }
}

/// Errors that can occur when creating an index name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexNameError {
    #[error("index name cannot be empty")]
    Empty,
    #[error("index name must be at most 255 characters")]
    TooLong,
    #[error("index name cannot start with '{0}'")]
    InvalidStartChar(char),
    #[error("index name contains invalid character: {0}")]
    InvalidChar(char),
}

/// Identifies one shard of an index. Primary and replica copies of the
/// same shard share a `ShardId`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// Index the shard belongs to
    pub index: IndexName,
    /// Shard number within the index
    pub shard: u32,
}

impl ShardId {
    /// Create a new shard ID
    #[must_use]
    pub const fn new(index: IndexName, shard: u32) -> Self {
        Self { index, shard }
    }

    /// Relative directory for this shard's files (`<index>/<shard>`)
    #[must_use]
    pub fn relative_path(&self) -> std::path::PathBuf {
        std::path::Path::new(self.index.as_str()).join(self.shard.to_string())
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({}/{})", self.index, self.shard)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Parses `index/shard`, the form used in configuration files
impl FromStr for ShardId {
    type Err = ShardIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, shard) = s
            .rsplit_once('/')
            .ok_or_else(|| ShardIdParseError::MissingSeparator(s.to_string()))?;
        let index = IndexName::new(index)?;
        let shard = shard
            .parse::<u32>()
            .map_err(|_| ShardIdParseError::InvalidShardNumber(shard.to_string()))?;
        Ok(Self::new(index, shard))
    }
}

/// Errors that can occur when parsing a shard ID
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardIdParseError {
    #[error("shard id must have the form <index>/<shard>: {0}")]
    MissingSeparator(String),
    #[error("invalid shard number: {0}")]
    InvalidShardNumber(String),
    #[error("invalid index name: {0}")]
    InvalidIndex(#[from] IndexNameError),
}

/// Identifier of a node in the cluster
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID from its configured name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the node ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// A node as seen by cluster membership: identity plus transport address
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: NodeId,
    pub address: SocketAddr,
}

impl DiscoveryNode {
    #[must_use]
    pub const fn new(id: NodeId, address: SocketAddr) -> Self {
        Self { id, address }
    }
}

impl fmt::Display for DiscoveryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Identifies a single replication attempt. Assigned monotonically by the
/// replica; the primary uses it to track and cancel transfers independently
/// of shard identity.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct ReplicationId(u64);

impl ReplicationId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ReplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicationId({})", self.0)
    }
}
