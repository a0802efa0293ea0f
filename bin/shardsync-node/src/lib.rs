//! ShardSync node - hosts primary and replica shards on one transport
//!
//! The binary in `main.rs` loads configuration and wires these together;
//! they are a library so the node can be started in-process by tests.

pub mod http;
pub mod node;

pub use node::Node;
