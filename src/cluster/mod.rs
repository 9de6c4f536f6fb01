// ============================================================================
// Cluster Module
// ============================================================================
//
// Server groups (membership, active/passive roles, failover) and the relay
// that replicates committed transactions from the active to its passives.
//
// ============================================================================

pub mod config;
pub mod forwarder;
pub mod group;
pub mod relay;

pub use config::{ClusterTopology, GroupConfig, GroupId, HaConfig, HaMode, Node, NodeResolver};
pub use forwarder::{InMemoryForwarder, PassiveForwarder};
pub use group::{Promotion, ReloadChange, ServerGroup};
pub use relay::{AckLedger, RelayOutcome, ReplicationMode, ReplicationPolicy, TransactionRelay};
