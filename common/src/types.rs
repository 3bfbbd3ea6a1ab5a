//! Core type definitions shared across Argus modules

use std::fmt;

use crate::hash::Root;

/// Slot number on the followed chain. Execution transports map block numbers
/// onto slots before reporting them.
pub type Slot = u64;

/// Epoch number, derived from slots via the chain specs.
pub type Epoch = u64;

/// A finality checkpoint reported by a client.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    /// Finalized epoch
    pub epoch: Epoch,

    /// Root of the finalized block
    pub root: Root,
}

/// Client-type label used for scheduling filters.
///
/// Kinds are supplied per endpoint in configuration; there is no global
/// registry of known client implementations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ClientKind(String);

impl ClientKind {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientKind {
    fn from(label: &str) -> Self {
        Self(label.to_string())
    }
}

/// Version string reported by a node endpoint.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeVersion(pub String);

/// Sync status snapshot reported by a node endpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SyncState {
    /// Still catching up with the chain
    pub is_syncing: bool,

    /// Following an unverified head (execution payload not yet validated)
    pub is_optimistic: bool,

    /// Head slot the node reports syncing towards
    pub head_slot: Slot,
}
