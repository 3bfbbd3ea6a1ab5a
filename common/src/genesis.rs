//! Genesis record and chain spec parameters reported by clients.
//!
//! Every client in a pool must agree on these; the block cache stores the
//! first reported values and validates later reports against them, which is
//! how a misconfigured or wrong-network endpoint is detected.

use thiserror::Error;

use crate::hash::Root;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainDataError {
    #[error("genesis does not match previously reported genesis")]
    GenesisMismatch,

    #[error("chain specs do not match previously reported specs")]
    SpecsMismatch,

    #[error("invalid chain specs: {0}")]
    InvalidSpecs(String),
}

/// The chain's genesis record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Genesis {
    /// Genesis time, unix seconds
    pub genesis_time: u64,

    /// Chain-defining genesis root
    pub genesis_root: Root,

    /// Network name as reported by the node ("mainnet", "devnet-3", ...)
    pub network_name: String,
}

/// Spec parameters needed for wallclock and epoch derivation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChainSpecs {
    /// Numeric network/chain id
    pub network_id: u64,

    /// Slot duration in seconds
    pub seconds_per_slot: u64,

    /// Slots per epoch
    pub slots_per_epoch: u64,
}

impl ChainSpecs {
    /// Sanity-check the reported values before they are cached.
    pub fn validate(&self) -> Result<(), ChainDataError> {
        if self.seconds_per_slot == 0 {
            return Err(ChainDataError::InvalidSpecs("seconds_per_slot is zero".into()));
        }
        if self.slots_per_epoch == 0 {
            return Err(ChainDataError::InvalidSpecs("slots_per_epoch is zero".into()));
        }
        Ok(())
    }
}
