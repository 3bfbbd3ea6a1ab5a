//! Genesis-derived slot clock.
//!
//! Gives the pool a notion of "current slot" independent of any client's
//! reported head, so tick events fire even while every endpoint lags.

use std::time::Duration;

use crate::genesis::{ChainSpecs, Genesis};
use crate::types::{Epoch, Slot};

/// Slot/epoch arithmetic anchored at genesis time.
#[derive(Debug, Clone, Copy)]
pub struct SlotClock {
    genesis_time: u64,
    seconds_per_slot: u64,
    slots_per_epoch: u64,
}

impl SlotClock {
    pub fn new(genesis_time: u64, seconds_per_slot: u64, slots_per_epoch: u64) -> Self {
        Self {
            genesis_time,
            seconds_per_slot,
            slots_per_epoch,
        }
    }

    pub fn from_chain_data(genesis: &Genesis, specs: &ChainSpecs) -> Self {
        Self::new(genesis.genesis_time, specs.seconds_per_slot, specs.slots_per_epoch)
    }

    /// Slot containing the given unix timestamp, `None` before genesis.
    pub fn slot_at(&self, unix_time: u64) -> Option<Slot> {
        if unix_time < self.genesis_time {
            return None;
        }
        Some((unix_time - self.genesis_time) / self.seconds_per_slot)
    }

    /// Current slot per the host clock, `None` before genesis.
    pub fn current_slot(&self) -> Option<Slot> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.slot_at(now)
    }

    /// Unix timestamp at which the given slot starts.
    pub fn slot_start(&self, slot: Slot) -> u64 {
        self.genesis_time + slot * self.seconds_per_slot
    }

    /// Epoch containing the given slot.
    pub fn epoch_of(&self, slot: Slot) -> Epoch {
        slot / self.slots_per_epoch
    }

    /// First slot of the given epoch.
    pub fn epoch_start_slot(&self, epoch: Epoch) -> Slot {
        epoch * self.slots_per_epoch
    }

    /// Wall time to sleep until the start of the given slot. Zero if the
    /// slot has already started.
    pub fn duration_until_slot(&self, slot: Slot) -> Duration {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let start = self.slot_start(slot);
        Duration::from_secs(start.saturating_sub(now))
    }
}
