// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Runtime configuration of the [`SuperblockControl`](crate::sbctl::SuperblockControl).

use crate::{
    error::SbCtlError,
    types::{MAX_NR_OF_SUPERBLOCK_SLOTS, Pba},
};
use core::num;

/// Runtime configuration of the [`SuperblockControl`](crate::sbctl::SuperblockControl).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SbCtlConfig {
    /// Number of on-disk superblock slots to rotate through.
    ///
    /// Must be in the range from 2 to
    /// [`MAX_NR_OF_SUPERBLOCK_SLOTS`](crate::types::MAX_NR_OF_SUPERBLOCK_SLOTS),
    /// so that the authoritative slot never needs to get overwritten.
    pub nr_of_superblock_slots: u32,

    /// Highest physical block address available to tree extensions.
    pub max_pba: Pba,

    /// Upper bound on the number of durable steps a single rekeying or
    /// extension request performs before returning.
    ///
    /// With `None`, requests run to completion.
    pub steps_per_request: Option<num::NonZeroU64>,
}

impl SbCtlConfig {
    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<(), SbCtlError> {
        if self.nr_of_superblock_slots < 2 || self.nr_of_superblock_slots > MAX_NR_OF_SUPERBLOCK_SLOTS {
            return Err(SbCtlError::InvalidConfig);
        }
        Ok(())
    }
}

impl Default for SbCtlConfig {
    fn default() -> Self {
        Self {
            nr_of_superblock_slots: MAX_NR_OF_SUPERBLOCK_SLOTS,
            max_pba: Pba::MAX,
            steps_per_request: None,
        }
    }
}
