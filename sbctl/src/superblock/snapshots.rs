// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! The superblock's ring of block mapping tree snapshots.

use crate::{
    error::SbCtlError,
    types::{Generation, HASH_SIZE, Hash, MAX_NR_OF_SNAPSHOTS, Pba},
};

/// Root of one copy-on-write version of the block mapping tree.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Snapshot {
    /// Hash of the tree's root node.
    pub hash: Hash,
    /// Location of the tree's root node.
    pub pba: Pba,
    /// Generation the snapshot had last been written in.
    pub generation: Generation,
    /// Size of the tree in units of VBAs.
    pub nr_of_leaves: u64,
    pub max_level: u32,
    pub valid: bool,
    pub id: u32,
    /// Pinned by the user, not eligible for automatic eviction.
    pub keep: bool,
}

impl Snapshot {
    pub const fn new_invalid() -> Self {
        Self {
            hash: [0u8; HASH_SIZE],
            pba: Pba(0),
            generation: Generation(0),
            nr_of_leaves: 0,
            max_level: 0,
            valid: false,
            id: 0,
            keep: false,
        }
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new_invalid()
    }
}

/// Fixed-size ring of [`Snapshot`]s.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Snapshots {
    pub items: [Snapshot; MAX_NR_OF_SNAPSHOTS],
}

impl Snapshots {
    pub const fn new_invalid() -> Self {
        Self {
            items: [Snapshot::new_invalid(); MAX_NR_OF_SNAPSHOTS],
        }
    }

    /// Invalidate all snapshots neither pinned nor needed for the current or
    /// the last secured generation.
    pub fn discard_disposable_snapshots(&mut self, curr_gen: Generation, last_secured_gen: Generation) {
        for snap in self.items.iter_mut() {
            if snap.valid && !snap.keep && snap.generation != curr_gen && snap.generation != last_secured_gen {
                snap.valid = false;
            }
        }
    }

    /// Index of the valid snapshot with the highest generation.
    ///
    /// Of multiple candidates with equal generations, the first one wins.
    pub fn newest_snapshot_idx(&self) -> Result<usize, SbCtlError> {
        let mut result: Option<usize> = None;
        for (idx, snap) in self.items.iter().enumerate() {
            if !snap.valid {
                continue;
            }
            if let Some(result) = result {
                if snap.generation <= self.items[result].generation {
                    continue;
                }
            }
            result = Some(idx);
        }
        result.ok_or(SbCtlError::NoValidSnapshot)
    }

    /// Find a ring slot to branch a new snapshot into.
    ///
    /// Returns the first invalid slot, if any. Otherwise the evictable
    /// snapshot of lowest generation, where snapshots pinned or at either of
    /// `curr_gen` or `last_secured_gen` are not evictable.
    pub fn idx_of_invalid_or_lowest_gen_evictable_snap(
        &self,
        curr_gen: Generation,
        last_secured_gen: Generation,
    ) -> Result<usize, SbCtlError> {
        let mut result: Option<usize> = None;
        for (idx, snap) in self.items.iter().enumerate() {
            if !snap.valid {
                return Ok(idx);
            }
            if snap.keep || snap.generation == curr_gen || snap.generation == last_secured_gen {
                continue;
            }
            if let Some(result) = result {
                if snap.generation >= self.items[result].generation {
                    continue;
                }
            }
            result = Some(idx);
        }
        result.ok_or(SbCtlError::SnapshotRingExhausted)
    }

    /// The largest size over all valid snapshots.
    pub fn max_nr_of_leaves(&self) -> u64 {
        self.items
            .iter()
            .filter(|snap| snap.valid)
            .map(|snap| snap.nr_of_leaves)
            .max()
            .unwrap_or(0)
    }

    pub fn iter_valid(&self) -> impl Iterator<Item = &Snapshot> {
        self.items.iter().filter(|snap| snap.valid)
    }
}

impl Default for Snapshots {
    fn default() -> Self {
        Self::new_invalid()
    }
}
