// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Fundamental address, counter and size definitions.

extern crate alloc;
use alloc::boxed::Box;

use crate::error::SbCtlError;
use core::{convert, fmt};

/// Size of a physical block, and hence of an encoded superblock, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Size of symmetric key material in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a content hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Number of entries in the superblock's snapshot ring.
pub const MAX_NR_OF_SNAPSHOTS: usize = 48;

/// Maximum number of on-disk superblock slots.
pub const MAX_NR_OF_SUPERBLOCK_SLOTS: u32 = 8;

/// Minimum supported branching factor of the trees.
pub const TREE_MIN_DEGREE: u32 = 1;

/// Minimum height of a usable free tree.
pub const FREE_TREE_MIN_MAX_LEVEL: u32 = 2;

/// A physical block.
pub type Block = [u8; BLOCK_SIZE];

/// Content hash of a block.
pub type Hash = [u8; HASH_SIZE];

/// Move `value` to the heap, reporting allocation failure instead of aborting.
pub fn box_try_new<T>(value: T) -> Result<Box<T>, SbCtlError> {
    let layout = alloc::alloc::Layout::new::<T>();
    if layout.size() == 0 {
        return Ok(Box::new(value));
    }
    // Safe, the layout's size is non-zero.
    let p = unsafe { alloc::alloc::alloc(layout) } as *mut T;
    if p.is_null() {
        return Err(SbCtlError::MemoryAllocationFailure);
    }
    // Safe, p is non-null and had been allocated with T's layout.
    unsafe {
        p.write(value);
        Ok(Box::from_raw(p))
    }
}

/// Allocate a zero-filled [`Block`] on the heap.
pub fn new_zeroed_block() -> Result<Box<Block>, SbCtlError> {
    let layout = alloc::alloc::Layout::new::<Block>();
    // Safe, the layout's size is non-zero and all zeroes is a valid Block.
    let p = unsafe { alloc::alloc::alloc_zeroed(layout) } as *mut Block;
    if p.is_null() {
        return Err(SbCtlError::MemoryAllocationFailure);
    }
    // Safe, p had been allocated with Block's layout.
    Ok(unsafe { Box::from_raw(p) })
}

/// Generation of a superblock state.
///
/// Advanced by exactly one for each completed superblock securing operation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct Generation(pub u64);

impl Generation {
    /// The largest possible [`Generation`].
    pub const MAX: Self = Self(u64::MAX);

    /// Return the successor or [`SbCtlError::GenerationOverflow`].
    pub fn next(self) -> Result<Self, SbCtlError> {
        self.0.checked_add(1).map(Self).ok_or(SbCtlError::GenerationOverflow)
    }
}

impl convert::From<u64> for Generation {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl convert::From<Generation> for u64 {
    fn from(value: Generation) -> Self {
        value.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a key, advanced by one per rekeying.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct KeyId(pub u32);

impl KeyId {
    /// Return the successor or [`SbCtlError::KeyIdOverflow`].
    pub fn next(self) -> Result<Self, SbCtlError> {
        self.0.checked_add(1).map(Self).ok_or(SbCtlError::KeyIdOverflow)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Virtual block address, the client visible logical block index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct Vba(pub u64);

impl convert::From<u64> for Vba {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Vba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical block address on the backing storage.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct Pba(pub u64);

impl Pba {
    /// The largest physical block address.
    pub const MAX: Self = Self(u64::MAX);

    /// Marker for an unset physical block address.
    pub const INVALID: Self = Self::MAX;
}

impl convert::From<u64> for Pba {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Pba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
