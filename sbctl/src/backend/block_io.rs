// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Definition of the [`BlockIo`] trait providing access to the superblock
//! slots.

extern crate alloc;
use alloc::boxed::Box;

use super::BackendFuture;
use crate::types::Block;
use core::marker;

/// Error type returned by [`BlockIo`] primitives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockIoError {
    /// Logic error.
    Internal,

    /// Slot index out of the underlying physical storage's bounds.
    SlotOutOfRange,

    /// Read from a slot never written to before.
    SlotNotMapped,

    /// Unspecified IO failure.
    IoFailure,
}

/// Interface to the physical storage of the superblock slots.
///
/// Slots are [`BLOCK_SIZE`](crate::types::BLOCK_SIZE) sized and addressed by
/// index. A [`sync()`](Self::sync) completed successfully guarantees that all
/// writes completed before it had been issued are effective on physical
/// storage.
///
/// # Buffer ownership
///
/// The block buffers are getting transferred to the respective futures for
/// the duration of the operation and returned back upon completion in a
/// two-level [`Result`]:
/// * `Err(e)` - The outer level [`Result`] is set to [`Err`] upon encountering
///   an internal error `e`. The buffer is lost.
/// * `Ok((block, ...))` - Otherwise the outer level [`Result`] is set to
///   [`Ok`] and a pair of the buffer and the operation result will get
///   returned within.
pub trait BlockIo {
    /// `BlockIo` implementation specific [future](BackendFuture) type
    /// instantiated through [`read_block()`](Self::read_block).
    type ReadFuture: BackendFuture<Self, Output = Result<(Box<Block>, Result<(), BlockIoError>), BlockIoError>>
        + marker::Unpin;

    /// Read a slot's contents into `block`.
    fn read_block(&self, slot: u32, block: Box<Block>) -> Result<Self::ReadFuture, BlockIoError>;

    /// `BlockIo` implementation specific [future](BackendFuture) type
    /// instantiated through [`write_block()`](Self::write_block).
    type WriteFuture: BackendFuture<Self, Output = Result<(Box<Block>, Result<(), BlockIoError>), BlockIoError>>
        + marker::Unpin;

    /// Write `block` to a slot.
    fn write_block(&self, slot: u32, block: Box<Block>) -> Result<Self::WriteFuture, BlockIoError>;

    /// `BlockIo` implementation specific [future](BackendFuture) type
    /// instantiated through [`sync()`](Self::sync).
    type SyncFuture: BackendFuture<Self, Output = Result<(), BlockIoError>> + marker::Unpin;

    /// Flush all pending writes to physical storage.
    fn sync(&self) -> Result<Self::SyncFuture, BlockIoError>;
}
