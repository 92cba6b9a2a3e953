// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Error definitions.

extern crate alloc;

use crate::backend::block_io::BlockIoError;
use core::{convert, fmt};

/// [`SbCtlError::IoError`] details.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SbCtlIoError {
    /// Superblock slot out of the underlying storage's bounds.
    SlotOutOfRange,
    /// Read from a slot never written to before.
    SlotNotMapped,
    /// Unspecified IO failure.
    IoFailure,
}

/// Error type returned by the superblock control operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SbCtlError {
    /// Logic error.
    Internal,

    /// A memory allocation has failed.
    MemoryAllocationFailure,

    /// The request covers zero blocks.
    ZeroBlocksRequested,

    /// The request's VBA range extends beyond the highest addressable VBA.
    InvalidVbaRange,

    /// Not enough unused physical blocks left for the requested extension.
    NoSpace,

    /// The superblock is in a state incompatible with the requested
    /// operation.
    IncompatibleState,

    /// The superblock is invalid, i.e. not initialized or deinitialized.
    NotInitialized,

    /// An extension step did not consume any of the remaining physical
    /// blocks.
    PbaAccountingViolated,

    /// An extension step reported a first unused physical block different
    /// from the expected one.
    UnexpectedPhysicalOffset,

    /// None of the superblock slots matches the hash recorded by the trust
    /// anchor.
    SuperblockNotFound,

    /// All snapshot ring entries are pinned or in use.
    SnapshotRingExhausted,

    /// The snapshot ring has no valid entry.
    NoValidSnapshot,

    /// The generation counter would wrap.
    GenerationOverflow,

    /// The key id counter would wrap.
    KeyIdOverflow,

    /// Invalid configuration or format parameters.
    InvalidConfig,

    /// Superblock format error.
    ///
    /// Details are provided as a [`SbCtlFormatError`] error code.
    FormatError(isize),

    /// IO error.
    IoError(SbCtlIoError),

    /// The payload cipher module reported failure.
    CryptoFailure,

    /// The trust anchor reported failure.
    TrustAnchorFailure,

    /// The block mapping tree reported failure.
    VbdFailure,

    /// The free tree reported failure.
    FreeTreeFailure,
}

impl fmt::Display for SbCtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal error"),
            Self::MemoryAllocationFailure => write!(f, "memory allocation failure"),
            Self::ZeroBlocksRequested => write!(f, "zero blocks requested"),
            Self::InvalidVbaRange => write!(f, "invalid VBA range"),
            Self::NoSpace => write!(f, "not enough unused physical blocks"),
            Self::IncompatibleState => write!(f, "superblock in incompatible state for this operation"),
            Self::NotInitialized => write!(f, "superblock not initialized"),
            Self::PbaAccountingViolated => write!(f, "pba accounting invariant violated"),
            Self::UnexpectedPhysicalOffset => write!(f, "unexpected physical offset"),
            Self::SuperblockNotFound => write!(f, "superblock not found"),
            Self::SnapshotRingExhausted => write!(f, "no evictable snapshot"),
            Self::NoValidSnapshot => write!(f, "no valid snapshot"),
            Self::GenerationOverflow => write!(f, "generation overflow"),
            Self::KeyIdOverflow => write!(f, "key id overflow"),
            Self::InvalidConfig => write!(f, "invalid configuration"),
            Self::FormatError(code) => write!(f, "superblock format error {}", code),
            Self::IoError(e) => write!(f, "IO error: {:?}", e),
            Self::CryptoFailure => write!(f, "crypto module failure"),
            Self::TrustAnchorFailure => write!(f, "trust anchor failure"),
            Self::VbdFailure => write!(f, "block mapping tree failure"),
            Self::FreeTreeFailure => write!(f, "free tree failure"),
        }
    }
}

impl convert::From<convert::Infallible> for SbCtlError {
    fn from(value: convert::Infallible) -> Self {
        match value {}
    }
}

impl convert::From<alloc::collections::TryReserveError> for SbCtlError {
    fn from(_value: alloc::collections::TryReserveError) -> Self {
        Self::MemoryAllocationFailure
    }
}

impl convert::From<BlockIoError> for SbCtlError {
    fn from(value: BlockIoError) -> Self {
        match value {
            BlockIoError::Internal => Self::Internal,
            BlockIoError::SlotOutOfRange => Self::IoError(SbCtlIoError::SlotOutOfRange),
            BlockIoError::SlotNotMapped => Self::IoError(SbCtlIoError::SlotNotMapped),
            BlockIoError::IoFailure => Self::IoError(SbCtlIoError::IoFailure),
        }
    }
}

/// Superblock [format errors](SbCtlError::FormatError).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SbCtlFormatError {
    InvalidSuperblockState = 1,
    InvalidBoolean = 2,
    InvalidCurrentSnapshotIndex = 3,
    InvalidTreeDegree = 4,
    InvalidFreeTreeMaxLevel = 5,
    InvalidPbaRange = 6,
    NoValidSnapshot = 7,
    InvalidPadding = 8,
}

impl convert::From<SbCtlFormatError> for SbCtlError {
    fn from(value: SbCtlFormatError) -> Self {
        Self::FormatError(value as isize)
    }
}

/// Debugging friendly helper to instantiate [`SbCtlError::Internal`].
///
/// Panics if `cfg!(debug_assertions)` is on, to allow for debugger examination
/// at the point the logic error has happened. Otherwise a
/// [`SbCtlError::Internal`] is returned.
#[macro_export]
macro_rules! sbctl_err_internal {
    () => {{
        if cfg!(debug_assertions) {
            panic!("SbCtlError::Internal");
        } else {
            $crate::error::SbCtlError::Internal
        }
    }};
}
