// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Definition of the [`FreeTree`] trait.

use super::BackendFuture;
use crate::{
    error::SbCtlError,
    superblock::TreeRoot,
    types::{Generation, Pba},
};
use core::marker;

/// Parameters of a free tree extension step.
#[derive(Clone, Copy, Debug)]
pub struct FtExtensionStepArgs {
    pub free_tree: TreeRoot,
    pub meta_tree: TreeRoot,
    pub first_unused_pba: Pba,
    /// Physical blocks yet to be added.
    pub nr_of_pbas: u64,
    pub curr_gen: Generation,
    pub last_secured_generation: Generation,
}

/// Result of a free tree extension step.
#[derive(Clone, Copy, Debug)]
pub struct FtExtensionStepOutput {
    pub free_tree: TreeRoot,
    /// First physical block not consumed so far.
    pub first_unused_pba: Pba,
    /// Physical blocks still to be added after this step.
    pub nr_of_pbas: u64,
    /// Number of leaves added in this step.
    pub nr_of_leaves: u64,
}

/// Interface to the free tree, the allocator of physical blocks.
pub trait FreeTree {
    type ExtensionStepFuture: BackendFuture<Self, Output = Result<FtExtensionStepOutput, SbCtlError>> + marker::Unpin;

    /// Grow the tree by consuming some of the physical blocks starting at
    /// `args.first_unused_pba`.
    fn extension_step(&self, args: FtExtensionStepArgs) -> Result<Self::ExtensionStepFuture, SbCtlError>;
}
