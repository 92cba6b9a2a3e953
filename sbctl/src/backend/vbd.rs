// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Definition of the [`Vbd`] trait, the interface to the block mapping tree.

use super::BackendFuture;
use crate::{
    error::SbCtlError,
    superblock::{Snapshot, Snapshots, TreeRoot},
    types::{Generation, KeyId, Pba, Vba},
};
use core::marker;

/// Reference to a client data buffer location.
///
/// Opaque to the superblock control, the block mapping tree exchanges payload
/// data with the client through it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ClientBuffer {
    /// Identifies the client request's buffer.
    pub tag: u64,
    /// Block index within the buffer.
    pub offset: u64,
}

/// Parameters of a single VBA access, common to reads and writes.
#[derive(Clone, Copy, Debug)]
pub struct VbdVbaAccess {
    pub vba: Vba,
    /// Key the VBA's payload is encrypted with.
    pub key_id: KeyId,
    pub current_key_id: KeyId,
    pub previous_key_id: KeyId,
    pub rekeying: bool,
    pub rekeying_vba: Vba,
    pub degree: u32,
    pub max_vba: Vba,
    pub curr_gen: Generation,
    pub last_secured_generation: Generation,
    pub buffer: ClientBuffer,
}

/// Updated roots resulting from a VBA write.
#[derive(Clone, Copy, Debug)]
pub struct VbdWriteVbaOutput {
    /// The written-to snapshot with its new root.
    pub snapshot: Snapshot,
    pub free_tree: TreeRoot,
    pub meta_tree: TreeRoot,
}

/// Parameters of a rekeying step for a single VBA.
#[derive(Clone, Copy, Debug)]
pub struct VbdRekeyVbaArgs {
    pub snapshots: Snapshots,
    pub vba: Vba,
    pub previous_key_id: KeyId,
    pub current_key_id: KeyId,
    pub degree: u32,
    pub curr_gen: Generation,
    pub last_secured_generation: Generation,
    pub free_tree: TreeRoot,
    pub meta_tree: TreeRoot,
}

/// Updated roots resulting from a rekeying step.
#[derive(Clone, Copy, Debug)]
pub struct VbdRekeyVbaOutput {
    pub snapshots: Snapshots,
    pub free_tree: TreeRoot,
    pub meta_tree: TreeRoot,
}

/// Parameters of a block mapping tree extension step.
#[derive(Clone, Copy, Debug)]
pub struct VbdExtensionStepArgs {
    pub snapshots: Snapshots,
    pub degree: u32,
    pub first_unused_pba: Pba,
    /// Physical blocks yet to be added.
    pub nr_of_pbas: u64,
    pub curr_gen: Generation,
    pub last_secured_generation: Generation,
    pub free_tree: TreeRoot,
    pub meta_tree: TreeRoot,
}

/// Result of a block mapping tree extension step.
#[derive(Clone, Copy, Debug)]
pub struct VbdExtensionStepOutput {
    pub snapshots: Snapshots,
    /// First physical block not consumed so far.
    pub first_unused_pba: Pba,
    /// Physical blocks still to be added after this step.
    pub nr_of_pbas: u64,
    /// Number of leaves added in this step.
    pub nr_of_leaves: u64,
}

/// Interface to the block mapping tree.
///
/// The tree maps VBAs to encrypted physical blocks, per snapshot. The
/// superblock control passes in the roots it holds and stores back the updated
/// ones returned upon success.
pub trait Vbd {
    type WriteVbaFuture: BackendFuture<Self, Output = Result<VbdWriteVbaOutput, SbCtlError>> + marker::Unpin;

    /// Write one VBA in `snapshot`, the current one.
    fn write_vba(
        &self,
        access: VbdVbaAccess,
        snapshot: Snapshot,
        free_tree: TreeRoot,
        meta_tree: TreeRoot,
    ) -> Result<Self::WriteVbaFuture, SbCtlError>;

    type ReadVbaFuture: BackendFuture<Self, Output = Result<(), SbCtlError>> + marker::Unpin;

    /// Read one VBA from `snapshot`.
    fn read_vba(&self, access: VbdVbaAccess, snapshot: Snapshot) -> Result<Self::ReadVbaFuture, SbCtlError>;

    type RekeyVbaFuture: BackendFuture<Self, Output = Result<VbdRekeyVbaOutput, SbCtlError>> + marker::Unpin;

    /// Re-encrypt one VBA, in all snapshots, from the previous to the current
    /// key.
    fn rekey_vba(&self, args: VbdRekeyVbaArgs) -> Result<Self::RekeyVbaFuture, SbCtlError>;

    type ExtensionStepFuture: BackendFuture<Self, Output = Result<VbdExtensionStepOutput, SbCtlError>> + marker::Unpin;

    /// Grow the tree by consuming some of the physical blocks starting at
    /// `args.first_unused_pba`.
    fn extension_step(&self, args: VbdExtensionStepArgs) -> Result<Self::ExtensionStepFuture, SbCtlError>;
}
