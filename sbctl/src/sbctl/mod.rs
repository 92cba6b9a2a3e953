// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! The superblock control and its operations.
//!
//! # Execution model
//!
//! Every operation is a [`SbCtlFuture`] to be polled to completion. A
//! [`SbCtlFuture`] doesn't hold on to the [`SuperblockControl`] it operates
//! on, but receives a mutable reference to it for the duration of each
//! individual [`poll()`](SbCtlFuture::poll), together with the
//! [collaborators](crate::backend::SbCtlEnv). Consequently, at most one
//! operation can ever be mutating the [`Superblock`] at a time. Multiple
//! requests may be in flight concurrently though, with their steps
//! interleaved by the driving executor: the [`Superblock`]'s
//! [`state`](Superblock::state) provides the mutual exclusion between
//! long-running operations, and VBA reads and writes select the key on a
//! per-VBA basis from the current rekeying progress. The result of a nested
//! tree operation gets applied only if the superblock hasn't been modified by
//! some other request while it had been in flight. Otherwise the operation
//! is reissued against the live superblock.
//!
//! Any change is considered committed only once the
//! [`SecureSuperblockFuture`] run at the end of the respective operation has
//! completed. Until then, a crash is equivalent to the operation never having
//! started.

mod extend;
mod format;
mod mount;
mod rekey;
mod request;
mod secure;
mod snapshots;
mod vba_access;

pub use extend::{ExtendTreeFuture, ExtendTreeOutput, TreeExtensionTarget};
pub use format::{FormatFuture, FormatParams};
pub use mount::{DeinitializeFuture, InitializeFuture};
pub use rekey::{RekeyFuture, RekeyOutput};
pub use request::{SbCtlRequest, SbCtlRequestFuture, SbCtlRequestOutput};
pub use secure::SecureSuperblockFuture;
pub use snapshots::{CreateSnapshotFuture, DiscardSnapshotFuture, SynchronizeFuture};
pub use vba_access::{ReadVbasFuture, WriteVbasFuture};

use crate::{
    backend::SbCtlEnv,
    config::SbCtlConfig,
    error::SbCtlError,
    superblock::{SbInfo, Snapshots, Superblock, SuperblockState, TreeRoot},
    types::{Generation, Vba},
};
use core::{future, marker, pin, task};

/// Owner of the live [`Superblock`].
pub struct SuperblockControl {
    pub(crate) sb: Superblock,
    pub(crate) curr_gen: Generation,
    /// Slot the most recent superblock had been written to.
    pub(crate) sb_slot_idx: u32,
    /// Slot whose hash is recorded at the trust anchor.
    pub(crate) committed_sb_slot_idx: u32,
    pub(crate) config: SbCtlConfig,
}

impl SuperblockControl {
    /// Instantiate an uninitialized [`SuperblockControl`].
    ///
    /// The [`Superblock`] starts out [`Invalid`](crate::superblock::SuperblockState::Invalid),
    /// an [`InitializeFuture`] must be run for mounting a volume.
    pub fn new(config: SbCtlConfig) -> Result<Self, SbCtlError> {
        config.validate()?;
        Ok(Self {
            sb: Superblock::new_invalid(),
            curr_gen: Generation(0),
            sb_slot_idx: 0,
            committed_sb_slot_idx: 0,
            config,
        })
    }

    pub fn config(&self) -> &SbCtlConfig {
        &self.config
    }

    pub fn sb_info(&self) -> SbInfo {
        self.sb.info()
    }

    /// Generations of all pinned snapshots, in ring order.
    pub fn snapshots_info(&self) -> impl Iterator<Item = Generation> {
        let valid = self.sb.is_valid();
        self.sb
            .snapshots
            .iter_valid()
            .filter(move |snap| valid && snap.keep)
            .map(|snap| snap.generation)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// The generation currently being accumulated, i.e. the one the next
    /// [`SecureSuperblockFuture`] will persist.
    pub fn curr_gen(&self) -> Generation {
        self.curr_gen
    }

    pub fn max_vba(&self) -> Vba {
        self.sb.max_vba()
    }

    /// Slot the next superblock is to be written to.
    ///
    /// Never the slot the trust anchor's recorded hash refers to.
    pub(crate) fn next_sb_slot_idx(&self) -> u32 {
        let nr_of_slots = self.config.nr_of_superblock_slots;
        let next = (self.sb_slot_idx + 1) % nr_of_slots;
        if next == self.committed_sb_slot_idx {
            (next + 1) % nr_of_slots
        } else {
            next
        }
    }

    /// Whether a long-running request having completed `steps_done` durable
    /// steps should return to the caller.
    pub(crate) fn steps_quota_exhausted(&self, steps_done: u64) -> bool {
        self.config.steps_per_request.is_some_and(|n| steps_done >= n.get())
    }

    /// Record the state a nested tree operation is about to get issued
    /// against.
    pub(crate) fn tree_update_base(&self) -> TreeUpdateBase {
        let sb = &self.sb;
        TreeUpdateBase {
            state: sb.state,
            rekeying_vba: sb.rekeying_vba,
            nr_of_pbas: sb.nr_of_pbas,
            resizing_nr_of_pbas: sb.resizing_nr_of_pbas,
            snapshots: sb.snapshots,
            curr_snap_idx: sb.curr_snap_idx,
            free_tree: sb.free_tree,
            meta_tree: sb.meta_tree,
            curr_gen: self.curr_gen,
        }
    }

    /// Whether anything a nested tree operation's result depends on has
    /// changed since `base` had been recorded.
    ///
    /// Requests interleave at every await point. A nested operation completing
    /// against a stale `base` must not get applied, but redone against the
    /// live state.
    pub(crate) fn tree_update_conflicts(&self, base: &TreeUpdateBase) -> bool {
        self.tree_update_base() != *base
    }
}

/// The parts of the [`Superblock`] a nested tree operation had been issued
/// against, c.f. [`SuperblockControl::tree_update_conflicts()`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeUpdateBase {
    state: SuperblockState,
    rekeying_vba: Vba,
    nr_of_pbas: u64,
    resizing_nr_of_pbas: u64,
    snapshots: Snapshots,
    curr_snap_idx: usize,
    free_tree: TreeRoot,
    meta_tree: TreeRoot,
    curr_gen: Generation,
}

/// Future trait implemented by all [`SuperblockControl`] operations.
///
/// `SbCtlFuture` differs from the standard [Rust `Future`](future::Future)
/// only in that it takes the [`SuperblockControl`] to operate on and the
/// [collaborators](SbCtlEnv) as additional arguments. In cases where a proper
/// Rust [`Future`](future::Future) is needed, `SbCtlFuture` implementation
/// instances can get wrapped in a [`SbCtlFutureAsCoreFuture`].
pub trait SbCtlFuture<E: SbCtlEnv> {
    type Output;

    /// Poll on a [`SbCtlFuture`].
    ///
    /// # Arguments:
    ///
    /// * `sbctl` - The [`SuperblockControl`] to operate on. Must be the same
    ///   instance for all polls of a given future.
    /// * `env` - The collaborators.
    /// * `cx` - The context of an asynchronous task.
    fn poll(
        self: pin::Pin<&mut Self>,
        sbctl: &mut SuperblockControl,
        env: &E,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output>;
}

/// [`SbCtlFuture`] adaptor implementing the standard [Rust
/// `Future`](future::Future) trait.
pub struct SbCtlFutureAsCoreFuture<'a, E: SbCtlEnv, F: SbCtlFuture<E> + marker::Unpin> {
    sbctl: &'a mut SuperblockControl,
    env: &'a E,
    fut: F,
}

impl<'a, E: SbCtlEnv, F: SbCtlFuture<E> + marker::Unpin> SbCtlFutureAsCoreFuture<'a, E, F> {
    /// Wrap a [`SbCtlFuture`] in a new [`SbCtlFutureAsCoreFuture`].
    ///
    /// # Arguments:
    ///
    /// * `sbctl` - The [`SuperblockControl`] to operate on.
    /// * `env` - The collaborators.
    /// * `fut` - The [`SbCtlFuture`] to wrap.
    pub fn new(sbctl: &'a mut SuperblockControl, env: &'a E, fut: F) -> Self {
        Self { sbctl, env, fut }
    }
}

impl<'a, E: SbCtlEnv, F: SbCtlFuture<E> + marker::Unpin> future::Future for SbCtlFutureAsCoreFuture<'a, E, F> {
    type Output = F::Output;

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        SbCtlFuture::poll(pin::Pin::new(&mut this.fut), this.sbctl, this.env, cx)
    }
}
