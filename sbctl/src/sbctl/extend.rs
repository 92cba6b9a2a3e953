// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Implementation of [`ExtendTreeFuture`].

use super::{SbCtlFuture, SecureSuperblockFuture, SuperblockControl, TreeUpdateBase};
use crate::{
    backend::{
        BackendFuture, SbCtlEnv,
        free_tree::{FreeTree, FtExtensionStepArgs},
        vbd::{Vbd, VbdExtensionStepArgs},
    },
    error::SbCtlError,
    superblock::{Snapshots, SuperblockState, TreeRoot},
    types::Pba,
};
use core::{marker, pin, task};

/// The tree an [`ExtendTreeFuture`] grows.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TreeExtensionTarget {
    /// The free tree.
    FreeTree,
    /// The block mapping tree.
    Vbd,
}

impl TreeExtensionTarget {
    fn sb_state(&self) -> SuperblockState {
        match self {
            Self::FreeTree => SuperblockState::ExtendingFt,
            Self::Vbd => SuperblockState::ExtendingVbd,
        }
    }
}

/// Result of an [`ExtendTreeFuture`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExtendTreeOutput {
    /// Whether the extension has been completed. If not, the request is to be
    /// resubmitted for making further progress.
    pub extension_finished: bool,
}

/// Tree specific part of a completed extension step's result.
enum ExtensionStepUpdate {
    FreeTree { free_tree: TreeRoot },
    Vbd { snapshots: Snapshots },
}

/// Grow the free tree or the block mapping tree by a number of physical
/// blocks.
///
/// The physical blocks get appended right after the range currently in use,
/// `first_pba + nr_of_pbas`. The extension proceeds in steps, each of which
/// is made durable individually by means of a [`SecureSuperblockFuture`].
/// The superblock's state transition to the respective `Extending*` state is
/// itself secured before any tree modification, so that an interrupted
/// extension can get resumed after remount by resubmitting the request.
pub struct ExtendTreeFuture<E: SbCtlEnv> {
    target: TreeExtensionTarget,
    nr_of_pbas: u64,
    steps_done: u64,
    fut_state: ExtendTreeFutureState<E>,
}

enum ExtendTreeFutureState<E: SbCtlEnv> {
    Init,
    ExtendFreeTree {
        base: TreeUpdateBase,
        ft_fut: <E::FreeTree as FreeTree>::ExtensionStepFuture,
    },
    ExtendVbd {
        base: TreeUpdateBase,
        vbd_fut: <E::Vbd as Vbd>::ExtensionStepFuture,
    },
    SecureSb {
        secure_fut: SecureSuperblockFuture<E>,
        extension_finished: bool,
    },
    Done,
}

impl<E: SbCtlEnv> ExtendTreeFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "extend tree init",
            Self::ExtendFreeTree { .. } => "extend free tree",
            Self::ExtendVbd { .. } => "extend vbd",
            Self::SecureSb { .. } => "secure superblock",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> ExtendTreeFuture<E> {
    /// Instantiate an [`ExtendTreeFuture`].
    ///
    /// # Arguments:
    ///
    /// * `target` - The tree to extend.
    /// * `nr_of_pbas` - Number of physical blocks to add. When resuming an
    ///   extension already in progress, the remaining amount recorded in the
    ///   superblock takes precedence after the initial space check.
    pub fn new(target: TreeExtensionTarget, nr_of_pbas: u64) -> Self {
        Self {
            target,
            nr_of_pbas,
            steps_done: 0,
            fut_state: ExtendTreeFutureState::Init,
        }
    }

    /// Check the request, transition to the extension state or issue the
    /// next tree extension step.
    fn init(&mut self, sbctl: &mut SuperblockControl, env: &E) -> Result<ExtendTreeFutureState<E>, SbCtlError> {
        let sb = &mut sbctl.sb;
        if !sb.is_valid() {
            return Err(SbCtlError::NotInitialized);
        }

        let last_used_pba = sb
            .nr_of_pbas
            .checked_sub(1)
            .and_then(|nr_of_pbas| sb.first_pba.0.checked_add(nr_of_pbas))
            .ok_or(SbCtlError::PbaAccountingViolated)?;
        let available = sbctl.config.max_pba.0.saturating_sub(last_used_pba);
        if self.nr_of_pbas > available {
            return Err(SbCtlError::NoSpace);
        }

        if sb.state == SuperblockState::Normal {
            if self.nr_of_pbas == 0 {
                return Err(SbCtlError::ZeroBlocksRequested);
            }
            sb.state = self.target.sb_state();
            sb.resizing_nr_of_pbas = self.nr_of_pbas;
            sb.resizing_nr_of_leaves = 0;
            log::debug!(
                "sbctl: start extension of {:?} by {} pbas after pba {}",
                self.target,
                self.nr_of_pbas,
                last_used_pba
            );
            return Ok(ExtendTreeFutureState::SecureSb {
                secure_fut: SecureSuperblockFuture::new(),
                extension_finished: false,
            });
        } else if sb.state != self.target.sb_state() {
            return Err(SbCtlError::IncompatibleState);
        }

        self.nr_of_pbas = sb.resizing_nr_of_pbas;
        let first_unused_pba = Pba(last_used_pba + 1);
        log::debug!(
            "sbctl: extension step of {:?} at pba {}, {} pbas remaining",
            self.target,
            first_unused_pba,
            self.nr_of_pbas
        );
        let base = sbctl.tree_update_base();
        let sb = &sbctl.sb;
        match self.target {
            TreeExtensionTarget::FreeTree => {
                let ft_fut = env.free_tree().extension_step(FtExtensionStepArgs {
                    free_tree: sb.free_tree,
                    meta_tree: sb.meta_tree,
                    first_unused_pba,
                    nr_of_pbas: sb.resizing_nr_of_pbas,
                    curr_gen: sbctl.curr_gen,
                    last_secured_generation: sb.last_secured_generation,
                })?;
                Ok(ExtendTreeFutureState::ExtendFreeTree { base, ft_fut })
            }
            TreeExtensionTarget::Vbd => {
                let vbd_fut = env.vbd().extension_step(VbdExtensionStepArgs {
                    snapshots: sb.snapshots,
                    degree: sb.degree,
                    first_unused_pba,
                    nr_of_pbas: sb.resizing_nr_of_pbas,
                    curr_gen: sbctl.curr_gen,
                    last_secured_generation: sb.last_secured_generation,
                    free_tree: sb.free_tree,
                    meta_tree: sb.meta_tree,
                })?;
                Ok(ExtendTreeFutureState::ExtendVbd { base, vbd_fut })
            }
        }
    }

    /// Verify a completed extension step's accounting and apply it to the
    /// superblock.
    ///
    /// The superblock is left untouched if the verification fails. Returns
    /// whether the extension is complete.
    fn commit_step(
        &mut self,
        sbctl: &mut SuperblockControl,
        first_unused_pba: Pba,
        remaining_nr_of_pbas: u64,
        nr_of_leaves: u64,
        update: ExtensionStepUpdate,
    ) -> Result<bool, SbCtlError> {
        let sb = &mut sbctl.sb;
        if remaining_nr_of_pbas >= sb.resizing_nr_of_pbas {
            return Err(SbCtlError::PbaAccountingViolated);
        }
        let added = sb.resizing_nr_of_pbas - remaining_nr_of_pbas;
        let new_nr_of_pbas = sb.nr_of_pbas.checked_add(added).ok_or(SbCtlError::PbaAccountingViolated)?;
        let expected_first_unused_pba = sb
            .first_pba
            .0
            .checked_add(new_nr_of_pbas)
            .ok_or(SbCtlError::UnexpectedPhysicalOffset)?;
        if first_unused_pba.0 != expected_first_unused_pba {
            return Err(SbCtlError::UnexpectedPhysicalOffset);
        }
        let new_curr_snap_idx = match &update {
            ExtensionStepUpdate::Vbd { snapshots } => Some(snapshots.newest_snapshot_idx()?),
            ExtensionStepUpdate::FreeTree { .. } => None,
        };

        match update {
            ExtensionStepUpdate::FreeTree { free_tree } => {
                sb.free_tree = free_tree;
            }
            ExtensionStepUpdate::Vbd { snapshots } => {
                sb.snapshots = snapshots;
            }
        }
        if let Some(new_curr_snap_idx) = new_curr_snap_idx {
            sb.curr_snap_idx = new_curr_snap_idx;
        }
        sb.nr_of_pbas = new_nr_of_pbas;
        sb.resizing_nr_of_pbas = remaining_nr_of_pbas;
        sb.resizing_nr_of_leaves = sb.resizing_nr_of_leaves.saturating_add(nr_of_leaves);
        self.nr_of_pbas = remaining_nr_of_pbas;
        log::debug!(
            "sbctl: extended {:?} by {} pbas, {} leaves, {} pbas remaining",
            self.target,
            added,
            nr_of_leaves,
            remaining_nr_of_pbas
        );

        if remaining_nr_of_pbas == 0 {
            sb.state = SuperblockState::Normal;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl<E: SbCtlEnv> marker::Unpin for ExtendTreeFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for ExtendTreeFuture<E> {
    type Output = Result<ExtendTreeOutput, SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        sbctl: &mut SuperblockControl,
        env: &E,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);

        let e = loop {
            match &mut this.fut_state {
                ExtendTreeFutureState::Init => {
                    this.fut_state = match this.init(sbctl, env) {
                        Ok(fut_state) => fut_state,
                        Err(e) => break e,
                    };
                }
                ExtendTreeFutureState::ExtendFreeTree { base, ft_fut } => {
                    let output = match BackendFuture::poll(pin::Pin::new(ft_fut), env.free_tree(), cx) {
                        task::Poll::Ready(Ok(output)) => output,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    if sbctl.tree_update_conflicts(base) {
                        if sbctl.sb.state != this.target.sb_state() {
                            break SbCtlError::IncompatibleState;
                        }
                        log::debug!("sbctl: superblock modified during free tree extension step, retry");
                        this.fut_state = ExtendTreeFutureState::Init;
                        continue;
                    }
                    let extension_finished = match this.commit_step(
                        sbctl,
                        output.first_unused_pba,
                        output.nr_of_pbas,
                        output.nr_of_leaves,
                        ExtensionStepUpdate::FreeTree {
                            free_tree: output.free_tree,
                        },
                    ) {
                        Ok(extension_finished) => extension_finished,
                        Err(e) => break e,
                    };
                    this.fut_state = ExtendTreeFutureState::SecureSb {
                        secure_fut: SecureSuperblockFuture::new(),
                        extension_finished,
                    };
                }
                ExtendTreeFutureState::ExtendVbd { base, vbd_fut } => {
                    let output = match BackendFuture::poll(pin::Pin::new(vbd_fut), env.vbd(), cx) {
                        task::Poll::Ready(Ok(output)) => output,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    if sbctl.tree_update_conflicts(base) {
                        if sbctl.sb.state != this.target.sb_state() {
                            break SbCtlError::IncompatibleState;
                        }
                        log::debug!("sbctl: superblock modified during vbd extension step, retry");
                        this.fut_state = ExtendTreeFutureState::Init;
                        continue;
                    }
                    let extension_finished = match this.commit_step(
                        sbctl,
                        output.first_unused_pba,
                        output.nr_of_pbas,
                        output.nr_of_leaves,
                        ExtensionStepUpdate::Vbd {
                            snapshots: output.snapshots,
                        },
                    ) {
                        Ok(extension_finished) => extension_finished,
                        Err(e) => break e,
                    };
                    this.fut_state = ExtendTreeFutureState::SecureSb {
                        secure_fut: SecureSuperblockFuture::new(),
                        extension_finished,
                    };
                }
                ExtendTreeFutureState::SecureSb {
                    secure_fut,
                    extension_finished,
                } => {
                    match SbCtlFuture::poll(pin::Pin::new(secure_fut), sbctl, env, cx) {
                        task::Poll::Ready(Ok(_)) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    this.steps_done += 1;
                    let extension_finished = *extension_finished;
                    if extension_finished || sbctl.steps_quota_exhausted(this.steps_done) {
                        this.fut_state = ExtendTreeFutureState::Done;
                        return task::Poll::Ready(Ok(ExtendTreeOutput { extension_finished }));
                    }
                    this.fut_state = ExtendTreeFutureState::Init;
                }
                ExtendTreeFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = ExtendTreeFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}
