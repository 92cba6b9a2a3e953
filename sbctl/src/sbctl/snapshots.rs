// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Snapshot lifecycle operations and explicit synchronization.

use super::{SbCtlFuture, SecureSuperblockFuture, SuperblockControl};
use crate::{backend::SbCtlEnv, error::SbCtlError, types::Generation};
use core::{marker, pin, task};

/// Pin the current snapshot.
///
/// Returns the pinned snapshot's generation. Pinning an already pinned
/// snapshot is a no-op and doesn't persist anything.
pub struct CreateSnapshotFuture<E: SbCtlEnv> {
    fut_state: CreateSnapshotFutureState<E>,
}

enum CreateSnapshotFutureState<E: SbCtlEnv> {
    Init,
    SecureSb { secure_fut: SecureSuperblockFuture<E> },
    Done,
}

impl<E: SbCtlEnv> CreateSnapshotFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "create snapshot init",
            Self::SecureSb { .. } => "secure superblock",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> CreateSnapshotFuture<E> {
    pub fn new() -> Self {
        Self {
            fut_state: CreateSnapshotFutureState::Init,
        }
    }
}

impl<E: SbCtlEnv> Default for CreateSnapshotFuture<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SbCtlEnv> marker::Unpin for CreateSnapshotFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for CreateSnapshotFuture<E> {
    type Output = Result<Generation, SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        sbctl: &mut SuperblockControl,
        env: &E,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);

        let e = loop {
            match &mut this.fut_state {
                CreateSnapshotFutureState::Init => {
                    if !sbctl.sb.is_valid() {
                        break SbCtlError::NotInitialized;
                    }
                    let curr_snap = sbctl.sb.curr_snap_mut();
                    if curr_snap.keep {
                        let generation = curr_snap.generation;
                        this.fut_state = CreateSnapshotFutureState::Done;
                        return task::Poll::Ready(Ok(generation));
                    }
                    curr_snap.keep = true;
                    this.fut_state = CreateSnapshotFutureState::SecureSb {
                        secure_fut: SecureSuperblockFuture::new(),
                    };
                }
                CreateSnapshotFutureState::SecureSb { secure_fut } => {
                    match SbCtlFuture::poll(pin::Pin::new(secure_fut), sbctl, env, cx) {
                        task::Poll::Ready(Ok(generation)) => {
                            log::debug!("sbctl: pinned snapshot of generation {}", generation);
                            this.fut_state = CreateSnapshotFutureState::Done;
                            return task::Poll::Ready(Ok(generation));
                        }
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    }
                }
                CreateSnapshotFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = CreateSnapshotFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}

/// Unpin all snapshots of a given generation.
///
/// The snapshots thereby become eligible for eviction.
pub struct DiscardSnapshotFuture<E: SbCtlEnv> {
    generation: Generation,
    fut_state: DiscardSnapshotFutureState<E>,
}

enum DiscardSnapshotFutureState<E: SbCtlEnv> {
    Init,
    SecureSb { secure_fut: SecureSuperblockFuture<E> },
    Done,
}

impl<E: SbCtlEnv> DiscardSnapshotFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "discard snapshot init",
            Self::SecureSb { .. } => "secure superblock",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> DiscardSnapshotFuture<E> {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            fut_state: DiscardSnapshotFutureState::Init,
        }
    }
}

impl<E: SbCtlEnv> marker::Unpin for DiscardSnapshotFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for DiscardSnapshotFuture<E> {
    type Output = Result<(), SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        sbctl: &mut SuperblockControl,
        env: &E,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);

        let e = loop {
            match &mut this.fut_state {
                DiscardSnapshotFutureState::Init => {
                    if !sbctl.sb.is_valid() {
                        break SbCtlError::NotInitialized;
                    }
                    for snap in sbctl.sb.snapshots.items.iter_mut() {
                        if snap.valid && snap.keep && snap.generation == this.generation {
                            snap.keep = false;
                        }
                    }
                    this.fut_state = DiscardSnapshotFutureState::SecureSb {
                        secure_fut: SecureSuperblockFuture::new(),
                    };
                }
                DiscardSnapshotFutureState::SecureSb { secure_fut } => {
                    match SbCtlFuture::poll(pin::Pin::new(secure_fut), sbctl, env, cx) {
                        task::Poll::Ready(Ok(_)) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    log::debug!("sbctl: unpinned snapshots of generation {}", this.generation);
                    this.fut_state = DiscardSnapshotFutureState::Done;
                    return task::Poll::Ready(Ok(()));
                }
                DiscardSnapshotFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = DiscardSnapshotFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}

/// Explicit durability checkpoint.
///
/// Returns the generation secured.
pub struct SynchronizeFuture<E: SbCtlEnv> {
    fut_state: SynchronizeFutureState<E>,
}

enum SynchronizeFutureState<E: SbCtlEnv> {
    Init,
    SecureSb { secure_fut: SecureSuperblockFuture<E> },
    Done,
}

impl<E: SbCtlEnv> SynchronizeFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "synchronize init",
            Self::SecureSb { .. } => "secure superblock",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> SynchronizeFuture<E> {
    pub fn new() -> Self {
        Self {
            fut_state: SynchronizeFutureState::Init,
        }
    }
}

impl<E: SbCtlEnv> Default for SynchronizeFuture<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SbCtlEnv> marker::Unpin for SynchronizeFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for SynchronizeFuture<E> {
    type Output = Result<Generation, SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        sbctl: &mut SuperblockControl,
        env: &E,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);

        let e = loop {
            match &mut this.fut_state {
                SynchronizeFutureState::Init => {
                    if !sbctl.sb.is_valid() {
                        break SbCtlError::NotInitialized;
                    }
                    sbctl.sb.last_secured_generation = sbctl.curr_gen;
                    this.fut_state = SynchronizeFutureState::SecureSb {
                        secure_fut: SecureSuperblockFuture::new(),
                    };
                }
                SynchronizeFutureState::SecureSb { secure_fut } => {
                    let generation = match SbCtlFuture::poll(pin::Pin::new(secure_fut), sbctl, env, cx) {
                        task::Poll::Ready(Ok(generation)) => generation,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    this.fut_state = SynchronizeFutureState::Done;
                    return task::Poll::Ready(Ok(generation));
                }
                SynchronizeFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = SynchronizeFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}
