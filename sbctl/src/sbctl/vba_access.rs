// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Implementation of [`WriteVbasFuture`] and [`ReadVbasFuture`].

use super::{SbCtlFuture, SuperblockControl, TreeUpdateBase};
use crate::{
    backend::{
        BackendFuture, SbCtlEnv,
        vbd::{ClientBuffer, Vbd, VbdVbaAccess},
    },
    error::SbCtlError,
    sbctl_err_internal,
    superblock::{Superblock, SuperblockState},
    types::{KeyId, Vba},
};
use core::{marker, pin, task};

/// Validate a VBA range request against the current snapshot.
fn check_vba_range(sb: &Superblock, first_vba: Vba, num_vbas: u64) -> Result<(), SbCtlError> {
    if !sb.is_valid() {
        return Err(SbCtlError::NotInitialized);
    }
    if num_vbas == 0 {
        return Err(SbCtlError::ZeroBlocksRequested);
    }
    let last_vba = first_vba.0.checked_add(num_vbas - 1).ok_or(SbCtlError::InvalidVbaRange)?;
    if !sb.contains_vba(Vba(last_vba)) {
        return Err(SbCtlError::InvalidVbaRange);
    }
    Ok(())
}

/// The key a VBA's payload is currently encrypted with.
///
/// While rekeying, VBAs below the rekeying cursor had been migrated to the
/// current key already, the others are still under the previous one.
fn select_key_id(sb: &Superblock, vba: Vba) -> KeyId {
    if sb.state == SuperblockState::Rekeying && vba >= sb.rekeying_vba {
        sb.previous_key.id
    } else {
        sb.current_key.id
    }
}

fn vba_access(sbctl: &SuperblockControl, vba: Vba, buffer: ClientBuffer) -> VbdVbaAccess {
    let sb = &sbctl.sb;
    VbdVbaAccess {
        vba,
        key_id: select_key_id(sb, vba),
        current_key_id: sb.current_key.id,
        previous_key_id: sb.previous_key.id,
        rekeying: sb.state == SuperblockState::Rekeying,
        rekeying_vba: sb.rekeying_vba,
        degree: sb.degree,
        max_vba: sb.max_vba(),
        curr_gen: sbctl.curr_gen,
        last_secured_generation: sb.last_secured_generation,
        buffer,
    }
}

/// Write a range of VBAs.
///
/// Upon the first write in a new generation, the current snapshot gets
/// branched off into a fresh snapshot ring entry, which then becomes the
/// current one. The payload is provided by the client through the buffer
/// identified by `buffer_tag`, with VBA `first_vba + i` at offset `i`.
pub struct WriteVbasFuture<E: SbCtlEnv> {
    first_vba: Vba,
    num_vbas: u64,
    buffer_tag: u64,
    fut_state: WriteVbasFutureState<E>,
}

enum WriteVbasFutureState<E: SbCtlEnv> {
    Init,
    PrepareVba { index: u64 },
    WriteVba {
        index: u64,
        base: TreeUpdateBase,
        write_fut: <E::Vbd as Vbd>::WriteVbaFuture,
    },
    Done,
}

impl<E: SbCtlEnv> WriteVbasFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "write vbas init",
            Self::PrepareVba { .. } => "prepare vba write",
            Self::WriteVba { .. } => "write vba",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> WriteVbasFuture<E> {
    pub fn new(first_vba: Vba, num_vbas: u64, buffer_tag: u64) -> Self {
        Self {
            first_vba,
            num_vbas,
            buffer_tag,
            fut_state: WriteVbasFutureState::Init,
        }
    }

    /// Make the current snapshot one belonging to the current generation.
    fn branch_snapshot(sbctl: &mut SuperblockControl) -> Result<(), SbCtlError> {
        let curr_gen = sbctl.curr_gen;
        let curr_snap = *sbctl.sb.curr_snap();
        if curr_snap.generation == curr_gen {
            return Ok(());
        } else if curr_snap.generation > curr_gen {
            return Err(sbctl_err_internal!());
        }

        let idx = sbctl
            .sb
            .snapshots
            .idx_of_invalid_or_lowest_gen_evictable_snap(curr_gen, sbctl.sb.last_secured_generation)?;
        log::debug!(
            "sbctl: branching snapshot {} (generation {}) into {} for generation {}",
            sbctl.sb.curr_snap_idx,
            curr_snap.generation,
            idx,
            curr_gen
        );
        sbctl.sb.snapshots.items[idx] = curr_snap;
        let new_snap = &mut sbctl.sb.snapshots.items[idx];
        new_snap.generation = curr_gen;
        new_snap.keep = false;
        sbctl.sb.curr_snap_idx = idx;
        Ok(())
    }
}

impl<E: SbCtlEnv> marker::Unpin for WriteVbasFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for WriteVbasFuture<E> {
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
                WriteVbasFutureState::Init => {
                    if let Err(e) = check_vba_range(&sbctl.sb, this.first_vba, this.num_vbas) {
                        break e;
                    }
                    this.fut_state = WriteVbasFutureState::PrepareVba { index: 0 };
                }
                WriteVbasFutureState::PrepareVba { index } => {
                    let index = *index;
                    if index == this.num_vbas {
                        this.fut_state = WriteVbasFutureState::Done;
                        return task::Poll::Ready(Ok(()));
                    }

                    if let Err(e) = Self::branch_snapshot(sbctl) {
                        break e;
                    }

                    let vba = Vba(this.first_vba.0 + index);
                    let access = vba_access(
                        sbctl,
                        vba,
                        ClientBuffer {
                            tag: this.buffer_tag,
                            offset: index,
                        },
                    );
                    log::debug!(
                        "sbctl: write vba {} in snapshot {} with key {}, generation {}",
                        vba,
                        sbctl.sb.curr_snap_idx,
                        access.key_id,
                        sbctl.curr_gen
                    );
                    let base = sbctl.tree_update_base();
                    let write_fut = match env.vbd().write_vba(
                        access,
                        *sbctl.sb.curr_snap(),
                        sbctl.sb.free_tree,
                        sbctl.sb.meta_tree,
                    ) {
                        Ok(write_fut) => write_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = WriteVbasFutureState::WriteVba { index, base, write_fut };
                }
                WriteVbasFutureState::WriteVba { index, base, write_fut } => {
                    let index = *index;
                    let result = match BackendFuture::poll(pin::Pin::new(write_fut), env.vbd(), cx) {
                        task::Poll::Ready(result) => result,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    if sbctl.tree_update_conflicts(base) {
                        // Issued against a stale snapshot or key selection,
                        // write the VBA again.
                        log::debug!(
                            "sbctl: superblock modified during write of vba {}, retry",
                            Vba(this.first_vba.0 + index)
                        );
                        if let Err(e) = check_vba_range(&sbctl.sb, this.first_vba, this.num_vbas) {
                            break e;
                        }
                        this.fut_state = WriteVbasFutureState::PrepareVba { index };
                        continue;
                    }
                    let output = match result {
                        Ok(output) => output,
                        Err(e) => break e,
                    };
                    *sbctl.sb.curr_snap_mut() = output.snapshot;
                    sbctl.sb.free_tree = output.free_tree;
                    sbctl.sb.meta_tree = output.meta_tree;
                    this.fut_state = WriteVbasFutureState::PrepareVba { index: index + 1 };
                }
                WriteVbasFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = WriteVbasFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}

/// Read a range of VBAs from the current snapshot.
///
/// The payload is handed to the client through the buffer identified by
/// `buffer_tag`, with VBA `first_vba + i` at offset `i`.
pub struct ReadVbasFuture<E: SbCtlEnv> {
    first_vba: Vba,
    num_vbas: u64,
    buffer_tag: u64,
    fut_state: ReadVbasFutureState<E>,
}

enum ReadVbasFutureState<E: SbCtlEnv> {
    Init,
    PrepareVba { index: u64 },
    ReadVba {
        index: u64,
        base: TreeUpdateBase,
        read_fut: <E::Vbd as Vbd>::ReadVbaFuture,
    },
    Done,
}

impl<E: SbCtlEnv> ReadVbasFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "read vbas init",
            Self::PrepareVba { .. } => "prepare vba read",
            Self::ReadVba { .. } => "read vba",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> ReadVbasFuture<E> {
    pub fn new(first_vba: Vba, num_vbas: u64, buffer_tag: u64) -> Self {
        Self {
            first_vba,
            num_vbas,
            buffer_tag,
            fut_state: ReadVbasFutureState::Init,
        }
    }
}

impl<E: SbCtlEnv> marker::Unpin for ReadVbasFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for ReadVbasFuture<E> {
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
                ReadVbasFutureState::Init => {
                    if let Err(e) = check_vba_range(&sbctl.sb, this.first_vba, this.num_vbas) {
                        break e;
                    }
                    this.fut_state = ReadVbasFutureState::PrepareVba { index: 0 };
                }
                ReadVbasFutureState::PrepareVba { index } => {
                    let index = *index;
                    if index == this.num_vbas {
                        this.fut_state = ReadVbasFutureState::Done;
                        return task::Poll::Ready(Ok(()));
                    }

                    let vba = Vba(this.first_vba.0 + index);
                    let access = vba_access(
                        sbctl,
                        vba,
                        ClientBuffer {
                            tag: this.buffer_tag,
                            offset: index,
                        },
                    );
                    log::debug!(
                        "sbctl: read vba {} from snapshot {} with key {}",
                        vba,
                        sbctl.sb.curr_snap_idx,
                        access.key_id
                    );
                    let base = sbctl.tree_update_base();
                    let read_fut = match env.vbd().read_vba(access, *sbctl.sb.curr_snap()) {
                        Ok(read_fut) => read_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = ReadVbasFutureState::ReadVba { index, base, read_fut };
                }
                ReadVbasFutureState::ReadVba { index, base, read_fut } => {
                    let index = *index;
                    match BackendFuture::poll(pin::Pin::new(read_fut), env.vbd(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => {
                            if !sbctl.tree_update_conflicts(base) {
                                break e;
                            }
                            // The key or snapshot read from might have been
                            // retired in the meanwhile.
                            log::debug!(
                                "sbctl: superblock modified during failed read of vba {}, retry",
                                Vba(this.first_vba.0 + index)
                            );
                            if let Err(e) = check_vba_range(&sbctl.sb, this.first_vba, this.num_vbas) {
                                break e;
                            }
                            this.fut_state = ReadVbasFutureState::PrepareVba { index };
                            continue;
                        }
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    this.fut_state = ReadVbasFutureState::PrepareVba { index: index + 1 };
                }
                ReadVbasFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = ReadVbasFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}
