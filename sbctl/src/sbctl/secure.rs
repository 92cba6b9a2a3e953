// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Implementation of [`SecureSuperblockFuture`].

extern crate alloc;
use alloc::boxed::Box;

use super::{SbCtlFuture, SuperblockControl};
use crate::{
    backend::{BackendFuture, SbCtlEnv, block_io::BlockIo, trust_anchor::TrustAnchor},
    error::SbCtlError,
    superblock::{SuperblockCiphertext, SuperblockState, calc_block_hash},
    types::{Block, Generation, box_try_new, new_zeroed_block},
};
use core::{pin, task};

/// Persist the live [`Superblock`](crate::superblock::Superblock).
///
/// The current snapshot gets stamped with the current generation and the
/// superblock written, with its keys wrapped by the trust anchor, to the next
/// on-disk slot. After a sync, the written block's hash gets recorded at the
/// trust anchor, which is the commit point. A subsequent
/// [`InitializeFuture`](super::InitializeFuture) will recover exactly the
/// state persisted.
///
/// Upon success, the generation secured gets returned.
pub struct SecureSuperblockFuture<E: SbCtlEnv> {
    fut_state: SecureSuperblockFutureState<E>,
}

enum SecureSuperblockFutureState<E: SbCtlEnv> {
    Init,
    EncryptKey {
        sb_ciphertext: Box<SuperblockCiphertext>,
        /// Whether the previous key is being wrapped, the current one
        /// otherwise.
        previous: bool,
        encrypt_fut: <E::TrustAnchor as TrustAnchor>::EncryptKeyFuture,
    },
    WriteBlock {
        slot: u32,
        write_fut: <E::BlockIo as BlockIo>::WriteFuture,
    },
    Sync {
        slot: u32,
        block: Box<Block>,
        sync_fut: <E::BlockIo as BlockIo>::SyncFuture,
    },
    WriteHash {
        slot: u32,
        generation: Generation,
        write_hash_fut: <E::TrustAnchor as TrustAnchor>::WriteHashFuture,
    },
    Done,
}

impl<E: SbCtlEnv> SecureSuperblockFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "secure superblock init",
            Self::EncryptKey { previous: false, .. } => "encrypt current key",
            Self::EncryptKey { previous: true, .. } => "encrypt previous key",
            Self::WriteBlock { .. } => "write superblock",
            Self::Sync { .. } => "sync block io",
            Self::WriteHash { .. } => "write superblock hash",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> SecureSuperblockFuture<E> {
    pub fn new() -> Self {
        Self {
            fut_state: SecureSuperblockFutureState::Init,
        }
    }

    /// Serialize the ciphertext superblock and submit the write to the next
    /// slot.
    fn write_block(
        sbctl: &SuperblockControl,
        env: &E,
        sb_ciphertext: &SuperblockCiphertext,
    ) -> Result<SecureSuperblockFutureState<E>, SbCtlError> {
        let mut block = new_zeroed_block()?;
        sb_ciphertext.encode(&mut block)?;
        let slot = sbctl.next_sb_slot_idx();
        log::debug!("sbctl: writing superblock for generation {} to slot {}", sbctl.curr_gen, slot);
        let write_fut = env.block_io().write_block(slot, block)?;
        Ok(SecureSuperblockFutureState::WriteBlock { slot, write_fut })
    }
}

impl<E: SbCtlEnv> Default for SecureSuperblockFuture<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SbCtlEnv> core::marker::Unpin for SecureSuperblockFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for SecureSuperblockFuture<E> {
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
                SecureSuperblockFutureState::Init => {
                    if !sbctl.sb.is_valid() {
                        break SbCtlError::NotInitialized;
                    }

                    let curr_gen = sbctl.curr_gen;
                    let last_secured_generation = sbctl.sb.last_secured_generation;
                    sbctl.sb.curr_snap_mut().generation = curr_gen;
                    sbctl
                        .sb
                        .snapshots
                        .discard_disposable_snapshots(curr_gen, last_secured_generation);

                    // The on-disk copy records the generation being secured as
                    // the last secured one, just as the live superblock will
                    // once the hash write has completed.
                    let mut sb_ciphertext = sbctl.sb.to_ciphertext();
                    sb_ciphertext.last_secured_generation = curr_gen;
                    let sb_ciphertext = match box_try_new(sb_ciphertext) {
                        Ok(sb_ciphertext) => sb_ciphertext,
                        Err(e) => break e,
                    };

                    let encrypt_fut = match env.trust_anchor().encrypt_key(sbctl.sb.current_key.value.clone()) {
                        Ok(encrypt_fut) => encrypt_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = SecureSuperblockFutureState::EncryptKey {
                        sb_ciphertext,
                        previous: false,
                        encrypt_fut,
                    };
                }
                SecureSuperblockFutureState::EncryptKey {
                    sb_ciphertext,
                    previous,
                    encrypt_fut,
                } => {
                    let wrapped_key = match BackendFuture::poll(pin::Pin::new(encrypt_fut), env.trust_anchor(), cx) {
                        task::Poll::Ready(Ok(wrapped_key)) => wrapped_key,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };

                    if *previous {
                        sb_ciphertext.previous_key.value = wrapped_key;
                    } else {
                        sb_ciphertext.current_key.value = wrapped_key;
                        if sbctl.sb.state == SuperblockState::Rekeying {
                            *encrypt_fut = match env.trust_anchor().encrypt_key(sbctl.sb.previous_key.value.clone()) {
                                Ok(encrypt_fut) => encrypt_fut,
                                Err(e) => break e,
                            };
                            *previous = true;
                            continue;
                        }
                    }

                    this.fut_state = match Self::write_block(sbctl, env, sb_ciphertext) {
                        Ok(fut_state) => fut_state,
                        Err(e) => break e,
                    };
                }
                SecureSuperblockFutureState::WriteBlock { slot, write_fut } => {
                    let block = match BackendFuture::poll(pin::Pin::new(write_fut), env.block_io(), cx) {
                        task::Poll::Ready(Ok((block, Ok(())))) => block,
                        task::Poll::Ready(Ok((_, Err(e))) | Err(e)) => break SbCtlError::from(e),
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let sync_fut = match env.block_io().sync() {
                        Ok(sync_fut) => sync_fut,
                        Err(e) => break SbCtlError::from(e),
                    };
                    this.fut_state = SecureSuperblockFutureState::Sync {
                        slot: *slot,
                        block,
                        sync_fut,
                    };
                }
                SecureSuperblockFutureState::Sync { slot, block, sync_fut } => {
                    match BackendFuture::poll(pin::Pin::new(sync_fut), env.block_io(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => break SbCtlError::from(e),
                        task::Poll::Pending => return task::Poll::Pending,
                    };

                    let hash = calc_block_hash(block);
                    let generation = sbctl.curr_gen;
                    let next_gen = match generation.next() {
                        Ok(next_gen) => next_gen,
                        Err(e) => break e,
                    };
                    sbctl.sb_slot_idx = *slot;
                    sbctl.curr_gen = next_gen;

                    let write_hash_fut = match env.trust_anchor().write_hash(hash) {
                        Ok(write_hash_fut) => write_hash_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = SecureSuperblockFutureState::WriteHash {
                        slot: *slot,
                        generation,
                        write_hash_fut,
                    };
                }
                SecureSuperblockFutureState::WriteHash {
                    slot,
                    generation,
                    write_hash_fut,
                } => {
                    match BackendFuture::poll(pin::Pin::new(write_hash_fut), env.trust_anchor(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };

                    let generation = *generation;
                    sbctl.committed_sb_slot_idx = *slot;
                    sbctl.sb.last_secured_generation = generation;
                    log::debug!("sbctl: secured generation {} in slot {}", generation, slot);
                    this.fut_state = SecureSuperblockFutureState::Done;
                    return task::Poll::Ready(Ok(generation));
                }
                SecureSuperblockFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = SecureSuperblockFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}
