// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Implementation of [`InitializeFuture`] and [`DeinitializeFuture`].

extern crate alloc;
use alloc::boxed::Box;

use super::{SbCtlFuture, SecureSuperblockFuture, SuperblockControl};
use crate::{
    backend::{
        BackendFuture, SbCtlEnv,
        block_io::{BlockIo, BlockIoError},
        crypto::Crypto,
        trust_anchor::TrustAnchor,
    },
    error::SbCtlError,
    keys::Key,
    sbctl_err_internal,
    superblock::{Superblock, SuperblockCiphertext, SuperblockState, check_block_hash},
    types::{Generation, Hash, box_try_new, new_zeroed_block},
};
use core::{marker, mem, pin, task};

/// Mount a volume.
///
/// Locates the authoritative superblock by scanning the on-disk slots for the
/// one matching the hash recorded at the trust anchor, unwraps its keys and
/// registers them with the crypto module. The recovered superblock's state
/// gets returned, so that the caller may resume any long-running operation
/// found to be in progress.
pub struct InitializeFuture<E: SbCtlEnv> {
    fut_state: InitializeFutureState<E>,
}

/// A found superblock being mounted.
struct RecoveredSuperblock {
    sb_ciphertext: Box<SuperblockCiphertext>,
    slot: u32,
    generation: Generation,
    curr_gen: Generation,
}

enum InitializeFutureState<E: SbCtlEnv> {
    Init,
    ReadHash {
        read_hash_fut: <E::TrustAnchor as TrustAnchor>::ReadHashFuture,
    },
    ReadSlot {
        slot: u32,
        expected_hash: Hash,
        read_fut: <E::BlockIo as BlockIo>::ReadFuture,
    },
    DecryptCurrentKey {
        recovered: RecoveredSuperblock,
        decrypt_fut: <E::TrustAnchor as TrustAnchor>::DecryptKeyFuture,
    },
    AddCurrentKey {
        recovered: RecoveredSuperblock,
        current_key: Key,
        add_fut: <E::Crypto as Crypto>::AddKeyFuture,
    },
    DecryptPreviousKey {
        recovered: RecoveredSuperblock,
        current_key: Key,
        decrypt_fut: <E::TrustAnchor as TrustAnchor>::DecryptKeyFuture,
    },
    AddPreviousKey {
        recovered: RecoveredSuperblock,
        current_key: Key,
        previous_key: Key,
        add_fut: <E::Crypto as Crypto>::AddKeyFuture,
    },
    Done,
}

impl<E: SbCtlEnv> InitializeFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "initialize init",
            Self::ReadHash { .. } => "read superblock hash",
            Self::ReadSlot { .. } => "read superblock slot",
            Self::DecryptCurrentKey { .. } => "decrypt current key",
            Self::AddCurrentKey { .. } => "add current key",
            Self::DecryptPreviousKey { .. } => "decrypt previous key",
            Self::AddPreviousKey { .. } => "add previous key",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> InitializeFuture<E> {
    pub fn new() -> Self {
        Self {
            fut_state: InitializeFutureState::Init,
        }
    }

    fn read_slot(env: &E, slot: u32, expected_hash: Hash) -> Result<InitializeFutureState<E>, SbCtlError> {
        let block = new_zeroed_block()?;
        let read_fut = env.block_io().read_block(slot, block)?;
        Ok(InitializeFutureState::ReadSlot {
            slot,
            expected_hash,
            read_fut,
        })
    }

    /// Install the recovered superblock as the live one.
    fn mount(
        sbctl: &mut SuperblockControl,
        recovered: RecoveredSuperblock,
        current_key: Key,
        previous_key: Option<Key>,
    ) -> SuperblockState {
        let RecoveredSuperblock {
            sb_ciphertext,
            slot,
            generation,
            curr_gen,
        } = recovered;
        let previous_key = previous_key.unwrap_or_else(|| Key::new_zeroed(sb_ciphertext.previous_key.id));
        sbctl.sb = (*sb_ciphertext).into_plaintext(current_key, previous_key);
        sbctl.curr_gen = curr_gen;
        sbctl.sb_slot_idx = slot;
        sbctl.committed_sb_slot_idx = slot;
        log::info!(
            "sbctl: mounted superblock from slot {}, generation {}, state {:?}",
            slot,
            generation,
            sbctl.sb.state
        );
        sbctl.sb.state
    }
}

impl<E: SbCtlEnv> Default for InitializeFuture<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SbCtlEnv> marker::Unpin for InitializeFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for InitializeFuture<E> {
    type Output = Result<SuperblockState, SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        sbctl: &mut SuperblockControl,
        env: &E,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);

        let e = loop {
            match &mut this.fut_state {
                InitializeFutureState::Init => {
                    if sbctl.sb.is_valid() {
                        break SbCtlError::IncompatibleState;
                    }
                    let read_hash_fut = match env.trust_anchor().read_hash() {
                        Ok(read_hash_fut) => read_hash_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = InitializeFutureState::ReadHash { read_hash_fut };
                }
                InitializeFutureState::ReadHash { read_hash_fut } => {
                    let expected_hash = match BackendFuture::poll(pin::Pin::new(read_hash_fut), env.trust_anchor(), cx)
                    {
                        task::Poll::Ready(Ok(expected_hash)) => expected_hash,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    this.fut_state = match Self::read_slot(env, 0, expected_hash) {
                        Ok(fut_state) => fut_state,
                        Err(e) => break e,
                    };
                }
                InitializeFutureState::ReadSlot {
                    slot,
                    expected_hash,
                    read_fut,
                } => {
                    let slot = *slot;
                    let expected_hash = *expected_hash;
                    let found = match BackendFuture::poll(pin::Pin::new(read_fut), env.block_io(), cx) {
                        task::Poll::Ready(Ok((block, Ok(())))) => {
                            if check_block_hash(&block, &expected_hash) {
                                let sb_ciphertext = match SuperblockCiphertext::decode(&block) {
                                    Ok(sb_ciphertext) => sb_ciphertext,
                                    Err(e) => break e,
                                };
                                if sb_ciphertext.is_valid() {
                                    Some(sb_ciphertext)
                                } else {
                                    log::debug!("sbctl: skipping invalid superblock in slot {}", slot);
                                    None
                                }
                            } else {
                                None
                            }
                        }
                        task::Poll::Ready(Ok((_, Err(BlockIoError::SlotNotMapped)))) => None,
                        task::Poll::Ready(Ok((_, Err(e))) | Err(e)) => break SbCtlError::from(e),
                        task::Poll::Pending => return task::Poll::Pending,
                    };

                    let sb_ciphertext = match found {
                        Some(sb_ciphertext) => sb_ciphertext,
                        None => {
                            let next_slot = slot + 1;
                            if next_slot == sbctl.config.nr_of_superblock_slots {
                                break SbCtlError::SuperblockNotFound;
                            }
                            this.fut_state = match Self::read_slot(env, next_slot, expected_hash) {
                                Ok(fut_state) => fut_state,
                                Err(e) => break e,
                            };
                            continue;
                        }
                    };

                    if let Err(e) = sb_ciphertext.validate() {
                        break e;
                    }
                    let generation = match sb_ciphertext.snapshots.newest_snapshot_idx() {
                        Ok(idx) => sb_ciphertext.snapshots.items[idx].generation,
                        Err(e) => break e,
                    };
                    // Before any key gets registered with the crypto module.
                    let curr_gen = match generation.next() {
                        Ok(curr_gen) => curr_gen,
                        Err(e) => break e,
                    };
                    log::debug!(
                        "sbctl: found superblock of generation {} in slot {}",
                        generation,
                        slot
                    );

                    let decrypt_fut = match env.trust_anchor().decrypt_key(sb_ciphertext.current_key.value) {
                        Ok(decrypt_fut) => decrypt_fut,
                        Err(e) => break e,
                    };
                    let sb_ciphertext = match box_try_new(sb_ciphertext) {
                        Ok(sb_ciphertext) => sb_ciphertext,
                        Err(e) => break e,
                    };
                    this.fut_state = InitializeFutureState::DecryptCurrentKey {
                        recovered: RecoveredSuperblock {
                            sb_ciphertext,
                            slot,
                            generation,
                            curr_gen,
                        },
                        decrypt_fut,
                    };
                }
                InitializeFutureState::DecryptCurrentKey { recovered, decrypt_fut } => {
                    let value = match BackendFuture::poll(pin::Pin::new(decrypt_fut), env.trust_anchor(), cx) {
                        task::Poll::Ready(Ok(value)) => value,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let current_key = Key {
                        id: recovered.sb_ciphertext.current_key.id,
                        value,
                    };
                    let add_fut = match env.crypto().add_key(current_key.clone()) {
                        Ok(add_fut) => add_fut,
                        Err(e) => break e,
                    };
                    let recovered = match mem::replace(&mut this.fut_state, InitializeFutureState::Done) {
                        InitializeFutureState::DecryptCurrentKey { recovered, .. } => recovered,
                        _ => break sbctl_err_internal!(),
                    };
                    this.fut_state = InitializeFutureState::AddCurrentKey {
                        recovered,
                        current_key,
                        add_fut,
                    };
                }
                InitializeFutureState::AddCurrentKey {
                    recovered,
                    current_key: _,
                    add_fut,
                } => {
                    match BackendFuture::poll(pin::Pin::new(add_fut), env.crypto(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };

                    let decrypt_fut = if recovered.sb_ciphertext.state == SuperblockState::Rekeying {
                        match env.trust_anchor().decrypt_key(recovered.sb_ciphertext.previous_key.value) {
                            Ok(decrypt_fut) => Some(decrypt_fut),
                            Err(e) => break e,
                        }
                    } else {
                        None
                    };

                    let (recovered, current_key) = match mem::replace(&mut this.fut_state, InitializeFutureState::Done) {
                        InitializeFutureState::AddCurrentKey {
                            recovered, current_key, ..
                        } => (recovered, current_key),
                        _ => break sbctl_err_internal!(),
                    };
                    match decrypt_fut {
                        Some(decrypt_fut) => {
                            this.fut_state = InitializeFutureState::DecryptPreviousKey {
                                recovered,
                                current_key,
                                decrypt_fut,
                            };
                        }
                        None => {
                            return task::Poll::Ready(Ok(Self::mount(sbctl, recovered, current_key, None)));
                        }
                    }
                }
                InitializeFutureState::DecryptPreviousKey {
                    recovered,
                    current_key: _,
                    decrypt_fut,
                } => {
                    let value = match BackendFuture::poll(pin::Pin::new(decrypt_fut), env.trust_anchor(), cx) {
                        task::Poll::Ready(Ok(value)) => value,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let previous_key = Key {
                        id: recovered.sb_ciphertext.previous_key.id,
                        value,
                    };
                    let add_fut = match env.crypto().add_key(previous_key.clone()) {
                        Ok(add_fut) => add_fut,
                        Err(e) => break e,
                    };
                    let (recovered, current_key) = match mem::replace(&mut this.fut_state, InitializeFutureState::Done) {
                        InitializeFutureState::DecryptPreviousKey {
                            recovered, current_key, ..
                        } => (recovered, current_key),
                        _ => break sbctl_err_internal!(),
                    };
                    this.fut_state = InitializeFutureState::AddPreviousKey {
                        recovered,
                        current_key,
                        previous_key,
                        add_fut,
                    };
                }
                InitializeFutureState::AddPreviousKey { add_fut, .. } => {
                    match BackendFuture::poll(pin::Pin::new(add_fut), env.crypto(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    match mem::replace(&mut this.fut_state, InitializeFutureState::Done) {
                        InitializeFutureState::AddPreviousKey {
                            recovered,
                            current_key,
                            previous_key,
                            ..
                        } => {
                            return task::Poll::Ready(Ok(Self::mount(sbctl, recovered, current_key, Some(previous_key))));
                        }
                        _ => break sbctl_err_internal!(),
                    }
                }
                InitializeFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = InitializeFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}

/// Unmount a volume.
///
/// Secures the superblock a final time, drops the keys from the crypto module
/// and resets the live superblock to [`Invalid`](SuperblockState::Invalid).
pub struct DeinitializeFuture<E: SbCtlEnv> {
    fut_state: DeinitializeFutureState<E>,
}

enum DeinitializeFutureState<E: SbCtlEnv> {
    Init,
    SecureSb {
        secure_fut: SecureSuperblockFuture<E>,
    },
    RemoveCurrentKey {
        remove_fut: <E::Crypto as Crypto>::RemoveKeyFuture,
    },
    RemovePreviousKey {
        remove_fut: <E::Crypto as Crypto>::RemoveKeyFuture,
    },
    Done,
}

impl<E: SbCtlEnv> DeinitializeFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "deinitialize init",
            Self::SecureSb { .. } => "secure superblock",
            Self::RemoveCurrentKey { .. } => "remove current key",
            Self::RemovePreviousKey { .. } => "remove previous key",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> DeinitializeFuture<E> {
    pub fn new() -> Self {
        Self {
            fut_state: DeinitializeFutureState::Init,
        }
    }

    fn unmount(sbctl: &mut SuperblockControl) {
        log::info!(
            "sbctl: unmounted superblock, last secured generation {}",
            sbctl.sb.last_secured_generation
        );
        sbctl.sb = Superblock::new_invalid();
    }
}

impl<E: SbCtlEnv> Default for DeinitializeFuture<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SbCtlEnv> marker::Unpin for DeinitializeFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for DeinitializeFuture<E> {
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
                DeinitializeFutureState::Init => {
                    if !sbctl.sb.is_valid() {
                        break SbCtlError::NotInitialized;
                    }
                    sbctl.sb.last_secured_generation = sbctl.curr_gen;
                    this.fut_state = DeinitializeFutureState::SecureSb {
                        secure_fut: SecureSuperblockFuture::new(),
                    };
                }
                DeinitializeFutureState::SecureSb { secure_fut } => {
                    match SbCtlFuture::poll(pin::Pin::new(secure_fut), sbctl, env, cx) {
                        task::Poll::Ready(Ok(_)) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let remove_fut = match env.crypto().remove_key(sbctl.sb.current_key.id) {
                        Ok(remove_fut) => remove_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = DeinitializeFutureState::RemoveCurrentKey { remove_fut };
                }
                DeinitializeFutureState::RemoveCurrentKey { remove_fut } => {
                    match BackendFuture::poll(pin::Pin::new(remove_fut), env.crypto(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    if sbctl.sb.state != SuperblockState::Rekeying {
                        Self::unmount(sbctl);
                        this.fut_state = DeinitializeFutureState::Done;
                        return task::Poll::Ready(Ok(()));
                    }
                    let remove_fut = match env.crypto().remove_key(sbctl.sb.previous_key.id) {
                        Ok(remove_fut) => remove_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = DeinitializeFutureState::RemovePreviousKey { remove_fut };
                }
                DeinitializeFutureState::RemovePreviousKey { remove_fut } => {
                    match BackendFuture::poll(pin::Pin::new(remove_fut), env.crypto(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    Self::unmount(sbctl);
                    this.fut_state = DeinitializeFutureState::Done;
                    return task::Poll::Ready(Ok(()));
                }
                DeinitializeFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = DeinitializeFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}
