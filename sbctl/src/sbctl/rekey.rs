// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Implementation of [`RekeyFuture`].

use super::{SbCtlFuture, SecureSuperblockFuture, SuperblockControl, TreeUpdateBase};
use crate::{
    backend::{
        BackendFuture, SbCtlEnv,
        crypto::Crypto,
        trust_anchor::TrustAnchor,
        vbd::{Vbd, VbdRekeyVbaArgs},
    },
    error::SbCtlError,
    keys::Key,
    superblock::{Superblock, SuperblockState},
    types::{KeyId, Vba},
};
use core::{marker, pin, task};

/// Result of a [`RekeyFuture`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RekeyOutput {
    /// Whether the rekeying has been completed. If not, the request is to be
    /// resubmitted for making further progress.
    pub rekeying_finished: bool,
}

/// Migrate all data from the current key to a freshly generated one.
///
/// When started from the [`Normal`](SuperblockState::Normal) state, a new
/// key gets generated by the trust anchor and registered with the crypto
/// module. The superblock, with the former current key now being the previous
/// one, then transitions to [`Rekeying`](SuperblockState::Rekeying), which
/// gets secured before any data is touched.
///
/// Afterwards, VBA by VBA, each gets reencrypted in all snapshots and the
/// rekeying cursor advanced, each step secured individually. Reads and writes
/// interleaved with the rekeying select the key based on that cursor. Once
/// all VBAs have been processed, the previous key gets dropped.
///
/// A rekeying interrupted by a crash gets resumed by resubmitting the request
/// after remount.
pub struct RekeyFuture<E: SbCtlEnv> {
    steps_done: u64,
    fut_state: RekeyFutureState<E>,
}

enum RekeyFutureState<E: SbCtlEnv> {
    Init,
    GenerateKey {
        key_id: KeyId,
        generate_fut: <E::TrustAnchor as TrustAnchor>::GenerateKeyFuture,
    },
    AddKey {
        key: Key,
        add_fut: <E::Crypto as Crypto>::AddKeyFuture,
    },
    RekeyVba {
        base: TreeUpdateBase,
        rekey_fut: <E::Vbd as Vbd>::RekeyVbaFuture,
    },
    RemoveKey {
        remove_fut: <E::Crypto as Crypto>::RemoveKeyFuture,
    },
    SecureSb {
        secure_fut: SecureSuperblockFuture<E>,
        rekeying_finished: bool,
    },
    Done,
}

impl<E: SbCtlEnv> RekeyFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "rekey init",
            Self::GenerateKey { .. } => "generate key",
            Self::AddKey { .. } => "add key",
            Self::RekeyVba { .. } => "rekey vba",
            Self::RemoveKey { .. } => "remove key",
            Self::SecureSb { .. } => "secure superblock",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> RekeyFuture<E> {
    pub fn new() -> Self {
        Self {
            steps_done: 0,
            fut_state: RekeyFutureState::Init,
        }
    }

    fn init(sbctl: &SuperblockControl, env: &E) -> Result<RekeyFutureState<E>, SbCtlError> {
        let sb = &sbctl.sb;
        match sb.state {
            SuperblockState::Invalid => Err(SbCtlError::NotInitialized),
            SuperblockState::Normal => {
                let key_id = sb.current_key.id.next()?;
                let generate_fut = env.trust_anchor().generate_key()?;
                Ok(RekeyFutureState::GenerateKey { key_id, generate_fut })
            }
            SuperblockState::Rekeying => {
                log::debug!(
                    "sbctl: rekey vba {} from key {} to key {}, generation {}",
                    sb.rekeying_vba,
                    sb.previous_key.id,
                    sb.current_key.id,
                    sbctl.curr_gen
                );
                let base = sbctl.tree_update_base();
                let rekey_fut = env.vbd().rekey_vba(VbdRekeyVbaArgs {
                    snapshots: sb.snapshots,
                    vba: sb.rekeying_vba,
                    previous_key_id: sb.previous_key.id,
                    current_key_id: sb.current_key.id,
                    degree: sb.degree,
                    curr_gen: sbctl.curr_gen,
                    last_secured_generation: sb.last_secured_generation,
                    free_tree: sb.free_tree,
                    meta_tree: sb.meta_tree,
                })?;
                Ok(RekeyFutureState::RekeyVba { base, rekey_fut })
            }
            SuperblockState::ExtendingVbd | SuperblockState::ExtendingFt => Err(SbCtlError::IncompatibleState),
        }
    }

    /// Whether a rekeying to `key_id` may still get started, i.e. no other
    /// one got started in the meanwhile.
    fn may_start(sb: &Superblock, key_id: KeyId) -> bool {
        sb.state == SuperblockState::Normal && sb.current_key.id.next().ok() == Some(key_id)
    }
}

impl<E: SbCtlEnv> Default for RekeyFuture<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SbCtlEnv> marker::Unpin for RekeyFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for RekeyFuture<E> {
    type Output = Result<RekeyOutput, SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        sbctl: &mut SuperblockControl,
        env: &E,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);

        let e = loop {
            match &mut this.fut_state {
                RekeyFutureState::Init => {
                    this.fut_state = match Self::init(sbctl, env) {
                        Ok(fut_state) => fut_state,
                        Err(e) => break e,
                    };
                }
                RekeyFutureState::GenerateKey { key_id, generate_fut } => {
                    let value = match BackendFuture::poll(pin::Pin::new(generate_fut), env.trust_anchor(), cx) {
                        task::Poll::Ready(Ok(value)) => value,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let key = Key { id: *key_id, value };
                    if !Self::may_start(&sbctl.sb, key.id) {
                        break SbCtlError::IncompatibleState;
                    }
                    let add_fut = match env.crypto().add_key(key.clone()) {
                        Ok(add_fut) => add_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = RekeyFutureState::AddKey { key, add_fut };
                }
                RekeyFutureState::AddKey { key, add_fut } => {
                    match BackendFuture::poll(pin::Pin::new(add_fut), env.crypto(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };

                    // The live superblock switches keys only now that the new
                    // one is known to the crypto module.
                    let sb = &mut sbctl.sb;
                    if !Self::may_start(sb, key.id) {
                        break SbCtlError::IncompatibleState;
                    }
                    let key = core::mem::replace(key, Key::new_zeroed(KeyId(0)));
                    sb.previous_key = core::mem::replace(&mut sb.current_key, key);
                    sb.rekeying_vba = Vba(0);
                    sb.state = SuperblockState::Rekeying;
                    log::debug!(
                        "sbctl: start rekeying from key {} to key {}",
                        sb.previous_key.id,
                        sb.current_key.id
                    );
                    this.fut_state = RekeyFutureState::SecureSb {
                        secure_fut: SecureSuperblockFuture::new(),
                        rekeying_finished: false,
                    };
                }
                RekeyFutureState::RekeyVba { base, rekey_fut } => {
                    let output = match BackendFuture::poll(pin::Pin::new(rekey_fut), env.vbd(), cx) {
                        task::Poll::Ready(Ok(output)) => output,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    if sbctl.tree_update_conflicts(base) {
                        if sbctl.sb.state != SuperblockState::Rekeying {
                            break SbCtlError::IncompatibleState;
                        }
                        log::debug!("sbctl: superblock modified during rekey of vba {}, retry", sbctl.sb.rekeying_vba);
                        this.fut_state = RekeyFutureState::Init;
                        continue;
                    }
                    let sb = &mut sbctl.sb;
                    sb.snapshots = output.snapshots;
                    sb.free_tree = output.free_tree;
                    sb.meta_tree = output.meta_tree;

                    let max_nr_of_leaves = sb.snapshots.max_nr_of_leaves();
                    if sb.rekeying_vba.0.saturating_add(1) < max_nr_of_leaves {
                        sb.rekeying_vba = Vba(sb.rekeying_vba.0 + 1);
                        this.fut_state = RekeyFutureState::SecureSb {
                            secure_fut: SecureSuperblockFuture::new(),
                            rekeying_finished: false,
                        };
                    } else {
                        let remove_fut = match env.crypto().remove_key(sb.previous_key.id) {
                            Ok(remove_fut) => remove_fut,
                            Err(e) => break e,
                        };
                        this.fut_state = RekeyFutureState::RemoveKey { remove_fut };
                    }
                }
                RekeyFutureState::RemoveKey { remove_fut } => {
                    match BackendFuture::poll(pin::Pin::new(remove_fut), env.crypto(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let sb = &mut sbctl.sb;
                    log::debug!("sbctl: rekeying to key {} completed", sb.current_key.id);
                    sb.previous_key.clear();
                    sb.state = SuperblockState::Normal;
                    this.fut_state = RekeyFutureState::SecureSb {
                        secure_fut: SecureSuperblockFuture::new(),
                        rekeying_finished: true,
                    };
                }
                RekeyFutureState::SecureSb {
                    secure_fut,
                    rekeying_finished,
                } => {
                    match SbCtlFuture::poll(pin::Pin::new(secure_fut), sbctl, env, cx) {
                        task::Poll::Ready(Ok(_)) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    this.steps_done += 1;
                    let rekeying_finished = *rekeying_finished;
                    if rekeying_finished || sbctl.steps_quota_exhausted(this.steps_done) {
                        this.fut_state = RekeyFutureState::Done;
                        return task::Poll::Ready(Ok(RekeyOutput { rekeying_finished }));
                    }
                    this.fut_state = RekeyFutureState::Init;
                }
                RekeyFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = RekeyFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}
