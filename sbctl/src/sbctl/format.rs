// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Implementation of [`FormatFuture`].

use super::{SbCtlFuture, SuperblockControl};
use crate::{
    backend::{BackendFuture, SbCtlEnv, block_io::BlockIo, trust_anchor::TrustAnchor},
    error::{SbCtlError, SbCtlFormatError},
    keys::WrappedKey,
    superblock::{Snapshot, Superblock, SuperblockState, TreeRoot, calc_block_hash},
    types::{FREE_TREE_MIN_MAX_LEVEL, Generation, Hash, KeyId, Pba, TREE_MIN_DEGREE, Vba, new_zeroed_block},
};
use core::{marker, pin, task};

/// Geometry of a volume to be created with [`FormatFuture`].
///
/// The trees themselves are expected to have been set up already, only their
/// roots get recorded in the initial superblock.
#[derive(Clone, Copy, Debug)]
pub struct FormatParams {
    /// Branching factor of the block mapping tree.
    pub degree: u32,
    pub first_pba: Pba,
    pub nr_of_pbas: u64,
    pub vbd_root_pba: Pba,
    pub vbd_root_hash: Hash,
    pub vbd_max_level: u32,
    pub vbd_nr_of_leaves: u64,
    pub free_tree: TreeRoot,
    pub meta_tree: TreeRoot,
}

impl FormatParams {
    fn validate(&self) -> Result<(), SbCtlError> {
        if self.degree < TREE_MIN_DEGREE {
            return Err(SbCtlError::from(SbCtlFormatError::InvalidTreeDegree));
        }
        if self.free_tree.max_level < FREE_TREE_MIN_MAX_LEVEL {
            return Err(SbCtlError::from(SbCtlFormatError::InvalidFreeTreeMaxLevel));
        }
        if self.nr_of_pbas == 0 || self.first_pba.0.checked_add(self.nr_of_pbas - 1).is_none() {
            return Err(SbCtlError::from(SbCtlFormatError::InvalidPbaRange));
        }
        Ok(())
    }
}

/// Create a fresh volume's superblock ring.
///
/// The initial superblock, with a newly generated key, gets written to the
/// first slot and all other slots get invalidated. The written superblock's
/// hash is recorded at the trust anchor last.
///
/// The [`SuperblockControl`] must not have a volume mounted and stays
/// uninitialized: an [`InitializeFuture`](super::InitializeFuture) is to be
/// run afterwards for mounting the new volume.
pub struct FormatFuture<E: SbCtlEnv> {
    params: FormatParams,
    fut_state: FormatFutureState<E>,
}

enum FormatFutureState<E: SbCtlEnv> {
    Init,
    GenerateKey {
        generate_fut: <E::TrustAnchor as TrustAnchor>::GenerateKeyFuture,
    },
    EncryptKey {
        encrypt_fut: <E::TrustAnchor as TrustAnchor>::EncryptKeyFuture,
    },
    WriteSlot {
        slot: u32,
        hash: Hash,
        write_fut: <E::BlockIo as BlockIo>::WriteFuture,
    },
    Sync {
        hash: Hash,
        sync_fut: <E::BlockIo as BlockIo>::SyncFuture,
    },
    WriteHash {
        write_hash_fut: <E::TrustAnchor as TrustAnchor>::WriteHashFuture,
    },
    Done,
}

impl<E: SbCtlEnv> FormatFutureState<E> {
    fn step_label(&self) -> &'static str {
        match self {
            Self::Init => "format init",
            Self::GenerateKey { .. } => "generate key",
            Self::EncryptKey { .. } => "encrypt key",
            Self::WriteSlot { .. } => "write superblock slot",
            Self::Sync { .. } => "sync block io",
            Self::WriteHash { .. } => "write superblock hash",
            Self::Done => "done",
        }
    }
}

impl<E: SbCtlEnv> FormatFuture<E> {
    pub fn new(params: FormatParams) -> Self {
        Self {
            params,
            fut_state: FormatFutureState::Init,
        }
    }

    fn initial_superblock(&self, wrapped_key: WrappedKey) -> Superblock<WrappedKey> {
        let params = &self.params;
        let mut sb = Superblock::new_invalid().to_ciphertext();
        sb.state = SuperblockState::Normal;
        sb.rekeying_vba = Vba(0);
        sb.current_key = wrapped_key;
        sb.previous_key = WrappedKey::default();
        sb.snapshots.items[0] = Snapshot {
            hash: params.vbd_root_hash,
            pba: params.vbd_root_pba,
            generation: Generation(0),
            nr_of_leaves: params.vbd_nr_of_leaves,
            max_level: params.vbd_max_level,
            valid: true,
            id: 0,
            keep: false,
        };
        sb.curr_snap_idx = 0;
        sb.last_secured_generation = Generation(0);
        sb.degree = params.degree;
        sb.first_pba = params.first_pba;
        sb.nr_of_pbas = params.nr_of_pbas;
        sb.free_tree = params.free_tree;
        sb.meta_tree = params.meta_tree;
        sb
    }
}

impl<E: SbCtlEnv> marker::Unpin for FormatFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for FormatFuture<E> {
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
                FormatFutureState::Init => {
                    if sbctl.sb.is_valid() {
                        break SbCtlError::IncompatibleState;
                    }
                    if let Err(e) = this.params.validate() {
                        break e;
                    }
                    let generate_fut = match env.trust_anchor().generate_key() {
                        Ok(generate_fut) => generate_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = FormatFutureState::GenerateKey { generate_fut };
                }
                FormatFutureState::GenerateKey { generate_fut } => {
                    let value = match BackendFuture::poll(pin::Pin::new(generate_fut), env.trust_anchor(), cx) {
                        task::Poll::Ready(Ok(value)) => value,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let encrypt_fut = match env.trust_anchor().encrypt_key(value) {
                        Ok(encrypt_fut) => encrypt_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = FormatFutureState::EncryptKey { encrypt_fut };
                }
                FormatFutureState::EncryptKey { encrypt_fut } => {
                    let wrapped_key = match BackendFuture::poll(pin::Pin::new(encrypt_fut), env.trust_anchor(), cx) {
                        task::Poll::Ready(Ok(wrapped_key)) => wrapped_key,
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let sb = this.initial_superblock(WrappedKey {
                        id: KeyId(0),
                        value: wrapped_key,
                    });
                    let mut block = match new_zeroed_block() {
                        Ok(block) => block,
                        Err(e) => break e,
                    };
                    if let Err(e) = sb.encode(&mut block) {
                        break e;
                    }
                    let hash = calc_block_hash(&block);
                    let write_fut = match env.block_io().write_block(0, block) {
                        Ok(write_fut) => write_fut,
                        Err(e) => break SbCtlError::from(e),
                    };
                    this.fut_state = FormatFutureState::WriteSlot {
                        slot: 0,
                        hash,
                        write_fut,
                    };
                }
                FormatFutureState::WriteSlot { slot, hash, write_fut } => {
                    match BackendFuture::poll(pin::Pin::new(write_fut), env.block_io(), cx) {
                        task::Poll::Ready(Ok((_, Ok(())))) => (),
                        task::Poll::Ready(Ok((_, Err(e))) | Err(e)) => break SbCtlError::from(e),
                        task::Poll::Pending => return task::Poll::Pending,
                    };

                    let next_slot = *slot + 1;
                    let hash = *hash;
                    if next_slot < sbctl.config.nr_of_superblock_slots {
                        // All zeroes decodes to an invalid superblock.
                        let block = match new_zeroed_block() {
                            Ok(block) => block,
                            Err(e) => break e,
                        };
                        let write_fut = match env.block_io().write_block(next_slot, block) {
                            Ok(write_fut) => write_fut,
                            Err(e) => break SbCtlError::from(e),
                        };
                        this.fut_state = FormatFutureState::WriteSlot {
                            slot: next_slot,
                            hash,
                            write_fut,
                        };
                    } else {
                        let sync_fut = match env.block_io().sync() {
                            Ok(sync_fut) => sync_fut,
                            Err(e) => break SbCtlError::from(e),
                        };
                        this.fut_state = FormatFutureState::Sync { hash, sync_fut };
                    }
                }
                FormatFutureState::Sync { hash, sync_fut } => {
                    match BackendFuture::poll(pin::Pin::new(sync_fut), env.block_io(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => break SbCtlError::from(e),
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let write_hash_fut = match env.trust_anchor().write_hash(*hash) {
                        Ok(write_hash_fut) => write_hash_fut,
                        Err(e) => break e,
                    };
                    this.fut_state = FormatFutureState::WriteHash { write_hash_fut };
                }
                FormatFutureState::WriteHash { write_hash_fut } => {
                    match BackendFuture::poll(pin::Pin::new(write_hash_fut), env.trust_anchor(), cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => break e,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    log::info!(
                        "sbctl: formatted volume with {} pbas at pba {}, {} superblock slots",
                        this.params.nr_of_pbas,
                        this.params.first_pba,
                        sbctl.config.nr_of_superblock_slots
                    );
                    this.fut_state = FormatFutureState::Done;
                    return task::Poll::Ready(Ok(()));
                }
                FormatFutureState::Done => unreachable!(),
            }
        };

        log::error!(
            "sbctl: request failed at step \"{}\": {}",
            this.fut_state.step_label(),
            e
        );
        this.fut_state = FormatFutureState::Done;
        task::Poll::Ready(Err(e))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_params() -> FormatParams {
        FormatParams {
            degree: 64,
            first_pba: Pba(0),
            nr_of_pbas: 100,
            vbd_root_pba: Pba(1),
            vbd_root_hash: [0u8; 32],
            vbd_max_level: 1,
            vbd_nr_of_leaves: 8,
            free_tree: TreeRoot {
                max_level: 2,
                degree: 64,
                ..TreeRoot::default()
            },
            meta_tree: TreeRoot::default(),
        }
    }

    #[test]
    fn params_validation() {
        test_params().validate().unwrap();

        let mut params = test_params();
        params.degree = 0;
        assert_eq!(
            params.validate(),
            Err(SbCtlError::from(SbCtlFormatError::InvalidTreeDegree))
        );

        let mut params = test_params();
        params.free_tree.max_level = 1;
        assert_eq!(
            params.validate(),
            Err(SbCtlError::from(SbCtlFormatError::InvalidFreeTreeMaxLevel))
        );

        let mut params = test_params();
        params.nr_of_pbas = 0;
        assert_eq!(params.validate(), Err(SbCtlError::from(SbCtlFormatError::InvalidPbaRange)));

        let mut params = test_params();
        params.first_pba = Pba(u64::MAX);
        params.nr_of_pbas = 2;
        assert_eq!(params.validate(), Err(SbCtlError::from(SbCtlFormatError::InvalidPbaRange)));
    }
}
