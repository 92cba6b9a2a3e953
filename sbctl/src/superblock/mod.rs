// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! The superblock and its on-disk format.

mod snapshots;
pub use snapshots::{Snapshot, Snapshots};

use crate::{
    error::{SbCtlError, SbCtlFormatError},
    keys::{Key, WrappedKey},
    sbctl_err_internal,
    types::{
        BLOCK_SIZE, Block, FREE_TREE_MIN_MAX_LEVEL, Generation, HASH_SIZE, Hash, KEY_SIZE, KeyId, MAX_NR_OF_SNAPSHOTS, Pba, TREE_MIN_DEGREE,
        Vba,
    },
};
use core::mem;
use sha2::Digest as _;
use subtle::ConstantTimeEq as _;

/// State of the superblock.
///
/// At most one long-running operation is active at a time, [`Normal`](Self::Normal)
/// means none is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SuperblockState {
    Invalid,
    Normal,
    Rekeying,
    ExtendingVbd,
    ExtendingFt,
}

impl SuperblockState {
    fn encode(&self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::Normal => 1,
            Self::Rekeying => 2,
            Self::ExtendingVbd => 3,
            Self::ExtendingFt => 4,
        }
    }

    fn decode(value: u8) -> Result<Self, SbCtlError> {
        match value {
            0 => Ok(Self::Invalid),
            1 => Ok(Self::Normal),
            2 => Ok(Self::Rekeying),
            3 => Ok(Self::ExtendingVbd),
            4 => Ok(Self::ExtendingFt),
            _ => Err(SbCtlError::from(SbCtlFormatError::InvalidSuperblockState)),
        }
    }
}

/// Root reference and shape of the free tree or its meta tree.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TreeRoot {
    pub pba: Pba,
    pub generation: Generation,
    pub hash: Hash,
    pub max_level: u32,
    pub degree: u32,
    pub nr_of_leaves: u64,
}

/// Summary of the superblock state as reported by
/// [`SuperblockControl::sb_info()`](crate::sbctl::SuperblockControl::sb_info).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SbInfo {
    pub valid: bool,
    pub rekeying_in_progress: bool,
    pub ft_extension_in_progress: bool,
    pub vbd_extension_in_progress: bool,
}

/// The superblock.
///
/// Generic over the key representation: the live instance owned by the
/// [`SuperblockControl`](crate::sbctl::SuperblockControl) carries plaintext
/// [`Key`]s, the on-disk one carries [`WrappedKey`]s only, c.f.
/// [`SuperblockCiphertext`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Superblock<K = Key> {
    pub state: SuperblockState,
    /// VBAs below had been rekeyed to the current key already.
    pub rekeying_vba: Vba,
    /// Remaining work of the active extension.
    pub resizing_nr_of_pbas: u64,
    pub resizing_nr_of_leaves: u64,
    /// Meaningful only while [`Rekeying`](SuperblockState::Rekeying).
    pub previous_key: K,
    pub current_key: K,
    pub snapshots: Snapshots,
    pub last_secured_generation: Generation,
    pub curr_snap_idx: usize,
    /// Branching factor of the block mapping tree.
    pub degree: u32,
    pub first_pba: Pba,
    pub nr_of_pbas: u64,
    pub free_tree: TreeRoot,
    pub meta_tree: TreeRoot,
}

/// The superblock as found on disk, with wrapped keys.
pub type SuperblockCiphertext = Superblock<WrappedKey>;

impl<K> Superblock<K> {
    pub fn curr_snap(&self) -> &Snapshot {
        &self.snapshots.items[self.curr_snap_idx]
    }

    pub fn curr_snap_mut(&mut self) -> &mut Snapshot {
        &mut self.snapshots.items[self.curr_snap_idx]
    }

    pub fn is_valid(&self) -> bool {
        self.state != SuperblockState::Invalid
    }

    pub fn info(&self) -> SbInfo {
        SbInfo {
            valid: self.is_valid(),
            rekeying_in_progress: self.state == SuperblockState::Rekeying,
            ft_extension_in_progress: self.state == SuperblockState::ExtendingFt,
            vbd_extension_in_progress: self.state == SuperblockState::ExtendingVbd,
        }
    }

    /// The highest VBA addressable in the current snapshot.
    ///
    /// Zero if the superblock is invalid or the tree empty.
    pub fn max_vba(&self) -> Vba {
        if !self.is_valid() {
            return Vba(0);
        }
        Vba(self.curr_snap().nr_of_leaves.saturating_sub(1))
    }

    /// Whether `vba` is addressable in the current snapshot.
    pub fn contains_vba(&self, vba: Vba) -> bool {
        self.is_valid() && vba.0 < self.curr_snap().nr_of_leaves
    }

    /// Copy of all fields but the keys, with the keys replaced by
    /// `current_key` and `previous_key`.
    fn map_keys<L>(&self, current_key: L, previous_key: L) -> Superblock<L> {
        Superblock {
            state: self.state,
            rekeying_vba: self.rekeying_vba,
            resizing_nr_of_pbas: self.resizing_nr_of_pbas,
            resizing_nr_of_leaves: self.resizing_nr_of_leaves,
            previous_key,
            current_key,
            snapshots: self.snapshots,
            last_secured_generation: self.last_secured_generation,
            curr_snap_idx: self.curr_snap_idx,
            degree: self.degree,
            first_pba: self.first_pba,
            nr_of_pbas: self.nr_of_pbas,
            free_tree: self.free_tree,
            meta_tree: self.meta_tree,
        }
    }
}

impl Superblock<Key> {
    /// An invalid superblock, the state before mounting.
    pub fn new_invalid() -> Self {
        Self {
            state: SuperblockState::Invalid,
            rekeying_vba: Vba(0),
            resizing_nr_of_pbas: 0,
            resizing_nr_of_leaves: 0,
            previous_key: Key::new_zeroed(KeyId(0)),
            current_key: Key::new_zeroed(KeyId(0)),
            snapshots: Snapshots::new_invalid(),
            last_secured_generation: Generation(0),
            curr_snap_idx: 0,
            degree: 0,
            first_pba: Pba(0),
            nr_of_pbas: 0,
            free_tree: TreeRoot::default(),
            meta_tree: TreeRoot::default(),
        }
    }

    /// Copy with the plaintext key material stripped.
    ///
    /// The wrapped key values are to be filled in by the caller.
    pub fn to_ciphertext(&self) -> SuperblockCiphertext {
        self.map_keys(
            WrappedKey {
                id: self.current_key.id,
                value: [0u8; KEY_SIZE],
            },
            WrappedKey {
                id: self.previous_key.id,
                value: [0u8; KEY_SIZE],
            },
        )
    }
}

impl SuperblockCiphertext {
    /// Combine with the unwrapped keys into a live superblock.
    pub fn into_plaintext(self, current_key: Key, previous_key: Key) -> Superblock<Key> {
        self.map_keys(current_key, previous_key)
    }

    const fn encoded_len() -> usize {
        const ENCODED_SNAPSHOT_LEN: usize = HASH_SIZE
            + mem::size_of::<u64>() // pba
            + mem::size_of::<u64>() // generation
            + mem::size_of::<u64>() // nr_of_leaves
            + mem::size_of::<u32>() // max_level
            + mem::size_of::<u8>() // valid
            + mem::size_of::<u32>() // id
            + mem::size_of::<u8>(); // keep
        const ENCODED_TREE_ROOT_LEN: usize = mem::size_of::<u64>() // generation
            + mem::size_of::<u64>() // pba
            + HASH_SIZE
            + mem::size_of::<u32>() // max_level
            + mem::size_of::<u32>() // degree
            + mem::size_of::<u64>(); // nr_of_leaves
        const ENCODED_KEY_LEN: usize = mem::size_of::<u32>() + KEY_SIZE;
        const ENCODED_LEN: usize = {
            // The state.
            let mut encoded_len = mem::size_of::<u8>();
            // rekeying_vba, resizing_nr_of_pbas, resizing_nr_of_leaves.
            encoded_len += 3 * mem::size_of::<u64>();
            // previous_key, current_key.
            encoded_len += 2 * ENCODED_KEY_LEN;
            encoded_len += MAX_NR_OF_SNAPSHOTS * ENCODED_SNAPSHOT_LEN;
            // last_secured_generation.
            encoded_len += mem::size_of::<u64>();
            // curr_snap_idx, degree.
            encoded_len += 2 * mem::size_of::<u32>();
            // first_pba, nr_of_pbas.
            encoded_len += 2 * mem::size_of::<u64>();
            // free_tree, meta_tree.
            encoded_len += 2 * ENCODED_TREE_ROOT_LEN;
            encoded_len
        };

        #[allow(clippy::assertions_on_constants)]
        let _: () = assert!(ENCODED_LEN <= BLOCK_SIZE);

        ENCODED_LEN
    }

    /// Serialize into a zero padded block.
    pub fn encode(&self, dst: &mut Block) -> Result<(), SbCtlError> {
        let curr_snap_idx = u32::try_from(self.curr_snap_idx).map_err(|_| sbctl_err_internal!())?;

        let (dst, padding) = dst.split_at_mut(Self::encoded_len());
        let dst = encode_u8(self.state.encode(), dst);
        let dst = encode_u64(self.rekeying_vba.0, dst);
        let dst = encode_u64(self.resizing_nr_of_pbas, dst);
        let dst = encode_u64(self.resizing_nr_of_leaves, dst);
        let dst = encode_key(&self.previous_key, dst);
        let mut dst = encode_key(&self.current_key, dst);
        for snap in self.snapshots.items.iter() {
            dst = encode_bytes(&snap.hash, dst);
            dst = encode_u64(snap.pba.0, dst);
            dst = encode_u64(snap.generation.0, dst);
            dst = encode_u64(snap.nr_of_leaves, dst);
            dst = encode_u32(snap.max_level, dst);
            dst = encode_u8(snap.valid as u8, dst);
            dst = encode_u32(snap.id, dst);
            dst = encode_u8(snap.keep as u8, dst);
        }
        let dst = encode_u64(self.last_secured_generation.0, dst);
        let dst = encode_u32(curr_snap_idx, dst);
        let dst = encode_u32(self.degree, dst);
        let dst = encode_u64(self.first_pba.0, dst);
        let dst = encode_u64(self.nr_of_pbas, dst);
        let dst = encode_tree_root(&self.free_tree, dst);
        let dst = encode_tree_root(&self.meta_tree, dst);
        if !dst.is_empty() {
            return Err(sbctl_err_internal!());
        }
        padding.fill(0);

        Ok(())
    }

    /// Deserialize from a block.
    ///
    /// Only the encoding itself is validated. A block of all zeroes decodes
    /// to an [`Invalid`](SuperblockState::Invalid) superblock.
    pub fn decode(src: &Block) -> Result<Self, SbCtlError> {
        let (src, padding) = src.split_at(Self::encoded_len());
        if padding.iter().any(|b| *b != 0) {
            return Err(SbCtlError::from(SbCtlFormatError::InvalidPadding));
        }

        let (state, src) = decode_u8(src)?;
        let state = SuperblockState::decode(state)?;
        let (rekeying_vba, src) = decode_u64(src)?;
        let (resizing_nr_of_pbas, src) = decode_u64(src)?;
        let (resizing_nr_of_leaves, src) = decode_u64(src)?;
        let (previous_key, src) = decode_key(src)?;
        let (current_key, mut src) = decode_key(src)?;
        let mut snapshots = Snapshots::new_invalid();
        for snap in snapshots.items.iter_mut() {
            let hash;
            (hash, src) = decode_hash(src)?;
            let pba;
            (pba, src) = decode_u64(src)?;
            let generation;
            (generation, src) = decode_u64(src)?;
            let nr_of_leaves;
            (nr_of_leaves, src) = decode_u64(src)?;
            let max_level;
            (max_level, src) = decode_u32(src)?;
            let valid;
            (valid, src) = decode_bool(src)?;
            let id;
            (id, src) = decode_u32(src)?;
            let keep;
            (keep, src) = decode_bool(src)?;
            *snap = Snapshot {
                hash,
                pba: Pba(pba),
                generation: Generation(generation),
                nr_of_leaves,
                max_level,
                valid,
                id,
                keep,
            };
        }
        let (last_secured_generation, src) = decode_u64(src)?;
        let (curr_snap_idx, src) = decode_u32(src)?;
        let curr_snap_idx = usize::try_from(curr_snap_idx)
            .ok()
            .filter(|idx| *idx < MAX_NR_OF_SNAPSHOTS)
            .ok_or(SbCtlError::from(SbCtlFormatError::InvalidCurrentSnapshotIndex))?;
        let (degree, src) = decode_u32(src)?;
        let (first_pba, src) = decode_u64(src)?;
        let (nr_of_pbas, src) = decode_u64(src)?;
        let (free_tree, src) = decode_tree_root(src)?;
        let (meta_tree, src) = decode_tree_root(src)?;
        if !src.is_empty() {
            return Err(sbctl_err_internal!());
        }

        Ok(Self {
            state,
            rekeying_vba: Vba(rekeying_vba),
            resizing_nr_of_pbas,
            resizing_nr_of_leaves,
            previous_key,
            current_key,
            snapshots,
            last_secured_generation: Generation(last_secured_generation),
            curr_snap_idx,
            degree,
            first_pba: Pba(first_pba),
            nr_of_pbas,
            free_tree,
            meta_tree,
        })
    }

    /// Semantic checks on a decoded superblock about to get mounted.
    pub fn validate(&self) -> Result<(), SbCtlError> {
        if !self.is_valid() {
            return Ok(());
        }
        if self.degree < TREE_MIN_DEGREE {
            return Err(SbCtlError::from(SbCtlFormatError::InvalidTreeDegree));
        }
        if self.free_tree.max_level < FREE_TREE_MIN_MAX_LEVEL {
            return Err(SbCtlError::from(SbCtlFormatError::InvalidFreeTreeMaxLevel));
        }
        if self.nr_of_pbas == 0 || self.first_pba.0.checked_add(self.nr_of_pbas - 1).is_none() {
            return Err(SbCtlError::from(SbCtlFormatError::InvalidPbaRange));
        }
        if !self.curr_snap().valid {
            return Err(SbCtlError::from(SbCtlFormatError::NoValidSnapshot));
        }
        Ok(())
    }
}

/// SHA-256 over a block.
pub fn calc_block_hash(block: &Block) -> Hash {
    let digest = sha2::Sha256::digest(block.as_slice());
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(digest.as_slice());
    hash
}

/// Compare a block's hash against `expected` in constant time.
pub fn check_block_hash(block: &Block, expected: &Hash) -> bool {
    bool::from(calc_block_hash(block).as_slice().ct_eq(expected.as_slice()))
}

fn encode_bytes<'a>(value: &[u8], dst: &'a mut [u8]) -> &'a mut [u8] {
    let (field, dst) = dst.split_at_mut(value.len());
    field.copy_from_slice(value);
    dst
}

fn encode_u8<'a>(value: u8, dst: &'a mut [u8]) -> &'a mut [u8] {
    encode_bytes(&value.to_le_bytes(), dst)
}

fn encode_u32<'a>(value: u32, dst: &'a mut [u8]) -> &'a mut [u8] {
    encode_bytes(&value.to_le_bytes(), dst)
}

fn encode_u64<'a>(value: u64, dst: &'a mut [u8]) -> &'a mut [u8] {
    encode_bytes(&value.to_le_bytes(), dst)
}

fn encode_key<'a>(key: &WrappedKey, dst: &'a mut [u8]) -> &'a mut [u8] {
    let dst = encode_u32(key.id.0, dst);
    encode_bytes(&key.value, dst)
}

fn encode_tree_root<'a>(root: &TreeRoot, dst: &'a mut [u8]) -> &'a mut [u8] {
    let dst = encode_u64(root.generation.0, dst);
    let dst = encode_u64(root.pba.0, dst);
    let dst = encode_bytes(&root.hash, dst);
    let dst = encode_u32(root.max_level, dst);
    let dst = encode_u32(root.degree, dst);
    encode_u64(root.nr_of_leaves, dst)
}

fn decode_array<const N: usize>(src: &[u8]) -> Result<([u8; N], &[u8]), SbCtlError> {
    if src.len() < N {
        return Err(sbctl_err_internal!());
    }
    let (field, src) = src.split_at(N);
    let field = *<&[u8; N]>::try_from(field).map_err(|_| sbctl_err_internal!())?;
    Ok((field, src))
}

fn decode_u8(src: &[u8]) -> Result<(u8, &[u8]), SbCtlError> {
    // The from_le_bytes() is a nop for an u8, but this mirrors the encoding part.
    let (value, src) = decode_array::<{ mem::size_of::<u8>() }>(src)?;
    Ok((u8::from_le_bytes(value), src))
}

fn decode_bool(src: &[u8]) -> Result<(bool, &[u8]), SbCtlError> {
    let (value, src) = decode_u8(src)?;
    match value {
        0 => Ok((false, src)),
        1 => Ok((true, src)),
        _ => Err(SbCtlError::from(SbCtlFormatError::InvalidBoolean)),
    }
}

fn decode_u32(src: &[u8]) -> Result<(u32, &[u8]), SbCtlError> {
    let (value, src) = decode_array::<{ mem::size_of::<u32>() }>(src)?;
    Ok((u32::from_le_bytes(value), src))
}

fn decode_u64(src: &[u8]) -> Result<(u64, &[u8]), SbCtlError> {
    let (value, src) = decode_array::<{ mem::size_of::<u64>() }>(src)?;
    Ok((u64::from_le_bytes(value), src))
}

fn decode_hash(src: &[u8]) -> Result<(Hash, &[u8]), SbCtlError> {
    decode_array::<HASH_SIZE>(src)
}

fn decode_key(src: &[u8]) -> Result<(WrappedKey, &[u8]), SbCtlError> {
    let (id, src) = decode_u32(src)?;
    let (value, src) = decode_array::<KEY_SIZE>(src)?;
    Ok((WrappedKey { id: KeyId(id), value }, src))
}

fn decode_tree_root(src: &[u8]) -> Result<(TreeRoot, &[u8]), SbCtlError> {
    let (generation, src) = decode_u64(src)?;
    let (pba, src) = decode_u64(src)?;
    let (hash, src) = decode_hash(src)?;
    let (max_level, src) = decode_u32(src)?;
    let (degree, src) = decode_u32(src)?;
    let (nr_of_leaves, src) = decode_u64(src)?;
    Ok((
        TreeRoot {
            pba: Pba(pba),
            generation: Generation(generation),
            hash,
            max_level,
            degree,
            nr_of_leaves,
        },
        src,
    ))
}
