// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Key material representations.

use crate::types::{KEY_SIZE, KeyId};
use zeroize::Zeroizing;

/// Plaintext symmetric key material.
///
/// Wiped from memory when dropped.
pub type KeyValue = Zeroizing<[u8; KEY_SIZE]>;

/// Key material wrapped by the [trust anchor](crate::backend::trust_anchor::TrustAnchor).
///
/// Only ever stored in this form on disk.
pub type WrappedKeyValue = [u8; KEY_SIZE];

/// A plaintext key together with its identifier.
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    pub id: KeyId,
    pub value: KeyValue,
}

impl Key {
    /// Create a key with all-zeroes material.
    pub fn new_zeroed(id: KeyId) -> Self {
        Self {
            id,
            value: Zeroizing::new([0u8; KEY_SIZE]),
        }
    }

    /// Wipe the key material and reset the id.
    pub fn clear(&mut self) {
        *self = Self::new_zeroed(KeyId::default());
    }
}

impl core::fmt::Debug for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Never print the key material.
        f.debug_struct("Key").field("id", &self.id).finish_non_exhaustive()
    }
}

/// A wrapped key together with its identifier, as found in the encoded
/// superblock.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct WrappedKey {
    pub id: KeyId,
    pub value: WrappedKeyValue,
}
