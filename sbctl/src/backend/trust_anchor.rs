// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Definition of the [`TrustAnchor`] trait.

use super::BackendFuture;
use crate::{
    error::SbCtlError,
    keys::{KeyValue, WrappedKeyValue},
    types::Hash,
};
use core::marker;

/// Interface to the trust anchor.
///
/// The trust anchor is the sole root of trust: it generates key material,
/// wraps and unwraps individual keys under a device secret and durably
/// records the hash of the one authoritative superblock. It has no notion of
/// superblock slots.
pub trait TrustAnchor {
    type GenerateKeyFuture: BackendFuture<Self, Output = Result<KeyValue, SbCtlError>> + marker::Unpin;

    /// Generate fresh key material.
    fn generate_key(&self) -> Result<Self::GenerateKeyFuture, SbCtlError>;

    type EncryptKeyFuture: BackendFuture<Self, Output = Result<WrappedKeyValue, SbCtlError>> + marker::Unpin;

    /// Wrap a key.
    fn encrypt_key(&self, key: KeyValue) -> Result<Self::EncryptKeyFuture, SbCtlError>;

    type DecryptKeyFuture: BackendFuture<Self, Output = Result<KeyValue, SbCtlError>> + marker::Unpin;

    /// Unwrap a key previously wrapped with [`encrypt_key()`](Self::encrypt_key).
    fn decrypt_key(&self, wrapped_key: WrappedKeyValue) -> Result<Self::DecryptKeyFuture, SbCtlError>;

    type WriteHashFuture: BackendFuture<Self, Output = Result<(), SbCtlError>> + marker::Unpin;

    /// Durably record the hash of the authoritative superblock.
    ///
    /// The completion of this operation is the commit point of any
    /// superblock update.
    fn write_hash(&self, hash: Hash) -> Result<Self::WriteHashFuture, SbCtlError>;

    type ReadHashFuture: BackendFuture<Self, Output = Result<Hash, SbCtlError>> + marker::Unpin;

    /// Retrieve the last recorded superblock hash.
    fn read_hash(&self) -> Result<Self::ReadHashFuture, SbCtlError>;
}
