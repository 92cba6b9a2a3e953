// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Definition of the [`Crypto`] trait.

use super::BackendFuture;
use crate::{error::SbCtlError, keys::Key, types::KeyId};
use core::marker;

/// Interface to the payload cipher module.
///
/// The module encrypts and decrypts block payloads on behalf of the
/// [block mapping tree](super::vbd::Vbd), referring to keys by their
/// [`KeyId`]. The superblock control manages its working set of keys.
pub trait Crypto {
    type AddKeyFuture: BackendFuture<Self, Output = Result<(), SbCtlError>> + marker::Unpin;

    /// Register a plaintext key.
    fn add_key(&self, key: Key) -> Result<Self::AddKeyFuture, SbCtlError>;

    type RemoveKeyFuture: BackendFuture<Self, Output = Result<(), SbCtlError>> + marker::Unpin;

    /// Drop a key from the working set.
    fn remove_key(&self, key_id: KeyId) -> Result<Self::RemoveKeyFuture, SbCtlError>;
}
