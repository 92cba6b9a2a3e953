// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Software [`TrustAnchor`] implementation.

use super::{BackendFuture, trust_anchor::TrustAnchor};
use crate::{
    error::SbCtlError,
    keys::{KeyValue, WrappedKeyValue},
    sbctl_err_internal,
    types::{Hash, KEY_SIZE},
};
use cipher::{BlockDecrypt as _, BlockEncrypt as _, KeyInit as _, generic_array::GenericArray};
use core::{cell, pin, task};
use zeroize::Zeroizing;

/// Size of the device secret in bytes.
pub const SOFT_TRUST_ANCHOR_SECRET_SIZE: usize = 32;

/// [`TrustAnchor`] implemented in software.
///
/// Keys get wrapped with AES-256 under a device secret provided at
/// instantiation. The last recorded superblock hash is kept in memory, it is
/// the user's responsibility to persist it by means of
/// [`export_hash()`](Self::export_hash) and restore it with
/// [`import_hash()`](Self::import_hash) where desired.
pub struct SoftTrustAnchor<R: rand::RngCore + rand::CryptoRng> {
    secret: Zeroizing<[u8; SOFT_TRUST_ANCHOR_SECRET_SIZE]>,
    rng: cell::RefCell<R>,
    hash: cell::Cell<Option<Hash>>,
}

impl<R: rand::RngCore + rand::CryptoRng> SoftTrustAnchor<R> {
    pub fn new(secret: Zeroizing<[u8; SOFT_TRUST_ANCHOR_SECRET_SIZE]>, rng: R) -> Self {
        Self {
            secret,
            rng: cell::RefCell::new(rng),
            hash: cell::Cell::new(None),
        }
    }

    /// The last hash recorded, if any.
    pub fn export_hash(&self) -> Option<Hash> {
        self.hash.get()
    }

    /// Set the recorded hash, e.g. to one previously saved with
    /// [`export_hash()`](Self::export_hash).
    pub fn import_hash(&self, hash: Option<Hash>) {
        self.hash.set(hash);
    }

    fn cipher(&self) -> aes::Aes256 {
        aes::Aes256::new(GenericArray::from_slice(self.secret.as_slice()))
    }

    pub(crate) fn generate_key_value(&self) -> Result<KeyValue, SbCtlError> {
        let mut rng = self.rng.try_borrow_mut().map_err(|_| sbctl_err_internal!())?;
        let mut value = Zeroizing::new([0u8; KEY_SIZE]);
        rng.try_fill_bytes(value.as_mut_slice())
            .map_err(|_| SbCtlError::TrustAnchorFailure)?;
        Ok(value)
    }

    pub(crate) fn wrap_key_value(&self, key: &KeyValue) -> WrappedKeyValue {
        let cipher = self.cipher();
        let mut wrapped = Zeroizing::new(**key);
        for chunk in wrapped.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        *wrapped
    }

    pub(crate) fn unwrap_key_value(&self, wrapped: &WrappedKeyValue) -> KeyValue {
        let cipher = self.cipher();
        let mut value = Zeroizing::new(*wrapped);
        for chunk in value.chunks_exact_mut(16) {
            cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        }
        value
    }
}

impl<R: rand::RngCore + rand::CryptoRng> TrustAnchor for SoftTrustAnchor<R> {
    type GenerateKeyFuture = SoftTrustAnchorGenerateKeyFuture;

    fn generate_key(&self) -> Result<Self::GenerateKeyFuture, SbCtlError> {
        Ok(SoftTrustAnchorGenerateKeyFuture { done: false })
    }

    type EncryptKeyFuture = SoftTrustAnchorEncryptKeyFuture;

    fn encrypt_key(&self, key: KeyValue) -> Result<Self::EncryptKeyFuture, SbCtlError> {
        Ok(SoftTrustAnchorEncryptKeyFuture { key: Some(key) })
    }

    type DecryptKeyFuture = SoftTrustAnchorDecryptKeyFuture;

    fn decrypt_key(&self, wrapped_key: WrappedKeyValue) -> Result<Self::DecryptKeyFuture, SbCtlError> {
        Ok(SoftTrustAnchorDecryptKeyFuture {
            wrapped_key: Some(wrapped_key),
        })
    }

    type WriteHashFuture = SoftTrustAnchorWriteHashFuture;

    fn write_hash(&self, hash: Hash) -> Result<Self::WriteHashFuture, SbCtlError> {
        Ok(SoftTrustAnchorWriteHashFuture { hash: Some(hash) })
    }

    type ReadHashFuture = SoftTrustAnchorReadHashFuture;

    fn read_hash(&self) -> Result<Self::ReadHashFuture, SbCtlError> {
        Ok(SoftTrustAnchorReadHashFuture { done: false })
    }
}

pub struct SoftTrustAnchorGenerateKeyFuture {
    done: bool,
}

impl<R: rand::RngCore + rand::CryptoRng> BackendFuture<SoftTrustAnchor<R>> for SoftTrustAnchorGenerateKeyFuture {
    type Output = Result<KeyValue, SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        trust_anchor: &SoftTrustAnchor<R>,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        if this.done {
            unreachable!("Attempt to poll completed future.");
        }
        this.done = true;
        task::Poll::Ready(trust_anchor.generate_key_value())
    }
}

pub struct SoftTrustAnchorEncryptKeyFuture {
    key: Option<KeyValue>,
}

impl<R: rand::RngCore + rand::CryptoRng> BackendFuture<SoftTrustAnchor<R>> for SoftTrustAnchorEncryptKeyFuture {
    type Output = Result<WrappedKeyValue, SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        trust_anchor: &SoftTrustAnchor<R>,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        let key = match this.key.take() {
            Some(key) => key,
            None => unreachable!("Attempt to poll completed future."),
        };
        task::Poll::Ready(Ok(trust_anchor.wrap_key_value(&key)))
    }
}

pub struct SoftTrustAnchorDecryptKeyFuture {
    wrapped_key: Option<WrappedKeyValue>,
}

impl<R: rand::RngCore + rand::CryptoRng> BackendFuture<SoftTrustAnchor<R>> for SoftTrustAnchorDecryptKeyFuture {
    type Output = Result<KeyValue, SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        trust_anchor: &SoftTrustAnchor<R>,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        let wrapped_key = match this.wrapped_key.take() {
            Some(wrapped_key) => wrapped_key,
            None => unreachable!("Attempt to poll completed future."),
        };
        task::Poll::Ready(Ok(trust_anchor.unwrap_key_value(&wrapped_key)))
    }
}

pub struct SoftTrustAnchorWriteHashFuture {
    hash: Option<Hash>,
}

impl<R: rand::RngCore + rand::CryptoRng> BackendFuture<SoftTrustAnchor<R>> for SoftTrustAnchorWriteHashFuture {
    type Output = Result<(), SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        trust_anchor: &SoftTrustAnchor<R>,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        let hash = match this.hash.take() {
            Some(hash) => hash,
            None => unreachable!("Attempt to poll completed future."),
        };
        trust_anchor.hash.set(Some(hash));
        task::Poll::Ready(Ok(()))
    }
}

pub struct SoftTrustAnchorReadHashFuture {
    done: bool,
}

impl<R: rand::RngCore + rand::CryptoRng> BackendFuture<SoftTrustAnchor<R>> for SoftTrustAnchorReadHashFuture {
    type Output = Result<Hash, SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        trust_anchor: &SoftTrustAnchor<R>,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        if this.done {
            unreachable!("Attempt to poll completed future.");
        }
        this.done = true;
        task::Poll::Ready(trust_anchor.hash.get().ok_or(SbCtlError::TrustAnchorFailure))
    }
}
