// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

use super::{TestEvent, TestEventLog, TestOp, TestOpFuture};
use crate::{
    backend::{
        soft_trust_anchor::{SOFT_TRUST_ANCHOR_SECRET_SIZE, SoftTrustAnchor},
        trust_anchor::TrustAnchor,
    },
    error::SbCtlError,
    keys::{KeyValue, WrappedKeyValue},
    types::Hash,
};
use core::cell;
use rand::SeedableRng as _;
use zeroize::Zeroizing;

const TEST_TRUST_ANCHOR_SECRET: [u8; SOFT_TRUST_ANCHOR_SECRET_SIZE] = [0x5a; SOFT_TRUST_ANCHOR_SECRET_SIZE];

/// [`SoftTrustAnchor`] with deferred completion and failure injection.
pub struct TestTrustAnchor {
    inner: SoftTrustAnchor<rand::rngs::StdRng>,
    rng_seed: u64,
    pub fail_write_hash: cell::Cell<bool>,
    events: TestEventLog,
}

impl TestTrustAnchor {
    pub fn new(rng_seed: u64, events: TestEventLog) -> Self {
        Self {
            inner: SoftTrustAnchor::new(
                Zeroizing::new(TEST_TRUST_ANCHOR_SECRET),
                rand::rngs::StdRng::seed_from_u64(rng_seed),
            ),
            rng_seed,
            fail_write_hash: cell::Cell::new(false),
            events,
        }
    }

    /// The same device after a power cycle.
    ///
    /// The recorded hash persists, the key generator gets reseeded.
    pub fn snapshot(&self, events: TestEventLog) -> Self {
        let snapshot = Self::new(self.rng_seed + 1, events);
        snapshot.inner.import_hash(self.inner.export_hash());
        snapshot
    }

    pub fn recorded_hash(&self) -> Option<Hash> {
        self.inner.export_hash()
    }

    pub fn set_recorded_hash(&self, hash: Option<Hash>) {
        self.inner.import_hash(hash);
    }
}

pub struct TestTrustAnchorGenerateKeyOp;

impl TestOp<TestTrustAnchor> for TestTrustAnchorGenerateKeyOp {
    type Output = Result<KeyValue, SbCtlError>;

    fn run(self, trust_anchor: &TestTrustAnchor) -> Self::Output {
        trust_anchor.inner.generate_key_value()
    }
}

pub struct TestTrustAnchorEncryptKeyOp {
    key: KeyValue,
}

impl TestOp<TestTrustAnchor> for TestTrustAnchorEncryptKeyOp {
    type Output = Result<WrappedKeyValue, SbCtlError>;

    fn run(self, trust_anchor: &TestTrustAnchor) -> Self::Output {
        Ok(trust_anchor.inner.wrap_key_value(&self.key))
    }
}

pub struct TestTrustAnchorDecryptKeyOp {
    wrapped_key: WrappedKeyValue,
}

impl TestOp<TestTrustAnchor> for TestTrustAnchorDecryptKeyOp {
    type Output = Result<KeyValue, SbCtlError>;

    fn run(self, trust_anchor: &TestTrustAnchor) -> Self::Output {
        Ok(trust_anchor.inner.unwrap_key_value(&self.wrapped_key))
    }
}

pub struct TestTrustAnchorWriteHashOp {
    hash: Hash,
}

impl TestOp<TestTrustAnchor> for TestTrustAnchorWriteHashOp {
    type Output = Result<(), SbCtlError>;

    fn run(self, trust_anchor: &TestTrustAnchor) -> Self::Output {
        if trust_anchor.fail_write_hash.get() {
            return Err(SbCtlError::TrustAnchorFailure);
        }
        trust_anchor.inner.import_hash(Some(self.hash));
        trust_anchor.events.record(TestEvent::WriteHash);
        Ok(())
    }
}

pub struct TestTrustAnchorReadHashOp;

impl TestOp<TestTrustAnchor> for TestTrustAnchorReadHashOp {
    type Output = Result<Hash, SbCtlError>;

    fn run(self, trust_anchor: &TestTrustAnchor) -> Self::Output {
        trust_anchor.inner.export_hash().ok_or(SbCtlError::TrustAnchorFailure)
    }
}

impl TrustAnchor for TestTrustAnchor {
    type GenerateKeyFuture = TestOpFuture<TestTrustAnchorGenerateKeyOp>;

    fn generate_key(&self) -> Result<Self::GenerateKeyFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestTrustAnchorGenerateKeyOp))
    }

    type EncryptKeyFuture = TestOpFuture<TestTrustAnchorEncryptKeyOp>;

    fn encrypt_key(&self, key: KeyValue) -> Result<Self::EncryptKeyFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestTrustAnchorEncryptKeyOp { key }))
    }

    type DecryptKeyFuture = TestOpFuture<TestTrustAnchorDecryptKeyOp>;

    fn decrypt_key(&self, wrapped_key: WrappedKeyValue) -> Result<Self::DecryptKeyFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestTrustAnchorDecryptKeyOp { wrapped_key }))
    }

    type WriteHashFuture = TestOpFuture<TestTrustAnchorWriteHashOp>;

    fn write_hash(&self, hash: Hash) -> Result<Self::WriteHashFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestTrustAnchorWriteHashOp { hash }))
    }

    type ReadHashFuture = TestOpFuture<TestTrustAnchorReadHashOp>;

    fn read_hash(&self) -> Result<Self::ReadHashFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestTrustAnchorReadHashOp))
    }
}
