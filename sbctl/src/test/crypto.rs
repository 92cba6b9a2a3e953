// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

extern crate alloc;
use alloc::{collections::BTreeMap, rc::Rc, vec::Vec};

use super::{TestEvent, TestEventLog, TestOp, TestOpFuture, TestPayload};
use crate::{
    backend::crypto::Crypto,
    error::SbCtlError,
    keys::{Key, KeyValue},
    types::KeyId,
};
use core::cell;

/// The payload keys registered with a [`TestCrypto`], shared with the
/// [`TestVbd`](super::TestVbd) for the actual payload encryption.
#[derive(Clone, Default)]
pub struct TestKeyStore {
    keys: Rc<cell::RefCell<BTreeMap<KeyId, KeyValue>>>,
}

impl TestKeyStore {
    pub fn key_ids(&self) -> Vec<KeyId> {
        self.keys.borrow().keys().copied().collect()
    }

    pub fn key_value(&self, key_id: KeyId) -> Option<KeyValue> {
        self.keys.borrow().get(&key_id).cloned()
    }

    /// XOR "cipher", encryption and decryption are the same.
    pub fn apply(&self, key_id: KeyId, payload: &TestPayload) -> Result<TestPayload, SbCtlError> {
        let keys = self.keys.borrow();
        let key = keys.get(&key_id).ok_or(SbCtlError::CryptoFailure)?;
        let mut result = *payload;
        for (b, k) in result.iter_mut().zip(key.iter()) {
            *b ^= *k;
        }
        Ok(result)
    }
}

pub struct TestCrypto {
    keys: TestKeyStore,
    pub fail_add_key: cell::Cell<bool>,
    events: TestEventLog,
}

impl TestCrypto {
    pub fn new(keys: TestKeyStore, events: TestEventLog) -> Self {
        Self {
            keys,
            fail_add_key: cell::Cell::new(false),
            events,
        }
    }

    pub fn keys(&self) -> &TestKeyStore {
        &self.keys
    }
}

pub struct TestCryptoAddKeyOp {
    key: Key,
}

impl TestOp<TestCrypto> for TestCryptoAddKeyOp {
    type Output = Result<(), SbCtlError>;

    fn run(self, crypto: &TestCrypto) -> Self::Output {
        if crypto.fail_add_key.get() {
            return Err(SbCtlError::CryptoFailure);
        }
        let mut keys = crypto.keys.keys.borrow_mut();
        if keys.contains_key(&self.key.id) {
            return Err(SbCtlError::CryptoFailure);
        }
        crypto.events.record(TestEvent::AddKey { key_id: self.key.id });
        keys.insert(self.key.id, self.key.value);
        Ok(())
    }
}

pub struct TestCryptoRemoveKeyOp {
    key_id: KeyId,
}

impl TestOp<TestCrypto> for TestCryptoRemoveKeyOp {
    type Output = Result<(), SbCtlError>;

    fn run(self, crypto: &TestCrypto) -> Self::Output {
        crypto
            .keys
            .keys
            .borrow_mut()
            .remove(&self.key_id)
            .ok_or(SbCtlError::CryptoFailure)?;
        crypto.events.record(TestEvent::RemoveKey { key_id: self.key_id });
        Ok(())
    }
}

impl Crypto for TestCrypto {
    type AddKeyFuture = TestOpFuture<TestCryptoAddKeyOp>;

    fn add_key(&self, key: Key) -> Result<Self::AddKeyFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestCryptoAddKeyOp { key }))
    }

    type RemoveKeyFuture = TestOpFuture<TestCryptoRemoveKeyOp>;

    fn remove_key(&self, key_id: KeyId) -> Result<Self::RemoveKeyFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestCryptoRemoveKeyOp { key_id }))
    }
}
