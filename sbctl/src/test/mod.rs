// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! In-memory collaborators and helpers for exercising the superblock control.

extern crate alloc;
use alloc::{rc::Rc, vec::Vec};

mod crypto;
mod trees;
mod trust_anchor;


pub use block_io::TestBlockIo;
pub use crypto::{TestCrypto, TestKeyStore};
pub use trees::{TEST_PAYLOAD_SIZE, TestExtensionFault, TestFreeTree, TestPayload, TestVbd};
pub use trust_anchor::TestTrustAnchor;

use crate::{
    backend::{BackendFuture, SbCtlBackends, SbCtlEnv},
    config::SbCtlConfig,
    error::SbCtlError,
    sbctl::{
        CreateSnapshotFuture, DeinitializeFuture, DiscardSnapshotFuture, ExtendTreeFuture, ExtendTreeOutput,
        FormatFuture, FormatParams, InitializeFuture, ReadVbasFuture, RekeyFuture, RekeyOutput, SbCtlFuture,
        SbCtlFutureAsCoreFuture, SbCtlRequest, SbCtlRequestFuture, SbCtlRequestOutput, SecureSuperblockFuture,
        SuperblockControl, SynchronizeFuture, TreeExtensionTarget, WriteVbasFuture,
    },
    superblock::{SuperblockState, TreeRoot},
    types::{Generation, KeyId, Pba, Vba},
};
use core::{cell, marker, mem, pin, task};
use pollster::FutureExt as _;

/// Collaborator interactions, recorded in order of completion.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TestEvent {
    WriteBlock { slot: u32 },
    Sync,
    WriteHash,
    AddKey { key_id: KeyId },
    RemoveKey { key_id: KeyId },
    WriteVba { vba: Vba, key_id: KeyId },
    ReadVba { vba: Vba, key_id: KeyId },
    RekeyVba { vba: Vba },
    VbdExtensionStep { nr_of_pbas: u64 },
    FtExtensionStep { nr_of_pbas: u64 },
}

#[derive(Clone, Default)]
pub struct TestEventLog {
    events: Rc<cell::RefCell<Vec<TestEvent>>>,
}

impl TestEventLog {
    pub fn record(&self, event: TestEvent) {
        self.events.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<TestEvent> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    pub fn count(&self, pred: impl Fn(&TestEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|event| pred(event)).count()
    }
}

/// A single collaborator primitive, executed by a [`TestOpFuture`].
pub trait TestOp<B> {
    type Output;

    fn run(self, backend: &B) -> Self::Output;
}

/// Generic collaborator future.
///
/// Returns [`Pending`](task::Poll::Pending) once before running the
/// operation, so that resumption gets exercised in the callers.
pub enum TestOpFuture<Op> {
    Init { op: Op },
    PolledOnce { op: Op },
    Done,
}

impl<Op> TestOpFuture<Op> {
    pub fn new(op: Op) -> Self {
        Self::Init { op }
    }
}

impl<Op> marker::Unpin for TestOpFuture<Op> {}

impl<B, Op: TestOp<B>> BackendFuture<B> for TestOpFuture<Op> {
    type Output = Op::Output;

    fn poll(self: pin::Pin<&mut Self>, backend: &B, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        match mem::replace(this, Self::Done) {
            Self::Init { op } => {
                *this = Self::PolledOnce { op };
                cx.waker().wake_by_ref();
                task::Poll::Pending
            }
            Self::PolledOnce { op } => task::Poll::Ready(op.run(backend)),
            Self::Done => unreachable!("Attempt to poll completed future."),
        }
    }
}

pub type TestEnv = SbCtlBackends<TestBlockIo, TestCrypto, TestTrustAnchor, TestVbd, TestFreeTree>;

/// The event log shared by all of a [`TestEnv`]'s collaborators.
pub fn sbctl_test_events(env: &TestEnv) -> &TestEventLog {
    env.block_io.events()
}

pub const TEST_NR_OF_SUPERBLOCK_SLOTS: u32 = 4;
pub const TEST_FIRST_PBA: u64 = 0;
pub const TEST_NR_OF_PBAS: u64 = 100;

pub fn sbctl_test_init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn sbctl_test_config() -> SbCtlConfig {
    SbCtlConfig {
        nr_of_superblock_slots: TEST_NR_OF_SUPERBLOCK_SLOTS,
        ..SbCtlConfig::default()
    }
}

/// Let long-running requests return after each durable step.
pub fn sbctl_test_single_step_config() -> SbCtlConfig {
    SbCtlConfig {
        steps_per_request: core::num::NonZeroU64::new(1),
        ..sbctl_test_config()
    }
}

pub fn sbctl_test_mk_env(nr_of_superblock_slots: u32) -> TestEnv {
    let events = TestEventLog::default();
    let keys = TestKeyStore::default();
    SbCtlBackends {
        block_io: TestBlockIo::new(nr_of_superblock_slots, events.clone()),
        crypto: TestCrypto::new(keys.clone(), events.clone()),
        trust_anchor: TestTrustAnchor::new(0, events.clone()),
        vbd: TestVbd::new(keys, events.clone()),
        free_tree: TestFreeTree::new(events),
    }
}

/// Simulate a power cut.
///
/// Only what has been synced to the superblock slots and the hash recorded
/// at the trust anchor survive. The crypto module's working set is lost, the
/// trees are assumed to have persisted their nodes on their own.
pub fn sbctl_test_crash(env: &TestEnv) -> TestEnv {
    let events = TestEventLog::default();
    let keys = TestKeyStore::default();
    SbCtlBackends {
        block_io: env.block_io.snapshot(events.clone()),
        crypto: TestCrypto::new(keys.clone(), events.clone()),
        trust_anchor: env.trust_anchor.snapshot(events.clone()),
        vbd: env.vbd.snapshot(keys, events.clone()),
        free_tree: env.free_tree.snapshot(events),
    }
}

pub fn sbctl_test_format_params(env: &TestEnv, vbd_nr_of_leaves: u64) -> FormatParams {
    FormatParams {
        degree: 64,
        first_pba: Pba(TEST_FIRST_PBA),
        nr_of_pbas: TEST_NR_OF_PBAS,
        vbd_root_pba: env.vbd.initial_root_pba(),
        vbd_root_hash: TestVbd::root_hash(env.vbd.initial_root_pba()),
        vbd_max_level: 1,
        vbd_nr_of_leaves,
        free_tree: TreeRoot {
            pba: Pba(1),
            max_level: 2,
            degree: 64,
            nr_of_leaves: 16,
            ..TreeRoot::default()
        },
        meta_tree: TreeRoot {
            pba: Pba(2),
            max_level: 1,
            degree: 64,
            ..TreeRoot::default()
        },
    }
}

pub fn sbctl_test_run_op<E: SbCtlEnv, F: SbCtlFuture<E> + marker::Unpin>(
    sbctl: &mut SuperblockControl,
    env: &E,
    fut: F,
) -> F::Output {
    SbCtlFutureAsCoreFuture::new(sbctl, env, fut).block_on()
}

/// Poll a [`SbCtlFuture`] once, leaving it suspended at its first pending
/// collaborator operation.
///
/// Other requests may then get run before resuming it with
/// [`sbctl_test_run_op()`].
pub fn sbctl_test_poll_once<E: SbCtlEnv, F: SbCtlFuture<E> + marker::Unpin>(
    sbctl: &mut SuperblockControl,
    env: &E,
    fut: &mut F,
) -> task::Poll<F::Output> {
    let mut cx = task::Context::from_waker(task::Waker::noop());
    SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, &mut cx)
}

pub fn sbctl_test_format_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
    params: FormatParams,
) -> Result<(), SbCtlError> {
    sbctl_test_run_op(sbctl, env, FormatFuture::new(params))
}

pub fn sbctl_test_initialize_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
) -> Result<SuperblockState, SbCtlError> {
    sbctl_test_run_op(sbctl, env, InitializeFuture::new())
}

pub fn sbctl_test_deinitialize_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
) -> Result<(), SbCtlError> {
    sbctl_test_run_op(sbctl, env, DeinitializeFuture::new())
}

pub fn sbctl_test_secure_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
) -> Result<Generation, SbCtlError> {
    sbctl_test_run_op(sbctl, env, SecureSuperblockFuture::new())
}

pub fn sbctl_test_write_vbas_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
    first_vba: u64,
    num_vbas: u64,
    buffer_tag: u64,
) -> Result<(), SbCtlError> {
    sbctl_test_run_op(sbctl, env, WriteVbasFuture::new(Vba(first_vba), num_vbas, buffer_tag))
}

pub fn sbctl_test_read_vbas_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
    first_vba: u64,
    num_vbas: u64,
    buffer_tag: u64,
) -> Result<(), SbCtlError> {
    sbctl_test_run_op(sbctl, env, ReadVbasFuture::new(Vba(first_vba), num_vbas, buffer_tag))
}

pub fn sbctl_test_rekey_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
) -> Result<RekeyOutput, SbCtlError> {
    sbctl_test_run_op(sbctl, env, RekeyFuture::new())
}

pub fn sbctl_test_extend_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
    target: TreeExtensionTarget,
    nr_of_pbas: u64,
) -> Result<ExtendTreeOutput, SbCtlError> {
    sbctl_test_run_op(sbctl, env, ExtendTreeFuture::new(target, nr_of_pbas))
}

pub fn sbctl_test_create_snapshot_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
) -> Result<Generation, SbCtlError> {
    sbctl_test_run_op(sbctl, env, CreateSnapshotFuture::new())
}

pub fn sbctl_test_discard_snapshot_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
    generation: Generation,
) -> Result<(), SbCtlError> {
    sbctl_test_run_op(sbctl, env, DiscardSnapshotFuture::new(generation))
}

pub fn sbctl_test_synchronize_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
) -> Result<Generation, SbCtlError> {
    sbctl_test_run_op(sbctl, env, SynchronizeFuture::new())
}

pub fn sbctl_test_request_op_helper<E: SbCtlEnv>(
    sbctl: &mut SuperblockControl,
    env: &E,
    request: SbCtlRequest,
) -> Result<SbCtlRequestOutput, SbCtlError> {
    sbctl_test_run_op(sbctl, env, SbCtlRequestFuture::new(request))
}

/// Format a fresh volume and mount it.
pub fn sbctl_test_mk_volume(config: SbCtlConfig, vbd_nr_of_leaves: u64) -> (SuperblockControl, TestEnv) {
    sbctl_test_init_logging();
    let env = sbctl_test_mk_env(config.nr_of_superblock_slots);
    let mut sbctl = SuperblockControl::new(config).unwrap();
    let params = sbctl_test_format_params(&env, vbd_nr_of_leaves);
    sbctl_test_format_op_helper(&mut sbctl, &env, params).unwrap();
    assert_eq!(
        sbctl_test_initialize_op_helper(&mut sbctl, &env).unwrap(),
        SuperblockState::Normal
    );
    sbctl_test_events(&env).clear();
    (sbctl, env)
}

/// Crash and remount with a fresh [`SuperblockControl`].
pub fn sbctl_test_crash_and_remount(sbctl: &SuperblockControl, env: &TestEnv) -> (SuperblockControl, TestEnv) {
    let env = sbctl_test_crash(env);
    let mut sbctl = SuperblockControl::new(*sbctl.config()).unwrap();
    sbctl_test_initialize_op_helper(&mut sbctl, &env).unwrap();
    (sbctl, env)
}

/// Deterministic per-VBA payload.
pub fn sbctl_test_payload(vba: u64, seed: u8) -> TestPayload {
    let mut payload = [0u8; TEST_PAYLOAD_SIZE];
    for (i, b) in payload.iter_mut().enumerate() {
        *b = seed ^ (vba as u8).wrapping_mul(31) ^ (i as u8);
    }
    payload
}

/// Fill client buffer `buffer_tag` with [`sbctl_test_payload()`] for
/// `first_vba..first_vba + num_vbas` and write it out.
pub fn sbctl_test_write_payload(
    sbctl: &mut SuperblockControl,
    env: &TestEnv,
    first_vba: u64,
    num_vbas: u64,
    seed: u8,
) -> Result<(), SbCtlError> {
    let buffer_tag = u64::from(seed);
    for i in 0..num_vbas {
        env.vbd
            .set_client_data(buffer_tag, i, sbctl_test_payload(first_vba + i, seed));
    }
    sbctl_test_write_vbas_op_helper(sbctl, env, first_vba, num_vbas, buffer_tag)
}

/// Read back `first_vba..first_vba + num_vbas` and compare against
/// [`sbctl_test_payload()`].
pub fn sbctl_test_check_payload(
    sbctl: &mut SuperblockControl,
    env: &TestEnv,
    first_vba: u64,
    num_vbas: u64,
    seed: u8,
) {
    let buffer_tag = 0x1000 + u64::from(seed);
    sbctl_test_read_vbas_op_helper(sbctl, env, first_vba, num_vbas, buffer_tag).unwrap();
    for i in 0..num_vbas {
        assert_eq!(
            env.vbd.client_data(buffer_tag, i),
            Some(sbctl_test_payload(first_vba + i, seed)),
            "payload mismatch at vba {}",
            first_vba + i
        );
    }
}
