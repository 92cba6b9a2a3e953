// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

extern crate alloc;
use alloc::collections::BTreeMap;

use super::{TestEvent, TestEventLog, TestKeyStore, TestOp, TestOpFuture};
use crate::{
    backend::{
        free_tree::{FreeTree, FtExtensionStepArgs, FtExtensionStepOutput},
        vbd::{
            Vbd, VbdExtensionStepArgs, VbdExtensionStepOutput, VbdRekeyVbaArgs, VbdRekeyVbaOutput, VbdVbaAccess,
            VbdWriteVbaOutput,
        },
    },
    error::SbCtlError,
    superblock::{Snapshot, TreeRoot},
    types::{Generation, HASH_SIZE, Hash, KeyId, Pba, Vba},
};
use core::cell;

pub const TEST_PAYLOAD_SIZE: usize = 16;
pub type TestPayload = [u8; TEST_PAYLOAD_SIZE];

/// Misbehavior of a tree extension step.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TestExtensionFault {
    #[default]
    None,
    /// Report no physical blocks consumed.
    NoProgress,
    /// Report a first unused physical block one past the correct one.
    WrongOffset,
    Fail,
}

/// Number of physical blocks consumed per extension step by default.
const TEST_EXTENSION_STEP_PBAS: u64 = 16;

#[derive(Clone, Copy)]
struct TestVbdEntry {
    key_id: KeyId,
    ciphertext: TestPayload,
}

type TestVbdTree = BTreeMap<Vba, TestVbdEntry>;

/// Copy-on-write block mapping tree.
///
/// Every tree version is identified by its root [`Pba`], each modification
/// yields a new root. Payloads get encrypted with the keys from the shared
/// [`TestKeyStore`].
pub struct TestVbd {
    keys: TestKeyStore,
    trees: cell::RefCell<BTreeMap<Pba, TestVbdTree>>,
    next_root_pba: cell::Cell<u64>,
    client_buffers: cell::RefCell<BTreeMap<(u64, u64), TestPayload>>,
    pub extension_step_pbas: cell::Cell<u64>,
    pub extension_fault: cell::Cell<TestExtensionFault>,
    pub fail_rekey_vba: cell::Cell<bool>,
    events: TestEventLog,
}

impl TestVbd {
    const INITIAL_ROOT_PBA: Pba = Pba(1 << 32);

    pub fn new(keys: TestKeyStore, events: TestEventLog) -> Self {
        let mut trees = BTreeMap::new();
        trees.insert(Self::INITIAL_ROOT_PBA, TestVbdTree::new());
        Self {
            keys,
            trees: cell::RefCell::new(trees),
            next_root_pba: cell::Cell::new(Self::INITIAL_ROOT_PBA.0 + 1),
            client_buffers: cell::RefCell::new(BTreeMap::new()),
            extension_step_pbas: cell::Cell::new(TEST_EXTENSION_STEP_PBAS),
            extension_fault: cell::Cell::new(TestExtensionFault::None),
            fail_rekey_vba: cell::Cell::new(false),
            events,
        }
    }

    /// The same tree storage, with the keys now registered at `keys`.
    pub fn snapshot(&self, keys: TestKeyStore, events: TestEventLog) -> Self {
        Self {
            keys,
            trees: cell::RefCell::new(self.trees.borrow().clone()),
            next_root_pba: cell::Cell::new(self.next_root_pba.get()),
            client_buffers: cell::RefCell::new(self.client_buffers.borrow().clone()),
            extension_step_pbas: cell::Cell::new(self.extension_step_pbas.get()),
            extension_fault: cell::Cell::new(TestExtensionFault::None),
            fail_rekey_vba: cell::Cell::new(false),
            events,
        }
    }

    pub fn initial_root_pba(&self) -> Pba {
        Self::INITIAL_ROOT_PBA
    }

    pub fn root_hash(root_pba: Pba) -> Hash {
        let mut hash = [0u8; HASH_SIZE];
        hash[..8].copy_from_slice(&root_pba.0.to_le_bytes());
        hash
    }

    pub fn set_client_data(&self, tag: u64, offset: u64, payload: TestPayload) {
        self.client_buffers.borrow_mut().insert((tag, offset), payload);
    }

    pub fn client_data(&self, tag: u64, offset: u64) -> Option<TestPayload> {
        self.client_buffers.borrow().get(&(tag, offset)).copied()
    }

    /// The key a VBA is stored under in a given snapshot, if written at all.
    pub fn stored_key_id(&self, snapshot: &Snapshot, vba: Vba) -> Option<KeyId> {
        self.trees
            .borrow()
            .get(&snapshot.pba)
            .and_then(|tree| tree.get(&vba))
            .map(|entry| entry.key_id)
    }

    fn lookup_tree(&self, snapshot: &Snapshot) -> Result<TestVbdTree, SbCtlError> {
        if snapshot.hash != Self::root_hash(snapshot.pba) {
            return Err(SbCtlError::VbdFailure);
        }
        self.trees.borrow().get(&snapshot.pba).cloned().ok_or(SbCtlError::VbdFailure)
    }

    /// Store a modified tree version under a new root, updating `snapshot`.
    fn commit_tree(&self, snapshot: &mut Snapshot, tree: TestVbdTree) {
        let root_pba = Pba(self.next_root_pba.get());
        self.next_root_pba.set(root_pba.0 + 1);
        self.trees.borrow_mut().insert(root_pba, tree);
        snapshot.pba = root_pba;
        snapshot.hash = Self::root_hash(root_pba);
    }
}

pub struct TestVbdWriteVbaOp {
    access: VbdVbaAccess,
    snapshot: Snapshot,
    free_tree: TreeRoot,
    meta_tree: TreeRoot,
}

impl TestOp<TestVbd> for TestVbdWriteVbaOp {
    type Output = Result<VbdWriteVbaOutput, SbCtlError>;

    fn run(self, vbd: &TestVbd) -> Self::Output {
        let Self {
            access,
            mut snapshot,
            mut free_tree,
            meta_tree,
        } = self;
        if access.vba > access.max_vba || snapshot.generation != access.curr_gen {
            return Err(SbCtlError::VbdFailure);
        }
        let payload = vbd
            .client_data(access.buffer.tag, access.buffer.offset)
            .ok_or(SbCtlError::VbdFailure)?;
        let ciphertext = vbd.keys.apply(access.key_id, &payload)?;
        let mut tree = vbd.lookup_tree(&snapshot)?;
        tree.insert(
            access.vba,
            TestVbdEntry {
                key_id: access.key_id,
                ciphertext,
            },
        );
        vbd.commit_tree(&mut snapshot, tree);
        // Allocating the new tree nodes rewrites the free tree.
        free_tree.pba = Pba(free_tree.pba.0 + 1);
        free_tree.generation = Generation::max(free_tree.generation, access.curr_gen);
        vbd.events.record(TestEvent::WriteVba {
            vba: access.vba,
            key_id: access.key_id,
        });
        Ok(VbdWriteVbaOutput {
            snapshot,
            free_tree,
            meta_tree,
        })
    }
}

pub struct TestVbdReadVbaOp {
    access: VbdVbaAccess,
    snapshot: Snapshot,
}

impl TestOp<TestVbd> for TestVbdReadVbaOp {
    type Output = Result<(), SbCtlError>;

    fn run(self, vbd: &TestVbd) -> Self::Output {
        let Self { access, snapshot } = self;
        let tree = vbd.lookup_tree(&snapshot)?;
        let payload = match tree.get(&access.vba) {
            Some(entry) => {
                // Decrypting under any other key would yield garbage.
                if entry.key_id != access.key_id {
                    return Err(SbCtlError::VbdFailure);
                }
                vbd.keys.apply(entry.key_id, &entry.ciphertext)?
            }
            None => [0u8; TEST_PAYLOAD_SIZE],
        };
        vbd.set_client_data(access.buffer.tag, access.buffer.offset, payload);
        vbd.events.record(TestEvent::ReadVba {
            vba: access.vba,
            key_id: access.key_id,
        });
        Ok(())
    }
}

pub struct TestVbdRekeyVbaOp {
    args: VbdRekeyVbaArgs,
}

impl TestOp<TestVbd> for TestVbdRekeyVbaOp {
    type Output = Result<VbdRekeyVbaOutput, SbCtlError>;

    fn run(self, vbd: &TestVbd) -> Self::Output {
        let mut args = self.args;
        if vbd.fail_rekey_vba.get() {
            return Err(SbCtlError::VbdFailure);
        }
        // Snapshots sharing a root keep sharing the rekeyed one.
        let mut rekeyed_roots: BTreeMap<Pba, (Pba, Hash)> = BTreeMap::new();
        for snapshot in args.snapshots.items.iter_mut().filter(|snapshot| snapshot.valid) {
            if let Some((pba, hash)) = rekeyed_roots.get(&snapshot.pba) {
                snapshot.pba = *pba;
                snapshot.hash = *hash;
                continue;
            }
            let mut tree = vbd.lookup_tree(snapshot)?;
            let entry = match tree.get_mut(&args.vba) {
                Some(entry) if entry.key_id == args.previous_key_id => entry,
                _ => continue,
            };
            let plaintext = vbd.keys.apply(args.previous_key_id, &entry.ciphertext)?;
            entry.ciphertext = vbd.keys.apply(args.current_key_id, &plaintext)?;
            entry.key_id = args.current_key_id;
            let old_root_pba = snapshot.pba;
            vbd.commit_tree(snapshot, tree);
            rekeyed_roots.insert(old_root_pba, (snapshot.pba, snapshot.hash));
        }
        vbd.events.record(TestEvent::RekeyVba { vba: args.vba });
        Ok(VbdRekeyVbaOutput {
            snapshots: args.snapshots,
            free_tree: args.free_tree,
            meta_tree: args.meta_tree,
        })
    }
}

/// Work out the physical blocks an extension step consumes, subject to
/// `fault`.
///
/// Returns the number of blocks consumed and the first unused one to report.
fn test_extension_step_accounting(
    fault: TestExtensionFault,
    step_pbas: u64,
    first_unused_pba: Pba,
    nr_of_pbas: u64,
) -> Result<(u64, Pba), SbCtlError> {
    let consumed = nr_of_pbas.min(step_pbas);
    match fault {
        TestExtensionFault::None => Ok((consumed, Pba(first_unused_pba.0 + consumed))),
        TestExtensionFault::NoProgress => Ok((0, first_unused_pba)),
        TestExtensionFault::WrongOffset => Ok((consumed, Pba(first_unused_pba.0 + consumed + 1))),
        TestExtensionFault::Fail => Err(SbCtlError::VbdFailure),
    }
}

pub struct TestVbdExtensionStepOp {
    args: VbdExtensionStepArgs,
}

impl TestOp<TestVbd> for TestVbdExtensionStepOp {
    type Output = Result<VbdExtensionStepOutput, SbCtlError>;

    fn run(self, vbd: &TestVbd) -> Self::Output {
        let mut args = self.args;
        let (consumed, first_unused_pba) = test_extension_step_accounting(
            vbd.extension_fault.get(),
            vbd.extension_step_pbas.get(),
            args.first_unused_pba,
            args.nr_of_pbas,
        )?;

        // Grow the newest snapshot, branched off for the current generation
        // if needed.
        let newest_idx = args.snapshots.newest_snapshot_idx()?;
        let mut newest = args.snapshots.items[newest_idx];
        let idx = if newest.generation == args.curr_gen {
            newest_idx
        } else {
            newest.generation = args.curr_gen;
            newest.keep = false;
            args.snapshots
                .idx_of_invalid_or_lowest_gen_evictable_snap(args.curr_gen, args.last_secured_generation)?
        };
        let tree = vbd.lookup_tree(&newest)?;
        vbd.commit_tree(&mut newest, tree);
        newest.nr_of_leaves += consumed;
        args.snapshots.items[idx] = newest;

        vbd.events.record(TestEvent::VbdExtensionStep { nr_of_pbas: consumed });
        Ok(VbdExtensionStepOutput {
            snapshots: args.snapshots,
            first_unused_pba,
            nr_of_pbas: args.nr_of_pbas - consumed,
            nr_of_leaves: consumed,
        })
    }
}

impl Vbd for TestVbd {
    type WriteVbaFuture = TestOpFuture<TestVbdWriteVbaOp>;

    fn write_vba(
        &self,
        access: VbdVbaAccess,
        snapshot: Snapshot,
        free_tree: TreeRoot,
        meta_tree: TreeRoot,
    ) -> Result<Self::WriteVbaFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestVbdWriteVbaOp {
            access,
            snapshot,
            free_tree,
            meta_tree,
        }))
    }

    type ReadVbaFuture = TestOpFuture<TestVbdReadVbaOp>;

    fn read_vba(&self, access: VbdVbaAccess, snapshot: Snapshot) -> Result<Self::ReadVbaFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestVbdReadVbaOp { access, snapshot }))
    }

    type RekeyVbaFuture = TestOpFuture<TestVbdRekeyVbaOp>;

    fn rekey_vba(&self, args: VbdRekeyVbaArgs) -> Result<Self::RekeyVbaFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestVbdRekeyVbaOp { args }))
    }

    type ExtensionStepFuture = TestOpFuture<TestVbdExtensionStepOp>;

    fn extension_step(&self, args: VbdExtensionStepArgs) -> Result<Self::ExtensionStepFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestVbdExtensionStepOp { args }))
    }
}

/// Free tree keeping track of its size only.
pub struct TestFreeTree {
    pub extension_step_pbas: cell::Cell<u64>,
    pub extension_fault: cell::Cell<TestExtensionFault>,
    events: TestEventLog,
}

impl TestFreeTree {
    pub fn new(events: TestEventLog) -> Self {
        Self {
            extension_step_pbas: cell::Cell::new(TEST_EXTENSION_STEP_PBAS),
            extension_fault: cell::Cell::new(TestExtensionFault::None),
            events,
        }
    }

    pub fn snapshot(&self, events: TestEventLog) -> Self {
        let snapshot = Self::new(events);
        snapshot.extension_step_pbas.set(self.extension_step_pbas.get());
        snapshot
    }
}

pub struct TestFreeTreeExtensionStepOp {
    args: FtExtensionStepArgs,
}

impl TestOp<TestFreeTree> for TestFreeTreeExtensionStepOp {
    type Output = Result<FtExtensionStepOutput, SbCtlError>;

    fn run(self, free_tree: &TestFreeTree) -> Self::Output {
        let args = self.args;
        let (consumed, first_unused_pba) = match test_extension_step_accounting(
            free_tree.extension_fault.get(),
            free_tree.extension_step_pbas.get(),
            args.first_unused_pba,
            args.nr_of_pbas,
        ) {
            Ok(accounting) => accounting,
            Err(_) => return Err(SbCtlError::FreeTreeFailure),
        };
        let mut root = args.free_tree;
        root.nr_of_leaves += consumed;
        root.generation = Generation::max(root.generation, args.curr_gen);
        free_tree.events.record(TestEvent::FtExtensionStep { nr_of_pbas: consumed });
        Ok(FtExtensionStepOutput {
            free_tree: root,
            first_unused_pba,
            nr_of_pbas: args.nr_of_pbas - consumed,
            nr_of_leaves: consumed,
        })
    }
}

impl FreeTree for TestFreeTree {
    type ExtensionStepFuture = TestOpFuture<TestFreeTreeExtensionStepOp>;

    fn extension_step(&self, args: FtExtensionStepArgs) -> Result<Self::ExtensionStepFuture, SbCtlError> {
        Ok(TestOpFuture::new(TestFreeTreeExtensionStepOp { args }))
    }
}
