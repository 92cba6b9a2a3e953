// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Interfaces to the external collaborators of the superblock control.
//!
//! The superblock control doesn't implement any tree algorithm, cipher or
//! physical IO itself. It sequences operations against
//! * a [`BlockIo`](block_io::BlockIo) providing access to the superblock slots,
//! * a [`Crypto`](crypto::Crypto) module holding the working set of payload keys,
//! * a [`TrustAnchor`](trust_anchor::TrustAnchor), the sole root of trust,
//! * the block mapping tree, [`Vbd`](vbd::Vbd),
//! * and the [`FreeTree`](free_tree::FreeTree).
//!
//! All of these are grouped together by means of a [`SbCtlEnv`] implementation.

pub mod block_io;
pub mod crypto;
pub mod free_tree;
pub mod soft_trust_anchor;
pub mod trust_anchor;
pub mod vbd;

use core::{pin, task};

/// Future trait implemented by all collaborator operation futures.
///
/// `BackendFuture` differs from the standard [Rust
/// `Future`](core::future::Future) only in that it takes an additional
/// `backend` argument, so that the future doesn't need to hold on to a
/// reference to the collaborator instance it had been obtained from.
pub trait BackendFuture<B: ?Sized> {
    type Output;

    /// Poll on a [`BackendFuture`].
    ///
    /// Completely analogous to the standard [Rust
    /// `Future::poll()`](core::future::Future::poll), except for the
    /// additional `backend` argument.
    ///
    /// # Arguments:
    ///
    /// * `backend` - The collaborator instance the [`BackendFuture`] had been
    ///   obtained from.
    /// * `cx` - The context of an asynchronous task.
    fn poll(self: pin::Pin<&mut Self>, backend: &B, cx: &mut task::Context<'_>) -> task::Poll<Self::Output>;
}

/// The set of collaborators the superblock control operates on.
pub trait SbCtlEnv {
    type BlockIo: block_io::BlockIo;
    type Crypto: crypto::Crypto;
    type TrustAnchor: trust_anchor::TrustAnchor;
    type Vbd: vbd::Vbd;
    type FreeTree: free_tree::FreeTree;

    fn block_io(&self) -> &Self::BlockIo;
    fn crypto(&self) -> &Self::Crypto;
    fn trust_anchor(&self) -> &Self::TrustAnchor;
    fn vbd(&self) -> &Self::Vbd;
    fn free_tree(&self) -> &Self::FreeTree;
}

/// Plain aggregate of collaborator instances implementing [`SbCtlEnv`].
pub struct SbCtlBackends<BIO, C, TA, V, FT> {
    pub block_io: BIO,
    pub crypto: C,
    pub trust_anchor: TA,
    pub vbd: V,
    pub free_tree: FT,
}

impl<BIO, C, TA, V, FT> SbCtlEnv for SbCtlBackends<BIO, C, TA, V, FT>
where
    BIO: block_io::BlockIo,
    C: crypto::Crypto,
    TA: trust_anchor::TrustAnchor,
    V: vbd::Vbd,
    FT: free_tree::FreeTree,
{
    type BlockIo = BIO;
    type Crypto = C;
    type TrustAnchor = TA;
    type Vbd = V;
    type FreeTree = FT;

    fn block_io(&self) -> &Self::BlockIo {
        &self.block_io
    }

    fn crypto(&self) -> &Self::Crypto {
        &self.crypto
    }

    fn trust_anchor(&self) -> &Self::TrustAnchor {
        &self.trust_anchor
    }

    fn vbd(&self) -> &Self::Vbd {
        &self.vbd
    }

    fn free_tree(&self) -> &Self::FreeTree {
        &self.free_tree
    }
}
