// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Superblock control of an encrypted, snapshot capable virtual block device.
//!
//! The [`SuperblockControl`](sbctl::SuperblockControl) owns the single
//! persistent root structure, the [`Superblock`](superblock::Superblock), and
//! sequences every operation mutating it in a crash-safe manner: dispatching
//! reads and writes to the block mapping tree with the right key, online
//! rekeying, online extension of the free tree and the block mapping tree, the
//! snapshot lifecycle as well as mounting and unmounting.
//!
//! The trees, the payload cipher, the trust anchor and the physical block IO
//! are external collaborators, accessed through the traits in [`backend`].

#![no_std]
// Lifetimes are not always obvious at first sight, allow for making them explicit even if
// redundant.
#![allow(clippy::needless_lifetimes)]

pub mod backend;
pub mod config;
pub mod error;
pub mod keys;
pub mod sbctl;
pub mod superblock;
pub mod types;

#[cfg(test)]
mod test;
