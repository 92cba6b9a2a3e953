// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Uniform request interface to all [`SuperblockControl`] operations.

use super::{
    CreateSnapshotFuture, DeinitializeFuture, DiscardSnapshotFuture, ExtendTreeFuture, FormatFuture, FormatParams,
    InitializeFuture, ReadVbasFuture, RekeyFuture, SbCtlFuture, SuperblockControl, SynchronizeFuture,
    TreeExtensionTarget, WriteVbasFuture,
};
use crate::{
    backend::SbCtlEnv,
    error::SbCtlError,
    superblock::SuperblockState,
    types::{Generation, Vba},
};
use core::{marker, pin, task};

/// A request to the [`SuperblockControl`].
#[derive(Clone, Copy, Debug)]
pub enum SbCtlRequest {
    WriteVbas { first_vba: Vba, num_vbas: u64, buffer_tag: u64 },
    ReadVbas { first_vba: Vba, num_vbas: u64, buffer_tag: u64 },
    Rekey,
    ExtendFreeTree { nr_of_pbas: u64 },
    ExtendVbd { nr_of_pbas: u64 },
    CreateSnapshot,
    DiscardSnapshot { generation: Generation },
    Synchronize,
    Initialize,
    Deinitialize,
    Format { params: FormatParams },
}

/// Result of a completed [`SbCtlRequest`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SbCtlRequestOutput {
    WriteVbas,
    ReadVbas,
    Rekey { rekeying_finished: bool },
    ExtendFreeTree { extension_finished: bool },
    ExtendVbd { extension_finished: bool },
    CreateSnapshot { generation: Generation },
    DiscardSnapshot,
    Synchronize { generation: Generation },
    Initialize { state: SuperblockState },
    Deinitialize,
    Format,
}

/// [`SbCtlFuture`] executing a [`SbCtlRequest`].
pub enum SbCtlRequestFuture<E: SbCtlEnv> {
    WriteVbas(WriteVbasFuture<E>),
    ReadVbas(ReadVbasFuture<E>),
    Rekey(RekeyFuture<E>),
    ExtendFreeTree(ExtendTreeFuture<E>),
    ExtendVbd(ExtendTreeFuture<E>),
    CreateSnapshot(CreateSnapshotFuture<E>),
    DiscardSnapshot(DiscardSnapshotFuture<E>),
    Synchronize(SynchronizeFuture<E>),
    Initialize(InitializeFuture<E>),
    Deinitialize(DeinitializeFuture<E>),
    Format(FormatFuture<E>),
}

impl<E: SbCtlEnv> SbCtlRequestFuture<E> {
    pub fn new(request: SbCtlRequest) -> Self {
        match request {
            SbCtlRequest::WriteVbas {
                first_vba,
                num_vbas,
                buffer_tag,
            } => Self::WriteVbas(WriteVbasFuture::new(first_vba, num_vbas, buffer_tag)),
            SbCtlRequest::ReadVbas {
                first_vba,
                num_vbas,
                buffer_tag,
            } => Self::ReadVbas(ReadVbasFuture::new(first_vba, num_vbas, buffer_tag)),
            SbCtlRequest::Rekey => Self::Rekey(RekeyFuture::new()),
            SbCtlRequest::ExtendFreeTree { nr_of_pbas } => {
                Self::ExtendFreeTree(ExtendTreeFuture::new(TreeExtensionTarget::FreeTree, nr_of_pbas))
            }
            SbCtlRequest::ExtendVbd { nr_of_pbas } => {
                Self::ExtendVbd(ExtendTreeFuture::new(TreeExtensionTarget::Vbd, nr_of_pbas))
            }
            SbCtlRequest::CreateSnapshot => Self::CreateSnapshot(CreateSnapshotFuture::new()),
            SbCtlRequest::DiscardSnapshot { generation } => Self::DiscardSnapshot(DiscardSnapshotFuture::new(generation)),
            SbCtlRequest::Synchronize => Self::Synchronize(SynchronizeFuture::new()),
            SbCtlRequest::Initialize => Self::Initialize(InitializeFuture::new()),
            SbCtlRequest::Deinitialize => Self::Deinitialize(DeinitializeFuture::new()),
            SbCtlRequest::Format { params } => Self::Format(FormatFuture::new(params)),
        }
    }
}

impl<E: SbCtlEnv> marker::Unpin for SbCtlRequestFuture<E> {}

impl<E: SbCtlEnv> SbCtlFuture<E> for SbCtlRequestFuture<E> {
    type Output = Result<SbCtlRequestOutput, SbCtlError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        sbctl: &mut SuperblockControl,
        env: &E,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        match this {
            Self::WriteVbas(fut) => {
                SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx).map(|r| r.map(|()| SbCtlRequestOutput::WriteVbas))
            }
            Self::ReadVbas(fut) => {
                SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx).map(|r| r.map(|()| SbCtlRequestOutput::ReadVbas))
            }
            Self::Rekey(fut) => SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx).map(|r| {
                r.map(|output| SbCtlRequestOutput::Rekey {
                    rekeying_finished: output.rekeying_finished,
                })
            }),
            Self::ExtendFreeTree(fut) => SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx).map(|r| {
                r.map(|output| SbCtlRequestOutput::ExtendFreeTree {
                    extension_finished: output.extension_finished,
                })
            }),
            Self::ExtendVbd(fut) => SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx).map(|r| {
                r.map(|output| SbCtlRequestOutput::ExtendVbd {
                    extension_finished: output.extension_finished,
                })
            }),
            Self::CreateSnapshot(fut) => SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx)
                .map(|r| r.map(|generation| SbCtlRequestOutput::CreateSnapshot { generation })),
            Self::DiscardSnapshot(fut) => SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx)
                .map(|r| r.map(|()| SbCtlRequestOutput::DiscardSnapshot)),
            Self::Synchronize(fut) => SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx)
                .map(|r| r.map(|generation| SbCtlRequestOutput::Synchronize { generation })),
            Self::Initialize(fut) => SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx)
                .map(|r| r.map(|state| SbCtlRequestOutput::Initialize { state })),
            Self::Deinitialize(fut) => SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx)
                .map(|r| r.map(|()| SbCtlRequestOutput::Deinitialize)),
            Self::Format(fut) => {
                SbCtlFuture::poll(pin::Pin::new(fut), sbctl, env, cx).map(|r| r.map(|()| SbCtlRequestOutput::Format))
            }
        }
    }
}
