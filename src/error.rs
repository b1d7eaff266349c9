// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Errors returned by the channel control plane.

use std::io;

use remain::sorted;
use thiserror::Error as ThisError;

use crate::channel::ChannelId;
use crate::device::DeviceError;
use crate::validate::ValidationError;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// A submission on this channel failed after the device accepted the work. The channel can
    /// only be closed.
    #[error("channel {0} is faulted and must be recreated")]
    ChannelFaulted(ChannelId),
    /// A runtime call failed before or while the device was executing it.
    #[error("device call {0} failed: {1}")]
    Device(&'static str, #[source] DeviceError),
    /// The device executed a control kernel and reported a non-zero status.
    #[error("device rejected {kernel} with status {status}")]
    DeviceRejected { kernel: &'static str, status: u32 },
    /// The end-of-stream sentinel did not come back within the configured timeout.
    #[error("channel {0} timed out waiting for end of stream")]
    EosTimeout(ChannelId),
    #[error("internal error: {0}")]
    Internal(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to spawn {0} thread: {1}")]
    SpawnThread(&'static str, #[source] io::Error),
    /// The device reported a completion for a frame that was never submitted.
    #[error("channel {channel} got a completion for unknown frame {frame_id}")]
    UnknownFrame { channel: ChannelId, frame_id: u64 },
    /// The capability probe returned a version this control plane cannot interpret.
    #[error("unsupported accelerator kernel version {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub type Result<T> = std::result::Result<T, Error>;
