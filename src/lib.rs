// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side control plane for an accelerator's media codec engines.
//!
//! A [`ChannelLifecycleManager`] opens channels on a [`Device`]: decode channels
//! ([`VdecChannel`]) that deliver frames to a callback in submission order, encode channels
//! ([`VencChannel`]) that do the same for bitstreams, and synchronous transform channels
//! ([`TransformChannel`]) for scaling, cropping, colour conversion and still image codecs.
//!
//! Work is submitted as kernel launches on per-channel execution queues. Whether the device
//! reports acceptance and completion through notify signals, event signals or not at all is
//! decided once per device from the version its `GetVersion` kernel reports.
//!
//! [`device::fake::FakeDevice`] simulates an accelerator in-process.

pub mod channel;
pub mod config;
pub mod decoder;
pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod encoder;
mod error;
pub mod image;
pub mod layout;
pub mod resource;
pub mod signal;
pub mod task;
pub mod validate;

pub use crate::channel::close;
pub use crate::channel::Channel;
pub use crate::channel::ChannelId;
pub use crate::channel::ChannelLifecycleManager;
pub use crate::decoder::DecodedFrame;
pub use crate::decoder::VdecChannel;
pub use crate::device::Device;
pub use crate::encoder::EncodedFrame;
pub use crate::encoder::VencChannel;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::image::TransformChannel;
pub use crate::signal::Capability;
pub use crate::signal::CapabilityProbe;
