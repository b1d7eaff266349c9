// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Records shared with device kernels through device memory.
//!
//! All fields are little-endian and the structs carry no implicit padding, so they can be copied
//! to and from device memory as raw bytes.

use std::mem::size_of;

use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Signal id written into channel records when the channel has no completion signal.
pub const NO_SIGNAL: u32 = u32::MAX;

/// Header of every task argument block, followed by `operand_count` u64 addresses and then the
/// inline configuration bytes. `length` counts the whole block.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ArgHeader {
    pub length: u32,
    pub operand_count: u32,
}

/// Channel record of a transform channel.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct TransformChannelRecord {
    pub mode: u32,
    pub signal: u32,
    pub status: u32,
    pub reserved: u32,
}

/// Channel record of a decode channel.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct VdecChannelRecord {
    pub hw_channel: u32,
    pub codec: u32,
    pub out_format: u32,
    pub out_width: u32,
    pub out_height: u32,
    pub ref_frames: u32,
    pub submit_signal: u32,
    pub fetch_signal: u32,
    pub status: u32,
    pub reserved: u32,
}

/// Channel record of an encode channel.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct VencChannelRecord {
    pub codec: u32,
    pub pic_format: u32,
    pub width: u32,
    pub height: u32,
    pub rc_mode: u32,
    pub src_rate: u32,
    pub max_bit_rate: u32,
    pub ip_prop: u32,
    pub submit_signal: u32,
    pub fetch_signal: u32,
    pub status: u32,
    pub reserved: u32,
}

/// Picture descriptor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct PicRecord {
    pub data: u64,
    pub size: u32,
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub width_stride: u32,
    pub height_stride: u32,
    pub status: u32,
    pub reserved: u32,
}

/// Compressed stream descriptor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct StreamRecord {
    pub data: u64,
    pub timestamp: u64,
    pub size: u32,
    pub format: u32,
    pub eos: u32,
    pub status: u32,
}

/// Written by the decode fetch kernel into the channel's share buffer for every result.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DecodeResultRecord {
    pub frame_id: u64,
    pub status: u32,
    pub reserved: u32,
    pub pic: PicRecord,
}

/// Inline configuration of the encode send-frame kernel.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct VencFrameConfig {
    pub eos: u8,
    pub force_idr: u8,
    pub reserved: [u8; 2],
}

/// Inline configuration of the encode release-frame kernel.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct VencReleaseConfig {
    pub mem_mode: u8,
    pub reserved: [u8; 3],
}

/// Inclusive-exclusive pixel rectangle used by crop and paste kernels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct RectRecord {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ResizeConfig {
    pub interpolation: u32,
    pub reserved: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct JpegEncodeConfig {
    pub quality: u32,
    pub reserved: u32,
}

const_assert_eq!(size_of::<ArgHeader>(), 8);
const_assert_eq!(size_of::<TransformChannelRecord>(), 16);
const_assert_eq!(size_of::<VdecChannelRecord>(), 40);
const_assert_eq!(size_of::<VencChannelRecord>(), 48);
const_assert_eq!(size_of::<PicRecord>(), 40);
const_assert_eq!(size_of::<StreamRecord>(), 32);
const_assert_eq!(size_of::<DecodeResultRecord>(), 56);
const_assert_eq!(size_of::<VencFrameConfig>(), 4);
const_assert_eq!(size_of::<VencReleaseConfig>(), 4);
const_assert_eq!(size_of::<RectRecord>(), 16);
const_assert_eq!(size_of::<ResizeConfig>(), 8);
const_assert_eq!(size_of::<JpegEncodeConfig>(), 8);
