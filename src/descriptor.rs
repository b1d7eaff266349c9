// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture and stream descriptors handed to device kernels.
//!
//! A descriptor is a host-side description of a buffer plus the device memory the kernels read it
//! from. Callers own descriptors; channels only borrow them for the lifetime of a frame and copy
//! them to and from the device around each submission.

use std::sync::Arc;

use base::warn;
use enumn::N;
use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::device::Device;
use crate::device::DeviceAddr;
use crate::error::Result;
use crate::layout::PicRecord;
use crate::layout::StreamRecord;
use crate::resource::DeviceBuffer;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, N)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum PixelFormat {
    Yuv400 = 0,
    #[default]
    Nv12 = 1,
    Nv21 = 2,
    Yuv422Sp = 3,
    Yvu422Sp = 4,
    Yuyv422Packed = 7,
    Uyvy422Packed = 8,
    Rgb888 = 12,
    Bgr888 = 13,
    Argb8888 = 14,
    Rgba8888 = 16,
}

/// Compressed stream formats.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, N)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum StreamFormat {
    H265Main = 0,
    H264Baseline = 1,
    H264Main = 2,
    #[default]
    H264High = 3,
    Jpeg = 16,
    Png = 17,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PicInfo {
    pub data: DeviceAddr,
    pub size: u32,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub width_stride: u32,
    pub height_stride: u32,
    /// Status the device reported for the last operation that wrote this picture.
    pub status: u32,
}

impl PicInfo {
    fn to_record(self) -> PicRecord {
        PicRecord {
            data: self.data.0,
            size: self.size,
            format: self.format as u32,
            width: self.width,
            height: self.height,
            width_stride: self.width_stride,
            height_stride: self.height_stride,
            status: self.status,
            reserved: 0,
        }
    }

    fn apply_record(&mut self, record: &PicRecord) {
        self.data = DeviceAddr(record.data);
        self.size = record.size;
        match PixelFormat::n(record.format) {
            Some(format) => self.format = format,
            None => warn!("device reported unknown pixel format {}", record.format),
        }
        self.width = record.width;
        self.height = record.height;
        self.width_stride = record.width_stride;
        self.height_stride = record.height_stride;
        self.status = record.status;
    }
}

/// A picture buffer descriptor.
pub struct PicDesc {
    buffer: DeviceBuffer,
    info: Mutex<PicInfo>,
}

impl PicDesc {
    pub fn new(device: &Arc<dyn Device>, info: PicInfo) -> Result<PicDesc> {
        Ok(PicDesc {
            buffer: DeviceBuffer::with_value(device, &info.to_record())?,
            info: Mutex::new(info),
        })
    }

    /// Device address of the descriptor.
    pub fn addr(&self) -> DeviceAddr {
        self.buffer.addr()
    }

    pub fn info(&self) -> PicInfo {
        *self.info.lock()
    }

    pub fn set_info(&self, info: PicInfo) {
        *self.info.lock() = info;
    }

    pub fn copy_to_device(&self) -> Result<()> {
        let record = self.info.lock().to_record();
        self.buffer.write(&record)
    }

    pub fn copy_from_device(&self) -> Result<()> {
        let record = self.buffer.read::<PicRecord>()?;
        self.apply_record(&record);
        Ok(())
    }

    /// Updates the host view from a record the device delivered out of band.
    pub(crate) fn apply_record(&self, record: &PicRecord) {
        self.info.lock().apply_record(record);
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub data: DeviceAddr,
    pub size: u32,
    pub format: StreamFormat,
    pub timestamp: u64,
    pub eos: bool,
    /// Status the device reported for the last operation that wrote this stream.
    pub status: u32,
}

impl StreamInfo {
    fn to_record(self) -> StreamRecord {
        StreamRecord {
            data: self.data.0,
            timestamp: self.timestamp,
            size: self.size,
            format: self.format as u32,
            eos: self.eos as u32,
            status: self.status,
        }
    }

    fn apply_record(&mut self, record: &StreamRecord) {
        self.data = DeviceAddr(record.data);
        self.timestamp = record.timestamp;
        self.size = record.size;
        match StreamFormat::n(record.format) {
            Some(format) => self.format = format,
            None => warn!("device reported unknown stream format {}", record.format),
        }
        self.eos = record.eos != 0;
        self.status = record.status;
    }
}

/// A compressed stream buffer descriptor.
pub struct StreamDesc {
    buffer: DeviceBuffer,
    info: Mutex<StreamInfo>,
}

impl StreamDesc {
    pub fn new(device: &Arc<dyn Device>, info: StreamInfo) -> Result<StreamDesc> {
        Ok(StreamDesc {
            buffer: DeviceBuffer::with_value(device, &info.to_record())?,
            info: Mutex::new(info),
        })
    }

    /// An empty stream flagged as end of stream.
    pub fn end_of_stream(device: &Arc<dyn Device>) -> Result<StreamDesc> {
        StreamDesc::new(
            device,
            StreamInfo {
                eos: true,
                ..Default::default()
            },
        )
    }

    /// Device address of the descriptor.
    pub fn addr(&self) -> DeviceAddr {
        self.buffer.addr()
    }

    pub fn info(&self) -> StreamInfo {
        *self.info.lock()
    }

    pub fn set_info(&self, info: StreamInfo) {
        *self.info.lock() = info;
    }

    pub fn is_eos(&self) -> bool {
        self.info.lock().eos
    }

    pub fn copy_to_device(&self) -> Result<()> {
        let record = self.info.lock().to_record();
        self.buffer.write(&record)
    }

    pub fn copy_from_device(&self) -> Result<()> {
        let record = self.buffer.read::<StreamRecord>()?;
        self.info.lock().apply_record(&record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;

    #[test]
    fn pic_desc_round_trips_through_device() {
        let fake = FakeDevice::new(200);
        let device: Arc<dyn Device> = fake.clone();
        let desc = PicDesc::new(
            &device,
            PicInfo {
                format: PixelFormat::Nv21,
                width: 64,
                height: 32,
                ..Default::default()
            },
        )
        .unwrap();
        desc.copy_to_device().unwrap();

        desc.set_info(PicInfo::default());
        desc.copy_from_device().unwrap();
        assert_eq!(desc.info().format, PixelFormat::Nv21);
        assert_eq!(desc.info().width, 64);

        drop(desc);
        assert!(fake.live().is_empty());
    }

    #[test]
    fn unknown_device_format_keeps_host_format() {
        let mut info = PicInfo {
            format: PixelFormat::Rgb888,
            ..Default::default()
        };
        info.apply_record(&PicRecord {
            format: 99,
            width: 8,
            ..Default::default()
        });
        assert_eq!(info.format, PixelFormat::Rgb888);
        assert_eq!(info.width, 8);
    }
}
