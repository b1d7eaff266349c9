// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Single-queue image processing channel: scaling, cropping, color conversion and still image
//! codecs. Each operation is synchronous; it returns after the device finished and the output
//! descriptors were copied back.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::debug;
use base::error;
use base::info;
use base::warn;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::channel::record_for_destroy;
use crate::channel::run_control_task;
use crate::channel::Channel;
use crate::channel::ChannelId;
use crate::channel::ChannelLifecycleManager;
use crate::channel::ChannelResources;
use crate::config::Engine;
use crate::config::TransformConfig;
use crate::descriptor::PicDesc;
use crate::descriptor::StreamDesc;
use crate::device::Device;
use crate::device::DeviceAddr;
use crate::device::QueueId;
use crate::error::Error;
use crate::error::Result;
use crate::layout::JpegEncodeConfig;
use crate::layout::RectRecord;
use crate::layout::ResizeConfig;
use crate::layout::TransformChannelRecord;
use crate::layout::NO_SIGNAL;
use crate::resource::DeviceBuffer;
use crate::signal::Capability;
use crate::signal::CompletionSignal;
use crate::task::Kernel;
use crate::task::TaskDescriptor;
use crate::task::TaskSubmitter;
use crate::validate::FormatValidator;
use crate::validate::Stage;
use crate::validate::ValidationError;

pub const MAX_JPEG_QUALITY: u32 = 100;

/// Operations a transform channel can run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransformOp {
    Resize,
    Crop,
    CropAndPaste,
    ConvertColor,
    MakeBorder,
    CalcHist,
    JpegDecode,
    JpegEncode,
    PngDecode,
}

impl TransformOp {
    pub fn kernel(self) -> Kernel {
        match self {
            TransformOp::Resize => Kernel::Resize,
            TransformOp::Crop => Kernel::Crop,
            TransformOp::CropAndPaste => Kernel::CropAndPaste,
            TransformOp::ConvertColor => Kernel::ConvertColor,
            TransformOp::MakeBorder => Kernel::MakeBorder,
            TransformOp::CalcHist => Kernel::CalcHist,
            TransformOp::JpegDecode => Kernel::JpegDecode,
            TransformOp::JpegEncode => Kernel::JpegEncode,
            TransformOp::PngDecode => Kernel::PngDecode,
        }
    }

    /// The engine the channel must have been opened with to run this operation.
    pub fn engine(self) -> Engine {
        match self {
            TransformOp::JpegDecode => Engine::Jpegd,
            TransformOp::JpegEncode => Engine::Jpege,
            TransformOp::PngDecode => Engine::Pngd,
            _ => Engine::Vpc,
        }
    }
}

/// One positional kernel argument.
#[derive(Copy, Clone)]
pub enum Operand<'a> {
    Pic(&'a PicDesc),
    Stream(&'a StreamDesc),
    Raw(DeviceAddr),
    Null,
}

impl Operand<'_> {
    fn addr(&self) -> Option<DeviceAddr> {
        match self {
            Operand::Pic(pic) => Some(pic.addr()),
            Operand::Stream(stream) => Some(stream.addr()),
            Operand::Raw(addr) => Some(*addr),
            Operand::Null => None,
        }
    }

    fn copy_to_device(&self) -> Result<()> {
        match self {
            Operand::Pic(pic) => pic.copy_to_device(),
            Operand::Stream(stream) => stream.copy_to_device(),
            Operand::Raw(_) | Operand::Null => Ok(()),
        }
    }

    fn copy_from_device(&self) -> Result<()> {
        match self {
            Operand::Pic(pic) => pic.copy_from_device(),
            Operand::Stream(stream) => stream.copy_from_device(),
            Operand::Raw(_) | Operand::Null => Ok(()),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    fn to_record(self) -> Result<RectRecord> {
        if self.right <= self.left || self.bottom <= self.top {
            return Err(Error::InvalidArgument(format!("empty crop area {:?}", self)));
        }
        Ok(RectRecord {
            left: self.left,
            top: self.top,
            right: self.right,
            bottom: self.bottom,
        })
    }
}

pub struct TransformChannel {
    id: ChannelId,
    resources: ChannelResources,
    device: Arc<dyn Device>,
    config: TransformConfig,
    capability: Option<Capability>,
    queue: QueueId,
    signal: Option<CompletionSignal>,
    record: DeviceBuffer,
    opened: TransformChannelRecord,
    faulted: AtomicBool,
    validator: Arc<dyn FormatValidator>,
}

impl TransformChannel {
    pub(crate) fn open(
        manager: &ChannelLifecycleManager,
        config: &TransformConfig,
    ) -> Result<TransformChannel> {
        config.validate()?;
        let capability = if config.has_engine(Engine::Pngd) {
            let capability = manager.capability()?;
            if !capability.supports_png_decode() {
                return Err(Error::InvalidArgument(format!(
                    "png decode needs a newer accelerator (aux version {})",
                    capability.aux_version
                )));
            }
            Some(capability)
        } else {
            None
        };
        let device = manager.device();
        let variant = manager.signal_variant(config.with_signal, true)?;

        let mut resources = ChannelResources::new(device);
        let signal = match variant {
            Some(variant) => Some(resources.create_signal(variant)?),
            None => None,
        };
        let queue = resources.create_queue()?;
        let mut record = TransformChannelRecord {
            mode: config.mode(),
            signal: signal.map_or(NO_SIGNAL, |s| s.hw_id()),
            status: 0,
            reserved: 0,
        };
        let record_buf = DeviceBuffer::with_value(device, &record)?;
        run_control_task(
            device,
            Kernel::CreateChannel,
            signal.as_ref(),
            resources.signals(),
            &record_buf,
            &mut record,
            &[],
        )?;

        let id = ChannelId::allocate();
        info!("opened transform channel {} with {:?}", id, config.engines);
        Ok(TransformChannel {
            id,
            resources,
            device: Arc::clone(device),
            config: config.clone(),
            capability,
            queue,
            signal,
            record: record_buf,
            opened: record,
            faulted: AtomicBool::new(false),
            validator: Arc::clone(manager.validator()),
        })
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Runs `op` with the channel record as operand 0, followed by `inputs` and `outputs` in that
    /// order, and `config` copied inline after the operands. Outputs are copied back from the
    /// device before this returns.
    pub fn submit<C: IntoBytes + Immutable>(
        &self,
        op: TransformOp,
        inputs: &[Operand],
        outputs: &[Operand],
        config: &C,
    ) -> Result<()> {
        if self.is_faulted() {
            return Err(Error::ChannelFaulted(self.id));
        }
        if !self.config.has_engine(op.engine()) {
            return Err(Error::InvalidArgument(format!(
                "{:?} needs the {:?} engine, which channel {} was not opened with",
                op,
                op.engine(),
                self.id
            )));
        }
        for operand in inputs.iter().chain(outputs) {
            operand.copy_to_device()?;
        }
        let task = inputs
            .iter()
            .chain(outputs)
            .fold(
                TaskDescriptor::new(op.kernel()).operand(self.record.addr()),
                |task, operand| task.operand(operand.addr()),
            )
            .inline(config);

        let submitter = TaskSubmitter::new(self.device.as_ref(), self.queue, self.signal.as_ref());
        submitter.launch(&task)?;
        submitter.await_accept().map_err(|e| self.fault_with(e))?;
        self.device
            .synchronize(self.queue)
            .map_err(|e| self.fault_with(Error::Device("synchronize", e)))?;
        for operand in outputs {
            operand.copy_from_device()?;
        }
        debug!("channel {} ran {:?}", self.id, op);
        Ok(())
    }

    fn check_pictures(&self, input: &PicDesc, output: &PicDesc) -> Result<()> {
        self.validator
            .check_format(Stage::TransformInput, input.info().format)?;
        self.validator
            .check_format(Stage::TransformOutput, output.info().format)?;
        Ok(())
    }

    /// Scales `input` to the size described by `output`.
    pub fn resize(&self, input: &PicDesc, output: &PicDesc) -> Result<()> {
        self.check_pictures(input, output)?;
        self.submit(
            TransformOp::Resize,
            &[Operand::Pic(input)],
            &[Operand::Pic(output)],
            &ResizeConfig::default(),
        )
    }

    pub fn crop(&self, input: &PicDesc, output: &PicDesc, area: Rect) -> Result<()> {
        self.check_pictures(input, output)?;
        let info = input.info();
        if area.right > info.width || area.bottom > info.height {
            return Err(Error::InvalidArgument(format!(
                "crop area {:?} is outside the {}x{} input",
                area, info.width, info.height
            )));
        }
        self.submit(
            TransformOp::Crop,
            &[Operand::Pic(input)],
            &[Operand::Pic(output)],
            &area.to_record()?,
        )
    }

    pub fn convert_color(&self, input: &PicDesc, output: &PicDesc) -> Result<()> {
        self.check_pictures(input, output)?;
        self.submit(
            TransformOp::ConvertColor,
            &[Operand::Pic(input)],
            &[Operand::Pic(output)],
            &0u64,
        )
    }

    pub fn jpeg_decode(&self, input: &StreamDesc, output: &PicDesc) -> Result<()> {
        self.validator
            .check_format(Stage::JpegDecodeOutput, output.info().format)?;
        self.submit(
            TransformOp::JpegDecode,
            &[Operand::Stream(input)],
            &[Operand::Pic(output)],
            &0u64,
        )
    }

    /// Encodes `input` as JPEG. `output` must describe a buffer large enough for the worst case
    /// the validator predicts for this picture.
    pub fn jpeg_encode(&self, input: &PicDesc, output: &StreamDesc, quality: u32) -> Result<()> {
        if quality > MAX_JPEG_QUALITY {
            return Err(Error::InvalidArgument(format!(
                "jpeg quality {} is above {}",
                quality, MAX_JPEG_QUALITY
            )));
        }
        let info = input.info();
        self.validator
            .check_format(Stage::JpegEncodeInput, info.format)?;
        let needed = self.validator.predict_size(
            Stage::JpegEncodeOutput,
            info.format,
            info.width,
            info.height,
        )?;
        let size = output.info().size;
        if size < needed {
            return Err(ValidationError::BufferTooSmall { size, needed }.into());
        }
        self.submit(
            TransformOp::JpegEncode,
            &[Operand::Pic(input)],
            &[Operand::Stream(output)],
            &JpegEncodeConfig {
                quality,
                reserved: 0,
            },
        )
    }

    pub fn png_decode(&self, input: &StreamDesc, output: &PicDesc) -> Result<()> {
        match self.capability {
            Some(capability) if capability.supports_png_decode() => {}
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "channel {} was not opened for png decode",
                    self.id
                )))
            }
        }
        self.submit(
            TransformOp::PngDecode,
            &[Operand::Stream(input)],
            &[Operand::Pic(output)],
            &0u64,
        )
    }

    fn fault_with(&self, e: Error) -> Error {
        error!("channel {}: {}", self.id, e);
        if !self.faulted.swap(true, Ordering::SeqCst) {
            warn!("transform channel {} is now faulted", self.id);
        }
        e
    }
}

impl Channel for TransformChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn close(mut self) -> Result<()> {
        let mut first_error = None;
        let mut record = record_for_destroy(self.id, &self.record, &self.opened, &mut first_error);
        if let Err(e) = run_control_task(
            &self.device,
            Kernel::DestroyChannel,
            self.signal.as_ref(),
            &[],
            &self.record,
            &mut record,
            &[],
        ) {
            error!("channel {} failed to destroy device channel: {}", self.id, e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.resources.release() {
            first_error.get_or_insert(e);
        }
        info!("closed transform channel {}", self.id);
        first_error.map_or(Ok(()), Err)
    }
}
