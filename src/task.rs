// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Task descriptors and their submission to an execution queue.
//!
//! A task is one kernel launch: the kernel name, a positional list of operand addresses and an
//! opaque blob of inline configuration. On the wire it is a single argument block:
//!
//! ```text
//! +--------+---------------+------------------+----------------+
//! | length | operand_count | operands (u64 x n) | inline config |
//! +--------+---------------+------------------+----------------+
//! ```

use std::borrow::Cow;
use std::mem::size_of;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::device::Device;
use crate::device::DeviceAddr;
use crate::device::QueueId;
use crate::error::Error;
use crate::error::Result;
use crate::layout::ArgHeader;
use crate::signal::CompletionSignal;

/// Suffix of the kernel flavour that runs without completion signals.
const SIGNAL_FREE_SUFFIX: &str = "V2";

/// Device kernels known to the control plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kernel {
    GetVersion,
    CreateChannel,
    DestroyChannel,
    Resize,
    Crop,
    CropAndPaste,
    ConvertColor,
    MakeBorder,
    CalcHist,
    JpegDecode,
    JpegEncode,
    PngDecode,
    CreateVdecChannel,
    DestroyVdecChannel,
    VdecSendFrame,
    VdecGetFrame,
    CreateVencChannel,
    DestroyVencChannel,
    VencSendFrame,
    VencReleaseFrame,
}

impl Kernel {
    pub const ALL: [Kernel; 20] = [
        Kernel::GetVersion,
        Kernel::CreateChannel,
        Kernel::DestroyChannel,
        Kernel::Resize,
        Kernel::Crop,
        Kernel::CropAndPaste,
        Kernel::ConvertColor,
        Kernel::MakeBorder,
        Kernel::CalcHist,
        Kernel::JpegDecode,
        Kernel::JpegEncode,
        Kernel::PngDecode,
        Kernel::CreateVdecChannel,
        Kernel::DestroyVdecChannel,
        Kernel::VdecSendFrame,
        Kernel::VdecGetFrame,
        Kernel::CreateVencChannel,
        Kernel::DestroyVencChannel,
        Kernel::VencSendFrame,
        Kernel::VencReleaseFrame,
    ];

    pub fn name(self) -> &'static str {
        use self::Kernel::*;

        match self {
            GetVersion => "GetVersion",
            CreateChannel => "CreateChannel",
            DestroyChannel => "DestroyChannel",
            Resize => "VpcResize",
            Crop => "VpcCrop",
            CropAndPaste => "VpcCropAndPaste",
            ConvertColor => "VpcConvertColor",
            MakeBorder => "VpcMakeBorder",
            CalcHist => "VpcCalcHist",
            JpegDecode => "JpegDecode",
            JpegEncode => "JpegEncode",
            PngDecode => "PngDecode",
            CreateVdecChannel => "CreateVdecChannel",
            DestroyVdecChannel => "DestroyVdecChannel",
            VdecSendFrame => "VdecSendFrame",
            VdecGetFrame => "VdecGetFrame",
            CreateVencChannel => "CreateVencChannel",
            DestroyVencChannel => "DestroyVencChannel",
            VencSendFrame => "VencSendFrame",
            VencReleaseFrame => "VencReleaseFrame",
        }
    }

    fn has_signal_free_flavour(self) -> bool {
        self != Kernel::GetVersion
    }

    /// Name to launch the kernel under on a channel with (`signalled`) or without completion
    /// signals.
    pub fn launch_name(self, signalled: bool) -> Cow<'static, str> {
        if signalled || !self.has_signal_free_flavour() {
            Cow::Borrowed(self.name())
        } else {
            Cow::Owned(format!("{}{}", self.name(), SIGNAL_FREE_SUFFIX))
        }
    }

    /// Inverse of `launch_name`: the kernel and whether it is the signalled flavour.
    pub fn from_launch_name(name: &str) -> Option<(Kernel, bool)> {
        if let Some(kernel) = Kernel::ALL.iter().find(|k| k.name() == name) {
            return Some((*kernel, kernel.has_signal_free_flavour()));
        }
        let base = name.strip_suffix(SIGNAL_FREE_SUFFIX)?;
        Kernel::ALL
            .iter()
            .find(|k| k.has_signal_free_flavour() && k.name() == base)
            .map(|k| (*k, false))
    }
}

/// One kernel launch, built per submission and dropped right after it is enqueued.
#[derive(Clone, Debug)]
pub struct TaskDescriptor {
    kernel: Kernel,
    operands: Vec<DeviceAddr>,
    inline: Vec<u8>,
}

impl TaskDescriptor {
    pub fn new(kernel: Kernel) -> TaskDescriptor {
        TaskDescriptor {
            kernel,
            operands: Vec::new(),
            inline: Vec::new(),
        }
    }

    /// Appends an operand. `None` is encoded as address zero so later operands keep their
    /// position.
    pub fn operand(mut self, addr: impl Into<Option<DeviceAddr>>) -> TaskDescriptor {
        self.operands
            .push(addr.into().unwrap_or(DeviceAddr::NULL));
        self
    }

    /// Appends `config` to the inline configuration bytes.
    pub fn inline<T: IntoBytes + Immutable + ?Sized>(mut self, config: &T) -> TaskDescriptor {
        self.inline.extend_from_slice(config.as_bytes());
        self
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    pub fn operands(&self) -> &[DeviceAddr] {
        &self.operands
    }

    /// Serializes the descriptor into one contiguous argument block.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let length = size_of::<ArgHeader>()
            + self.operands.len() * size_of::<u64>()
            + self.inline.len();
        let header = ArgHeader {
            length: u32::try_from(length)
                .map_err(|_| Error::InvalidArgument(format!("{length} byte argument block")))?,
            operand_count: self.operands.len() as u32,
        };
        let mut block = Vec::with_capacity(length);
        block.extend_from_slice(header.as_bytes());
        for operand in &self.operands {
            block.extend_from_slice(&operand.0.to_le_bytes());
        }
        block.extend_from_slice(&self.inline);
        Ok(block)
    }
}

/// A decoded argument block, as a kernel sees it.
#[derive(Debug)]
pub struct ArgBlock<'a> {
    operands: Vec<DeviceAddr>,
    inline: &'a [u8],
}

impl<'a> ArgBlock<'a> {
    /// Parses `bytes`, returning `None` if the header does not match the block.
    pub fn parse(bytes: &'a [u8]) -> Option<ArgBlock<'a>> {
        let (header, rest) = ArgHeader::read_from_prefix(bytes).ok()?;
        if header.length as usize != bytes.len() {
            return None;
        }
        let operand_bytes = header.operand_count as usize * size_of::<u64>();
        if rest.len() < operand_bytes {
            return None;
        }
        let (operand_bytes, inline) = rest.split_at(operand_bytes);
        let operands = operand_bytes
            .chunks_exact(size_of::<u64>())
            .map(|chunk| u64::read_from_bytes(chunk).map(DeviceAddr))
            .collect::<std::result::Result<Vec<_>, _>>()
            .ok()?;
        Some(ArgBlock { operands, inline })
    }

    /// Operand at `index`, or null if the block has fewer operands.
    pub fn operand(&self, index: usize) -> DeviceAddr {
        self.operands
            .get(index)
            .copied()
            .unwrap_or(DeviceAddr::NULL)
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn inline(&self) -> &'a [u8] {
        self.inline
    }

    /// Reads a `T` from the start of the inline configuration.
    pub fn inline_as<T: FromBytes>(&self) -> Option<T> {
        T::read_from_prefix(self.inline).ok().map(|(value, _)| value)
    }
}

/// Enqueues tasks on one execution queue of a channel.
///
/// On a channel opened with a completion signal every `submit` is followed by a wait on that
/// signal, so later commands on the queue only run once the device has accepted the task.
pub struct TaskSubmitter<'a> {
    device: &'a dyn Device,
    queue: QueueId,
    signal: Option<&'a CompletionSignal>,
}

impl<'a> TaskSubmitter<'a> {
    pub fn new(
        device: &'a dyn Device,
        queue: QueueId,
        signal: Option<&'a CompletionSignal>,
    ) -> TaskSubmitter<'a> {
        TaskSubmitter {
            device,
            queue,
            signal,
        }
    }

    /// Enqueues `task` alone.
    pub fn launch(&self, task: &TaskDescriptor) -> Result<()> {
        let block = task.encode()?;
        let name = task.kernel().launch_name(self.signal.is_some());
        self.device
            .launch_kernel(self.queue, &name, &block)
            .map_err(|e| Error::Device("launch_kernel", e))
    }

    /// Enqueues the wait that marks the previous task as accepted. Does nothing without a signal.
    pub fn await_accept(&self) -> Result<()> {
        match self.signal {
            Some(signal) => signal.wait_then_maybe_reset(self.device, self.queue),
            None => Ok(()),
        }
    }

    /// Enqueues `task` followed by its acceptance wait.
    pub fn submit(&self, task: &TaskDescriptor) -> Result<()> {
        self.launch(task)?;
        self.await_accept()
    }
}
