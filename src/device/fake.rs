// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process accelerator simulator.
//!
//! Every queue is a thread draining commands in order. Kernels are interpreted from the same
//! records the control plane writes, so channel records, argument blocks and signal hardware ids
//! are checked the way a device would see them. The simulator also counts every live handle and
//! can fail the Nth call of any device operation, which is what the unwind tests rely on.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use base::debug;
use base::error;
use base::warn;
use serde::Serialize;
use sync::Condvar;
use sync::Event;
use sync::Mutex;
use sync::Semaphore;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::config::Engine;
use crate::descriptor::StreamFormat;
use crate::device::Device;
use crate::device::DeviceAddr;
use crate::device::DeviceError;
use crate::device::HostCallback;
use crate::device::QueueId;
use crate::device::Result;
use crate::device::SignalId;
use crate::layout::DecodeResultRecord;
use crate::layout::PicRecord;
use crate::layout::StreamRecord;
use crate::layout::TransformChannelRecord;
use crate::layout::VdecChannelRecord;
use crate::layout::VencChannelRecord;
use crate::layout::VencFrameConfig;
use crate::layout::NO_SIGNAL;
use crate::task::ArgBlock;
use crate::task::Kernel;

/// Returned by an operation failed through [`FakeDevice::fail_nth`].
pub const ERROR_INJECTED: DeviceError = DeviceError(-5);
pub const ERROR_INVALID_HANDLE: DeviceError = DeviceError(-9);
pub const ERROR_BAD_ADDRESS: DeviceError = DeviceError(-14);
pub const ERROR_BAD_ARGUMENTS: DeviceError = DeviceError(-22);
pub const ERROR_QUEUE_STOPPED: DeviceError = DeviceError(-32);
pub const ERROR_BAD_KERNEL: DeviceError = DeviceError(-38);

/// Channel status: the decode hardware channel is already open.
pub const STATUS_CHANNEL_BUSY: u32 = 0x10;
/// Channel status: no channel at this record address.
pub const STATUS_UNKNOWN_CHANNEL: u32 = 0x11;
/// Channel status: signalled kernel launched for a signal-free channel or the reverse.
pub const STATUS_WRONG_FLAVOUR: u32 = 0x12;

/// Size the simulated still image decoders produce.
pub const FAKE_IMAGE_WIDTH: u32 = 64;
pub const FAKE_IMAGE_HEIGHT: u32 = 48;

const HW_ID_BASE: u32 = 0x100;
const ADDR_BASE: u64 = 0x1000_0000;
const ADDR_ALIGN: u64 = 0x100;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Device operations that can be made to fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FakeOp {
    CreateQueue,
    DestroyQueue,
    Synchronize,
    LaunchKernel,
    LaunchCallback,
    CreateNotify,
    DestroyNotify,
    NotifyWait,
    CreateEvent,
    DestroyEvent,
    EventWait,
    EventReset,
    SignalHwId,
    Alloc,
    Free,
    CopyToDevice,
    CopyFromDevice,
}

/// Handles currently held on the device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LiveResources {
    pub queues: usize,
    pub notifies: usize,
    pub events: usize,
    pub allocations: usize,
}

impl LiveResources {
    pub fn is_empty(&self) -> bool {
        *self == LiveResources::default()
    }
}

enum Signal {
    Notify(Arc<Semaphore>),
    Event(Arc<Event>),
}

impl Signal {
    fn raise(&self) {
        match self {
            Signal::Notify(semaphore) => semaphore.post(),
            Signal::Event(event) => event.set(),
        }
    }

    fn is_raised(&self) -> bool {
        match self {
            Signal::Notify(semaphore) => semaphore.available() > 0,
            Signal::Event(event) => event.is_set(),
        }
    }
}

enum Command {
    Kernel { name: String, args: Vec<u8> },
    NotifyWait(Arc<Semaphore>),
    EventWait(Arc<Event>),
    EventReset(Arc<Event>),
    Callback(HostCallback),
}

#[derive(Default)]
struct ProgressState {
    submitted: u64,
    completed: u64,
    error: Option<DeviceError>,
    stopped: bool,
}

#[derive(Default)]
struct Progress {
    state: Mutex<ProgressState>,
    cvar: Condvar,
}

impl Progress {
    fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
        self.cvar.notify_all();
    }

    fn finish(&self, result: Result<()>) {
        let mut state = self.state.lock();
        state.completed += 1;
        if let Err(e) = result {
            state.error.get_or_insert(e);
        }
        self.cvar.notify_all();
    }
}

struct QueueWorker {
    sender: mpsc::Sender<Command>,
    progress: Arc<Progress>,
    thread: JoinHandle<()>,
}

impl QueueWorker {
    fn stop(self) {
        let QueueWorker {
            sender,
            progress,
            thread,
        } = self;
        progress.stop();
        drop(sender);
        // The last reference to the device can go away on a queue thread, from a host callback.
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!("fake queue thread panicked");
        }
    }
}

#[derive(Default)]
struct Queues {
    workers: BTreeMap<QueueId, QueueWorker>,
    next_id: u32,
}

#[derive(Default)]
struct Memory {
    blocks: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl Memory {
    fn alloc(&mut self, size: usize) -> DeviceAddr {
        if self.next == 0 {
            self.next = ADDR_BASE;
        }
        let addr = self.next;
        let span = (size.max(1) as u64).div_ceil(ADDR_ALIGN) * ADDR_ALIGN;
        self.next += span;
        self.blocks.insert(addr, vec![0; size]);
        DeviceAddr(addr)
    }

    fn locate(&self, addr: DeviceAddr, len: usize) -> Result<(u64, usize)> {
        if addr.is_null() {
            return Err(ERROR_BAD_ADDRESS);
        }
        let (base, block) = self
            .blocks
            .range(..=addr.0)
            .next_back()
            .ok_or(ERROR_BAD_ADDRESS)?;
        let offset = (addr.0 - base) as usize;
        if offset + len > block.len() {
            return Err(ERROR_BAD_ADDRESS);
        }
        Ok((*base, offset))
    }

    fn read(&self, addr: DeviceAddr, dst: &mut [u8]) -> Result<()> {
        let (base, offset) = self.locate(addr, dst.len())?;
        dst.copy_from_slice(&self.blocks[&base][offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&mut self, addr: DeviceAddr, src: &[u8]) -> Result<()> {
        let (base, offset) = self.locate(addr, src.len())?;
        let block = self.blocks.get_mut(&base).ok_or(ERROR_BAD_ADDRESS)?;
        block[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct TransformEngine {
    mode: u32,
    signal: u32,
}

struct DecodeJob {
    frame_id: u64,
    output: DeviceAddr,
}

struct VdecEngine {
    config: VdecChannelRecord,
    decoding: VecDeque<DecodeJob>,
    ready: VecDeque<DecodeJob>,
}

struct VencEngine {
    config: VencChannelRecord,
    sequence: u64,
    unfetched: u32,
    fetch_raised: bool,
}

// Destroy kernels only accept the record the channel was created with.
fn same_vdec(created: &VdecChannelRecord, record: &VdecChannelRecord) -> bool {
    created.hw_channel == record.hw_channel
        && created.submit_signal == record.submit_signal
        && created.fetch_signal == record.fetch_signal
}

fn same_venc(created: &VencChannelRecord, record: &VencChannelRecord) -> bool {
    created.width == record.width
        && created.height == record.height
        && created.submit_signal == record.submit_signal
        && created.fetch_signal == record.fetch_signal
}

#[derive(Default)]
struct Engines {
    transforms: BTreeMap<u64, TransformEngine>,
    vdecs: BTreeMap<u64, VdecEngine>,
    vencs: BTreeMap<u64, VencEngine>,
}

impl Engines {
    fn decoding(&self, hw_channel: u32) -> usize {
        self.vdecs
            .values()
            .filter(|engine| engine.config.hw_channel == hw_channel)
            .map(|engine| engine.decoding.len())
            .sum()
    }
}

#[derive(Default)]
struct Stats {
    launches: BTreeMap<Kernel, usize>,
    last_operands: BTreeMap<Kernel, Vec<DeviceAddr>>,
    destroyed_queues: Vec<QueueId>,
    destroyed_signals: Vec<SignalId>,
    outstanding_fetches: usize,
    max_outstanding_fetches: usize,
}

/// State reachable from queue threads.
#[derive(Default)]
struct Shared {
    version: u32,
    memory: Mutex<Memory>,
    signals: Mutex<BTreeMap<SignalId, Signal>>,
    engines: Mutex<Engines>,
    engines_changed: Condvar,
    manual_decode: AtomicBool,
    misreported_frame: Mutex<Option<u64>>,
    rejections: Mutex<BTreeMap<Kernel, u32>>,
    stats: Mutex<Stats>,
}

fn check_flavour(signalled: bool, signal: u32) -> Result<()> {
    if signalled != (signal != NO_SIGNAL) {
        return Err(ERROR_BAD_KERNEL);
    }
    Ok(())
}

fn align16(value: u32) -> u32 {
    (value + 15) & !15
}

impl Shared {
    fn read<T: FromBytes + IntoBytes>(&self, addr: DeviceAddr) -> Result<T> {
        let mut value = T::new_zeroed();
        self.memory.lock().read(addr, value.as_mut_bytes())?;
        Ok(value)
    }

    fn write<T: IntoBytes + Immutable>(&self, addr: DeviceAddr, value: &T) -> Result<()> {
        self.memory.lock().write(addr, value.as_bytes())
    }

    fn raise(&self, hw_id: u32) -> Result<()> {
        let id = SignalId(hw_id.checked_sub(HW_ID_BASE).ok_or(ERROR_INVALID_HANDLE)?);
        self.signals
            .lock()
            .get(&id)
            .ok_or(ERROR_INVALID_HANDLE)?
            .raise();
        Ok(())
    }

    fn take_rejection(&self, kernel: Kernel) -> Option<u32> {
        self.rejections.lock().remove(&kernel)
    }

    fn execute(&self, command: Command, progress: &Progress) -> Result<()> {
        match command {
            Command::Kernel { name, args } => self.run_kernel(&name, &args, progress),
            Command::NotifyWait(semaphore) => loop {
                if semaphore.wait_timeout(POLL_INTERVAL) {
                    return Ok(());
                }
                if progress.is_stopped() {
                    return Err(ERROR_QUEUE_STOPPED);
                }
            },
            Command::EventWait(event) => loop {
                if event.wait_timeout(POLL_INTERVAL) {
                    return Ok(());
                }
                if progress.is_stopped() {
                    return Err(ERROR_QUEUE_STOPPED);
                }
            },
            Command::EventReset(event) => {
                event.reset();
                Ok(())
            }
            Command::Callback(callback) => {
                callback();
                Ok(())
            }
        }
    }

    fn run_kernel(&self, name: &str, args: &[u8], progress: &Progress) -> Result<()> {
        let (kernel, signalled) = Kernel::from_launch_name(name).ok_or(ERROR_BAD_KERNEL)?;
        let block = ArgBlock::parse(args).ok_or(ERROR_BAD_ARGUMENTS)?;
        debug!("fake device running {}", name);
        match kernel {
            Kernel::GetVersion => self.write(block.operand(0), &self.version),
            Kernel::CreateChannel => self.create_transform(&block, signalled),
            Kernel::DestroyChannel => self.destroy_transform(&block),
            Kernel::CreateVdecChannel => self.create_vdec(&block, signalled),
            Kernel::DestroyVdecChannel => self.destroy_vdec(&block),
            Kernel::VdecSendFrame => self.vdec_send_frame(&block, signalled),
            Kernel::VdecGetFrame => {
                let result = self.vdec_get_frame(&block, signalled, progress);
                let mut stats = self.stats.lock();
                stats.outstanding_fetches = stats.outstanding_fetches.saturating_sub(1);
                result
            }
            Kernel::CreateVencChannel => self.create_venc(&block, signalled),
            Kernel::DestroyVencChannel => self.destroy_venc(&block),
            Kernel::VencSendFrame => self.venc_send_frame(&block, signalled),
            Kernel::VencReleaseFrame => self.venc_release_frame(&block),
            Kernel::Resize
            | Kernel::Crop
            | Kernel::CropAndPaste
            | Kernel::ConvertColor
            | Kernel::MakeBorder
            | Kernel::CalcHist
            | Kernel::JpegDecode
            | Kernel::JpegEncode
            | Kernel::PngDecode => self.run_transform(kernel, &block, signalled),
        }
    }

    fn create_transform(&self, block: &ArgBlock, signalled: bool) -> Result<()> {
        let addr = block.operand(0);
        let mut record: TransformChannelRecord = self.read(addr)?;
        record.status = if let Some(status) = self.take_rejection(Kernel::CreateChannel) {
            status
        } else if check_flavour(signalled, record.signal).is_err() {
            STATUS_WRONG_FLAVOUR
        } else {
            self.engines.lock().transforms.insert(
                addr.0,
                TransformEngine {
                    mode: record.mode,
                    signal: record.signal,
                },
            );
            0
        };
        self.write(addr, &record)
    }

    fn destroy_transform(&self, block: &ArgBlock) -> Result<()> {
        let addr = block.operand(0);
        let mut record: TransformChannelRecord = self.read(addr)?;
        record.status = if let Some(status) = self.take_rejection(Kernel::DestroyChannel) {
            status
        } else {
            let mut engines = self.engines.lock();
            let created = engines
                .transforms
                .get(&addr.0)
                .map_or(false, |engine| {
                    engine.mode == record.mode && engine.signal == record.signal
                });
            if created {
                engines.transforms.remove(&addr.0);
                0
            } else {
                STATUS_UNKNOWN_CHANNEL
            }
        };
        self.write(addr, &record)
    }

    fn run_transform(&self, kernel: Kernel, block: &ArgBlock, signalled: bool) -> Result<()> {
        let engine = *self
            .engines
            .lock()
            .transforms
            .get(&block.operand(0).0)
            .ok_or(ERROR_INVALID_HANDLE)?;
        check_flavour(signalled, engine.signal)?;
        let needed = match kernel {
            Kernel::JpegDecode => Engine::Jpegd,
            Kernel::JpegEncode => Engine::Jpege,
            Kernel::PngDecode => Engine::Pngd,
            _ => Engine::Vpc,
        };
        if engine.mode & needed.bit() == 0 {
            return Err(ERROR_BAD_KERNEL);
        }
        if block.operand_count() < 2 {
            return Err(ERROR_BAD_ARGUMENTS);
        }
        let output = block.operand(block.operand_count() - 1);
        match kernel {
            Kernel::CalcHist => {}
            Kernel::JpegEncode => {
                let input: PicRecord = self.read(block.operand(1))?;
                let mut stream: StreamRecord = self.read(output)?;
                stream.size = (input.size / 10).max(1);
                stream.format = StreamFormat::Jpeg as u32;
                stream.status = 0;
                self.write(output, &stream)?;
            }
            Kernel::JpegDecode | Kernel::PngDecode => {
                let mut pic: PicRecord = self.read(output)?;
                pic.width = FAKE_IMAGE_WIDTH;
                pic.height = FAKE_IMAGE_HEIGHT;
                pic.width_stride = align16(FAKE_IMAGE_WIDTH);
                pic.height_stride = align16(FAKE_IMAGE_HEIGHT);
                pic.size = pic.width_stride * pic.height_stride * 3 / 2;
                pic.status = 0;
                self.write(output, &pic)?;
            }
            _ => {
                let mut pic: PicRecord = self.read(output)?;
                pic.status = 0;
                self.write(output, &pic)?;
            }
        }
        if engine.signal != NO_SIGNAL {
            self.raise(engine.signal)?;
        }
        Ok(())
    }

    fn create_vdec(&self, block: &ArgBlock, signalled: bool) -> Result<()> {
        let addr = block.operand(0);
        let mut record: VdecChannelRecord = self.read(addr)?;
        let rejection = self.take_rejection(Kernel::CreateVdecChannel);
        record.status = {
            let mut engines = self.engines.lock();
            let busy = engines
                .vdecs
                .values()
                .any(|engine| engine.config.hw_channel == record.hw_channel);
            if let Some(status) = rejection {
                status
            } else if busy {
                STATUS_CHANNEL_BUSY
            } else if check_flavour(signalled, record.submit_signal).is_err()
                || check_flavour(signalled, record.fetch_signal).is_err()
            {
                STATUS_WRONG_FLAVOUR
            } else {
                engines.vdecs.insert(
                    addr.0,
                    VdecEngine {
                        config: record,
                        decoding: VecDeque::new(),
                        ready: VecDeque::new(),
                    },
                );
                0
            }
        };
        self.write(addr, &record)
    }

    fn destroy_vdec(&self, block: &ArgBlock) -> Result<()> {
        let addr = block.operand(0);
        let mut record: VdecChannelRecord = self.read(addr)?;
        record.status = if let Some(status) = self.take_rejection(Kernel::DestroyVdecChannel) {
            status
        } else {
            let mut engines = self.engines.lock();
            let created = engines
                .vdecs
                .get(&addr.0)
                .map_or(false, |engine| same_vdec(&engine.config, &record));
            if created {
                engines.vdecs.remove(&addr.0);
                0
            } else {
                STATUS_UNKNOWN_CHANNEL
            }
        };
        self.engines_changed.notify_all();
        self.write(addr, &record)
    }

    fn vdec_send_frame(&self, block: &ArgBlock, signalled: bool) -> Result<()> {
        let frame_id: u64 = block.inline_as().ok_or(ERROR_BAD_ARGUMENTS)?;
        let input: StreamRecord = self.read(block.operand(1))?;
        if (input.eos != 0) != (frame_id == 0) {
            return Err(ERROR_BAD_ARGUMENTS);
        }
        let job = DecodeJob {
            frame_id,
            output: block.operand(2),
        };
        let submit_signal = {
            let mut engines = self.engines.lock();
            let engine = engines
                .vdecs
                .get_mut(&block.operand(0).0)
                .ok_or(ERROR_INVALID_HANDLE)?;
            check_flavour(signalled, engine.config.submit_signal)?;
            if self.manual_decode.load(Ordering::SeqCst) {
                engine.decoding.push_back(job);
            } else {
                engine.ready.push_back(job);
            }
            engine.config.submit_signal
        };
        self.engines_changed.notify_all();
        if submit_signal != NO_SIGNAL {
            self.raise(submit_signal)?;
        }
        Ok(())
    }

    fn vdec_get_frame(&self, block: &ArgBlock, signalled: bool, progress: &Progress) -> Result<()> {
        let addr = block.operand(0);
        let (job, config) = {
            let mut engines = self.engines.lock();
            loop {
                let engine = engines.vdecs.get_mut(&addr.0).ok_or(ERROR_INVALID_HANDLE)?;
                check_flavour(signalled, engine.config.fetch_signal)?;
                if let Some(job) = engine.ready.pop_front() {
                    break (job, engine.config);
                }
                if progress.is_stopped() {
                    return Err(ERROR_QUEUE_STOPPED);
                }
                engines = self
                    .engines_changed
                    .wait_timeout_while(engines, POLL_INTERVAL, |engines| {
                        engines
                            .vdecs
                            .get(&addr.0)
                            .map_or(false, |engine| engine.ready.is_empty())
                    })
                    .0;
            }
        };

        let mut result = DecodeResultRecord {
            frame_id: self
                .misreported_frame
                .lock()
                .take()
                .unwrap_or(job.frame_id),
            ..Default::default()
        };
        if !job.output.is_null() {
            let (width, height) = if config.out_width != 0 {
                (config.out_width, config.out_height)
            } else {
                (FAKE_IMAGE_WIDTH, FAKE_IMAGE_HEIGHT)
            };
            let mut pic: PicRecord = self.read(job.output)?;
            pic.width = width;
            pic.height = height;
            pic.width_stride = align16(width);
            pic.height_stride = align16(height);
            pic.size = pic.width_stride * pic.height_stride * 3 / 2;
            pic.status = 0;
            self.write(job.output, &pic)?;
            result.pic = pic;
        }
        self.write(block.operand(1), &result)?;
        if config.fetch_signal != NO_SIGNAL {
            self.raise(config.fetch_signal)?;
        }
        Ok(())
    }

    fn create_venc(&self, block: &ArgBlock, signalled: bool) -> Result<()> {
        let addr = block.operand(0);
        let mut record: VencChannelRecord = self.read(addr)?;
        record.status = if let Some(status) = self.take_rejection(Kernel::CreateVencChannel) {
            status
        } else if check_flavour(signalled, record.submit_signal).is_err()
            || check_flavour(signalled, record.fetch_signal).is_err()
        {
            STATUS_WRONG_FLAVOUR
        } else {
            self.engines.lock().vencs.insert(
                addr.0,
                VencEngine {
                    config: record,
                    sequence: 0,
                    unfetched: 0,
                    fetch_raised: false,
                },
            );
            0
        };
        self.write(addr, &record)
    }

    fn destroy_venc(&self, block: &ArgBlock) -> Result<()> {
        let addr = block.operand(0);
        let mut record: VencChannelRecord = self.read(addr)?;
        record.status = if let Some(status) = self.take_rejection(Kernel::DestroyVencChannel) {
            status
        } else {
            let mut engines = self.engines.lock();
            let created = engines
                .vencs
                .get(&addr.0)
                .map_or(false, |engine| same_venc(&engine.config, &record));
            if created {
                engines.vencs.remove(&addr.0);
                0
            } else {
                STATUS_UNKNOWN_CHANNEL
            }
        };
        self.write(addr, &record)
    }

    fn venc_send_frame(&self, block: &ArgBlock, signalled: bool) -> Result<()> {
        let frame: VencFrameConfig = block.inline_as().ok_or(ERROR_BAD_ARGUMENTS)?;
        let addr = block.operand(0);
        let (config, timestamp) = {
            let mut engines = self.engines.lock();
            let engine = engines.vencs.get_mut(&addr.0).ok_or(ERROR_INVALID_HANDLE)?;
            check_flavour(signalled, engine.config.submit_signal)?;
            engine.sequence += 1;
            (engine.config, engine.sequence)
        };
        if frame.eos != 0 {
            return self.raise(config.submit_signal);
        }

        let input: PicRecord = self.read(block.operand(1))?;
        let output = block.operand(2);
        let mut stream: StreamRecord = self.read(output)?;
        stream.size = (input.size / 20).max(1);
        stream.format = config.codec;
        stream.timestamp = timestamp;
        stream.eos = 0;
        stream.status = 0;
        self.write(output, &stream)?;

        let raise_fetch = {
            let mut engines = self.engines.lock();
            let engine = engines.vencs.get_mut(&addr.0).ok_or(ERROR_INVALID_HANDLE)?;
            if engine.fetch_raised {
                engine.unfetched += 1;
                false
            } else {
                engine.fetch_raised = true;
                true
            }
        };
        self.raise(config.submit_signal)?;
        if raise_fetch {
            self.raise(config.fetch_signal)?;
        }
        Ok(())
    }

    /// The fetch signal carries one result at a time; releasing a result exposes the next one.
    fn venc_release_frame(&self, block: &ArgBlock) -> Result<()> {
        let fetch_signal = {
            let mut engines = self.engines.lock();
            let engine = engines
                .vencs
                .get_mut(&block.operand(0).0)
                .ok_or(ERROR_INVALID_HANDLE)?;
            engine.fetch_raised = false;
            if engine.unfetched == 0 {
                return Ok(());
            }
            engine.unfetched -= 1;
            engine.fetch_raised = true;
            engine.config.fetch_signal
        };
        self.raise(fetch_signal)
    }
}

fn run_queue(shared: Arc<Shared>, progress: Arc<Progress>, commands: mpsc::Receiver<Command>) {
    while let Ok(command) = commands.recv() {
        if progress.is_stopped() {
            break;
        }
        let result = shared.execute(command, &progress);
        if let Err(e) = result {
            warn!("fake device command failed: {}", e);
        }
        progress.finish(result);
    }
}

/// Simulated accelerator. Create it with [`FakeDevice::new`] and hand out clones of the `Arc` as
/// `Arc<dyn Device>`.
pub struct FakeDevice {
    shared: Arc<Shared>,
    queues: Mutex<Queues>,
    next_signal: AtomicU32,
    faults: Mutex<BTreeMap<FakeOp, usize>>,
}

impl FakeDevice {
    /// A device whose version kernel reports `version`, e.g. `200` or `100003`.
    pub fn new(version: u32) -> Arc<FakeDevice> {
        Arc::new(FakeDevice {
            shared: Arc::new(Shared {
                version,
                ..Default::default()
            }),
            queues: Mutex::new(Queues::default()),
            next_signal: AtomicU32::new(1),
            faults: Mutex::new(BTreeMap::new()),
        })
    }

    /// Makes the `n`th call of `op` from now on fail with `ERROR_INJECTED`. `n` starts at 1.
    pub fn fail_nth(&self, op: FakeOp, n: usize) {
        self.faults.lock().insert(op, n.max(1));
    }

    /// Makes the next run of `kernel` report `status` in its channel record.
    pub fn reject_kernel(&self, kernel: Kernel, status: u32) {
        self.shared.rejections.lock().insert(kernel, status);
    }

    /// In manual mode decoded frames are held until [`FakeDevice::complete_next_frame`] releases
    /// them. Leaving manual mode releases everything held.
    pub fn set_manual_decode(&self, manual: bool) {
        self.shared.manual_decode.store(manual, Ordering::SeqCst);
        if !manual {
            let mut engines = self.shared.engines.lock();
            for engine in engines.vdecs.values_mut() {
                let held: Vec<DecodeJob> = engine.decoding.drain(..).collect();
                engine.ready.extend(held);
            }
        }
        self.shared.engines_changed.notify_all();
    }

    /// Makes the next decode result carry `frame_id` instead of the id of the frame it finished.
    pub fn misreport_next_frame(&self, frame_id: u64) {
        *self.shared.misreported_frame.lock() = Some(frame_id);
    }

    /// Finishes the oldest frame held on decode hardware channel `hw_channel`. Returns false if
    /// nothing was held.
    pub fn complete_next_frame(&self, hw_channel: u32) -> bool {
        let completed = {
            let mut engines = self.shared.engines.lock();
            engines
                .vdecs
                .values_mut()
                .find(|engine| engine.config.hw_channel == hw_channel)
                .and_then(|engine| {
                    let job = engine.decoding.pop_front()?;
                    engine.ready.push_back(job);
                    Some(())
                })
                .is_some()
        };
        self.shared.engines_changed.notify_all();
        completed
    }

    /// Waits until at least `count` frames are held on `hw_channel`.
    pub fn wait_for_decoding(&self, hw_channel: u32, count: usize, timeout: Duration) -> bool {
        let (engines, _) = self.shared.engines_changed.wait_timeout_while(
            self.shared.engines.lock(),
            timeout,
            |engines| engines.decoding(hw_channel) < count,
        );
        engines.decoding(hw_channel) >= count
    }

    pub fn raise_signal(&self, hw_id: u32) {
        if let Err(e) = self.shared.raise(hw_id) {
            error!("cannot raise signal {}: {}", hw_id, e);
        }
    }

    pub fn signal_is_raised(&self, hw_id: u32) -> bool {
        let Some(id) = hw_id.checked_sub(HW_ID_BASE).map(SignalId) else {
            return false;
        };
        self.shared
            .signals
            .lock()
            .get(&id)
            .map_or(false, Signal::is_raised)
    }

    pub fn live(&self) -> LiveResources {
        let (notifies, events) = self.shared.signals.lock().values().fold(
            (0, 0),
            |(notifies, events), signal| match signal {
                Signal::Notify(_) => (notifies + 1, events),
                Signal::Event(_) => (notifies, events + 1),
            },
        );
        LiveResources {
            queues: self.queues.lock().workers.len(),
            notifies,
            events,
            allocations: self.shared.memory.lock().blocks.len(),
        }
    }

    /// How many times `kernel` was launched, in either flavour.
    pub fn kernel_launches(&self, kernel: Kernel) -> usize {
        self.shared
            .stats
            .lock()
            .launches
            .get(&kernel)
            .copied()
            .unwrap_or(0)
    }

    /// Operands of the most recent launch of `kernel`.
    pub fn last_operands(&self, kernel: Kernel) -> Vec<DeviceAddr> {
        self.shared
            .stats
            .lock()
            .last_operands
            .get(&kernel)
            .cloned()
            .unwrap_or_default()
    }

    /// Device-side channels created and not yet destroyed, of any kind.
    pub fn open_channels(&self) -> usize {
        let engines = self.shared.engines.lock();
        engines.transforms.len() + engines.vdecs.len() + engines.vencs.len()
    }

    /// Destroyed queues, oldest destruction first.
    pub fn destroyed_queues(&self) -> Vec<QueueId> {
        self.shared.stats.lock().destroyed_queues.clone()
    }

    /// Destroyed notifies and events, oldest destruction first.
    pub fn destroyed_signals(&self) -> Vec<SignalId> {
        self.shared.stats.lock().destroyed_signals.clone()
    }

    /// Highest number of decode fetch commands that were queued at the same time.
    pub fn max_outstanding_fetches(&self) -> usize {
        self.shared.stats.lock().max_outstanding_fetches
    }

    fn inject(&self, op: FakeOp) -> Result<()> {
        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.get_mut(&op) {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(&op);
                debug!("failing {:?} on request", op);
                return Err(ERROR_INJECTED);
            }
        }
        Ok(())
    }

    fn enqueue(&self, queue: QueueId, command: Command) -> Result<()> {
        let queues = self.queues.lock();
        let worker = queues.workers.get(&queue).ok_or(ERROR_INVALID_HANDLE)?;
        worker.progress.state.lock().submitted += 1;
        if worker.sender.send(command).is_err() {
            worker.progress.state.lock().submitted -= 1;
            return Err(ERROR_QUEUE_STOPPED);
        }
        Ok(())
    }

    fn record_launch(&self, name: &str, args: &[u8]) -> Option<Kernel> {
        let (kernel, _) = Kernel::from_launch_name(name)?;
        let mut stats = self.shared.stats.lock();
        *stats.launches.entry(kernel).or_default() += 1;
        if let Some(block) = ArgBlock::parse(args) {
            let operands = (0..block.operand_count())
                .map(|i| block.operand(i))
                .collect();
            stats.last_operands.insert(kernel, operands);
        }
        if kernel == Kernel::VdecGetFrame {
            stats.outstanding_fetches += 1;
            stats.max_outstanding_fetches = stats
                .max_outstanding_fetches
                .max(stats.outstanding_fetches);
        }
        Some(kernel)
    }

    fn unrecord_launch(&self, kernel: Kernel) {
        let mut stats = self.shared.stats.lock();
        if let Some(count) = stats.launches.get_mut(&kernel) {
            *count -= 1;
        }
        if kernel == Kernel::VdecGetFrame {
            stats.outstanding_fetches -= 1;
        }
    }

    fn notify(&self, id: SignalId) -> Result<Arc<Semaphore>> {
        match self.shared.signals.lock().get(&id) {
            Some(Signal::Notify(semaphore)) => Ok(Arc::clone(semaphore)),
            _ => Err(ERROR_INVALID_HANDLE),
        }
    }

    fn event(&self, id: SignalId) -> Result<Arc<Event>> {
        match self.shared.signals.lock().get(&id) {
            Some(Signal::Event(event)) => Ok(Arc::clone(event)),
            _ => Err(ERROR_INVALID_HANDLE),
        }
    }

    fn create_signal(&self, signal: Signal) -> SignalId {
        let id = SignalId(self.next_signal.fetch_add(1, Ordering::Relaxed));
        self.shared.signals.lock().insert(id, signal);
        id
    }

    fn destroy_signal(&self, id: SignalId, notify: bool) -> Result<()> {
        let mut signals = self.shared.signals.lock();
        match signals.get(&id) {
            Some(Signal::Notify(_)) if notify => {}
            Some(Signal::Event(_)) if !notify => {}
            _ => return Err(ERROR_INVALID_HANDLE),
        }
        signals.remove(&id);
        self.shared.stats.lock().destroyed_signals.push(id);
        Ok(())
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut self.queues.get_mut().workers);
        for (_, worker) in workers {
            worker.stop();
        }
    }
}

impl Device for FakeDevice {
    fn create_queue(&self) -> Result<QueueId> {
        self.inject(FakeOp::CreateQueue)?;
        let mut queues = self.queues.lock();
        queues.next_id += 1;
        let id = QueueId(queues.next_id);
        let (sender, receiver) = mpsc::channel();
        let progress = Arc::new(Progress::default());
        let thread = {
            let shared = Arc::clone(&self.shared);
            let progress = Arc::clone(&progress);
            thread::Builder::new()
                .name(format!("fake_queue_{}", id.0))
                .spawn(move || run_queue(shared, progress, receiver))
                .map_err(|e| {
                    error!("failed to spawn fake queue thread: {}", e);
                    ERROR_QUEUE_STOPPED
                })?
        };
        queues.workers.insert(
            id,
            QueueWorker {
                sender,
                progress,
                thread,
            },
        );
        Ok(id)
    }

    fn destroy_queue(&self, queue: QueueId) -> Result<()> {
        self.inject(FakeOp::DestroyQueue)?;
        let worker = self
            .queues
            .lock()
            .workers
            .remove(&queue)
            .ok_or(ERROR_INVALID_HANDLE)?;
        worker.stop();
        self.shared.stats.lock().destroyed_queues.push(queue);
        Ok(())
    }

    fn synchronize(&self, queue: QueueId) -> Result<()> {
        self.inject(FakeOp::Synchronize)?;
        let progress = self
            .queues
            .lock()
            .workers
            .get(&queue)
            .map(|worker| Arc::clone(&worker.progress))
            .ok_or(ERROR_INVALID_HANDLE)?;
        let mut state = progress.cvar.wait_while(progress.state.lock(), |state| {
            state.completed < state.submitted && !state.stopped
        });
        if state.stopped {
            return Err(ERROR_QUEUE_STOPPED);
        }
        state.error.take().map_or(Ok(()), Err)
    }

    fn launch_kernel(&self, queue: QueueId, name: &str, args: &[u8]) -> Result<()> {
        self.inject(FakeOp::LaunchKernel)?;
        // Recorded first so the queue thread never retires a fetch that was not counted yet.
        let kernel = self.record_launch(name, args);
        let result = self.enqueue(
            queue,
            Command::Kernel {
                name: name.to_string(),
                args: args.to_vec(),
            },
        );
        if let (Err(_), Some(kernel)) = (result, kernel) {
            self.unrecord_launch(kernel);
        }
        result
    }

    fn launch_callback(&self, queue: QueueId, callback: HostCallback) -> Result<()> {
        self.inject(FakeOp::LaunchCallback)?;
        self.enqueue(queue, Command::Callback(callback))
    }

    fn create_notify(&self) -> Result<SignalId> {
        self.inject(FakeOp::CreateNotify)?;
        Ok(self.create_signal(Signal::Notify(Arc::new(Semaphore::new(0)))))
    }

    fn destroy_notify(&self, notify: SignalId) -> Result<()> {
        self.inject(FakeOp::DestroyNotify)?;
        self.destroy_signal(notify, true)
    }

    fn notify_wait(&self, queue: QueueId, notify: SignalId) -> Result<()> {
        self.inject(FakeOp::NotifyWait)?;
        let semaphore = self.notify(notify)?;
        self.enqueue(queue, Command::NotifyWait(semaphore))
    }

    fn create_event(&self) -> Result<SignalId> {
        self.inject(FakeOp::CreateEvent)?;
        Ok(self.create_signal(Signal::Event(Arc::new(Event::new()))))
    }

    fn destroy_event(&self, event: SignalId) -> Result<()> {
        self.inject(FakeOp::DestroyEvent)?;
        self.destroy_signal(event, false)
    }

    fn event_wait(&self, queue: QueueId, event: SignalId) -> Result<()> {
        self.inject(FakeOp::EventWait)?;
        let event = self.event(event)?;
        self.enqueue(queue, Command::EventWait(event))
    }

    fn event_reset(&self, queue: QueueId, event: SignalId) -> Result<()> {
        self.inject(FakeOp::EventReset)?;
        let event = self.event(event)?;
        self.enqueue(queue, Command::EventReset(event))
    }

    fn signal_hw_id(&self, signal: SignalId) -> Result<u32> {
        self.inject(FakeOp::SignalHwId)?;
        if !self.shared.signals.lock().contains_key(&signal) {
            return Err(ERROR_INVALID_HANDLE);
        }
        Ok(signal.0 + HW_ID_BASE)
    }

    fn alloc(&self, size: usize) -> Result<DeviceAddr> {
        self.inject(FakeOp::Alloc)?;
        Ok(self.shared.memory.lock().alloc(size))
    }

    fn free(&self, addr: DeviceAddr) -> Result<()> {
        self.inject(FakeOp::Free)?;
        self.shared
            .memory
            .lock()
            .blocks
            .remove(&addr.0)
            .map(|_| ())
            .ok_or(ERROR_INVALID_HANDLE)
    }

    fn copy_to_device(&self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
        self.inject(FakeOp::CopyToDevice)?;
        self.shared.memory.lock().write(dst, src)
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DeviceAddr) -> Result<()> {
        self.inject(FakeOp::CopyFromDevice)?;
        self.shared.memory.lock().read(src, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDescriptor;

    #[test]
    fn memory_is_bounds_checked() {
        let fake = FakeDevice::new(200);
        let addr = fake.alloc(8).unwrap();
        fake.copy_to_device(addr.offset(4), &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 8];
        fake.copy_from_device(&mut out, addr).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(
            fake.copy_to_device(addr.offset(6), &[0; 4]),
            Err(ERROR_BAD_ADDRESS)
        );
        assert_eq!(
            fake.copy_to_device(DeviceAddr::NULL, &[0]),
            Err(ERROR_BAD_ADDRESS)
        );
        fake.free(addr).unwrap();
        assert_eq!(fake.free(addr), Err(ERROR_INVALID_HANDLE));
        assert!(fake.live().is_empty());
    }

    #[test]
    fn nth_call_fails_once() {
        let fake = FakeDevice::new(200);
        fake.fail_nth(FakeOp::Alloc, 2);
        let first = fake.alloc(4).unwrap();
        assert_eq!(fake.alloc(4), Err(ERROR_INJECTED));
        let third = fake.alloc(4).unwrap();
        fake.free(first).unwrap();
        fake.free(third).unwrap();
    }

    #[test]
    fn queue_runs_version_kernel_and_reports_errors() {
        let fake = FakeDevice::new(100_002);
        let queue = fake.create_queue().unwrap();
        let addr = fake.alloc(4).unwrap();
        let task = TaskDescriptor::new(Kernel::GetVersion).operand(addr);
        fake.launch_kernel(queue, "GetVersion", &task.encode().unwrap())
            .unwrap();
        fake.synchronize(queue).unwrap();
        let mut version = [0u8; 4];
        fake.copy_from_device(&mut version, addr).unwrap();
        assert_eq!(u32::from_le_bytes(version), 100_002);

        fake.launch_kernel(queue, "NoSuchKernel", &task.encode().unwrap())
            .unwrap();
        assert_eq!(fake.synchronize(queue), Err(ERROR_BAD_KERNEL));
        // The error is reported once.
        fake.synchronize(queue).unwrap();

        fake.free(addr).unwrap();
        fake.destroy_queue(queue).unwrap();
        assert_eq!(fake.destroyed_queues(), vec![queue]);
        assert!(fake.live().is_empty());
    }

    #[test]
    fn notify_counts_and_event_latches() {
        let fake = FakeDevice::new(100);
        let queue = fake.create_queue().unwrap();
        let notify = fake.create_notify().unwrap();
        let hw_id = fake.signal_hw_id(notify).unwrap();
        fake.raise_signal(hw_id);
        fake.raise_signal(hw_id);
        fake.notify_wait(queue, notify).unwrap();
        fake.synchronize(queue).unwrap();
        assert!(fake.signal_is_raised(hw_id), "one post left");

        let event = fake.create_event().unwrap();
        let event_hw_id = fake.signal_hw_id(event).unwrap();
        fake.raise_signal(event_hw_id);
        fake.event_wait(queue, event).unwrap();
        fake.event_wait(queue, event).unwrap();
        fake.synchronize(queue).unwrap();
        assert!(fake.signal_is_raised(event_hw_id));
        fake.event_reset(queue, event).unwrap();
        fake.synchronize(queue).unwrap();
        assert!(!fake.signal_is_raised(event_hw_id));

        assert_eq!(fake.destroy_event(notify), Err(ERROR_INVALID_HANDLE));
        fake.destroy_notify(notify).unwrap();
        fake.destroy_event(event).unwrap();
        fake.destroy_queue(queue).unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn destroying_a_blocked_queue_stops_it() {
        let fake = FakeDevice::new(200);
        let queue = fake.create_queue().unwrap();
        let event = fake.create_event().unwrap();
        fake.event_wait(queue, event).unwrap();
        fake.destroy_queue(queue).unwrap();
        fake.destroy_event(event).unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn host_callbacks_run_in_queue_order() {
        let fake = FakeDevice::new(200);
        let queue = fake.create_queue().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            fake.launch_callback(queue, Box::new(move || tx.send(i).unwrap()))
                .unwrap();
        }
        fake.synchronize(queue).unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        fake.destroy_queue(queue).unwrap();
    }
}
