// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video decode channel.
//!
//! A decode channel owns two long-lived queues. The submit queue carries `VdecSendFrame` commands,
//! each followed by a wait on the submit signal so `send_frame` returns once the device accepted
//! the bitstream. The fetch queue carries at most one `VdecGetFrame` command at a time, followed by
//! a wait on the fetch signal and a host callback. The callback reads the result the device left
//! in the channel's share buffer, re-arms the fetch for the next queued frame and then hands the
//! decoded picture to the user callback on the completion dispatcher thread.
//!
//! End of stream is a sentinel frame with id 0 and no output. It is queued like any other frame,
//! so [`VdecChannel::drain`] returns only after every frame submitted before it was delivered.

pub mod frame_queue;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use base::debug;
use base::error;
use base::info;
use base::warn;
use sync::Mutex;
use sync::Promise;
use sync::Waitable;

use crate::channel::record_for_destroy;
use crate::channel::run_control_task;
use crate::channel::Channel;
use crate::channel::ChannelId;
use crate::channel::ChannelLifecycleManager;
use crate::channel::ChannelResources;
use crate::config::VdecConfig;
use crate::descriptor::PicDesc;
use crate::descriptor::StreamDesc;
use crate::device::Device;
use crate::device::DeviceAddr;
use crate::device::QueueId;
use crate::dispatch::CompletionDispatcher;
use crate::dispatch::DispatchHandle;
use crate::error::Error;
use crate::error::Result;
use crate::layout::DecodeResultRecord;
use crate::layout::VdecChannelRecord;
use crate::layout::NO_SIGNAL;
use crate::resource::DeviceBuffer;
use crate::signal::CompletionSignal;
use crate::signal::SignalPair;
use crate::task::Kernel;
use crate::task::TaskDescriptor;
use crate::task::TaskSubmitter;
use crate::validate::FormatValidator;
use crate::validate::Stage;

pub use self::frame_queue::FetchState;
pub use self::frame_queue::QueueSnapshot;
use self::frame_queue::Completed;
use self::frame_queue::FrameCallbackQueue;
use self::frame_queue::Pushed;
use self::frame_queue::EOS_FRAME_ID;

/// A decoded frame handed to the channel's callback.
pub struct DecodedFrame<U> {
    pub frame_id: u64,
    /// Device status for this frame. Zero on success.
    pub status: u32,
    pub input: Arc<StreamDesc>,
    /// The caller's output picture, updated with what the device decoded into it.
    pub output: Arc<PicDesc>,
    pub user_data: U,
}

pub type FrameCallback<U> = Box<dyn FnMut(DecodedFrame<U>) + Send + 'static>;

struct PendingFrame<U> {
    input: Arc<StreamDesc>,
    output: Arc<PicDesc>,
    user_data: U,
}

/// State shared between the submitting side and the completion path.
struct Completion<U> {
    id: ChannelId,
    device: Arc<dyn Device>,
    fetch_queue: QueueId,
    fetch_signal: Option<CompletionSignal>,
    record: DeviceAddr,
    result: DeviceBuffer,
    frames: FrameCallbackQueue<PendingFrame<U>>,
    eos: Mutex<Option<Promise>>,
    callback: Mutex<FrameCallback<U>>,
    dispatch: DispatchHandle,
    faulted: AtomicBool,
}

impl<U: Send + 'static> Completion<U> {
    /// Enqueues the fetch command, the fetch signal wait and the completion trigger.
    fn arm_fetch(self: &Arc<Self>) -> Result<()> {
        let task = TaskDescriptor::new(Kernel::VdecGetFrame)
            .operand(self.record)
            .operand(self.result.addr());
        TaskSubmitter::new(
            self.device.as_ref(),
            self.fetch_queue,
            self.fetch_signal.as_ref(),
        )
        .submit(&task)?;
        let completion = Arc::clone(self);
        self.device
            .launch_callback(
                self.fetch_queue,
                self.dispatch
                    .host_callback(move || completion.on_completion()),
            )
            .map_err(|e| Error::Device("launch_callback", e))
    }

    fn on_completion(self: &Arc<Self>) {
        let result = match self.result.read::<DecodeResultRecord>() {
            Ok(result) => result,
            Err(e) => {
                error!("channel {} failed to read decode result: {}", self.id, e);
                self.fault();
                self.frames.abandon();
                self.wake_drain();
                return;
            }
        };
        match self.frames.pop_on_completion(result.frame_id) {
            Completed::EndOfStream => {
                debug!("channel {} reached end of stream", self.id);
                self.wake_drain();
            }
            Completed::Frame { record, rearm } => {
                self.rearm(rearm);
                record.output.apply_record(&result.pic);
                let frame = DecodedFrame {
                    frame_id: result.frame_id,
                    status: result.status,
                    input: record.input,
                    output: record.output,
                    user_data: record.user_data,
                };
                let mut callback = self.callback.lock();
                (*callback)(frame);
            }
            Completed::Unknown { rearm } => {
                error!(
                    "{}",
                    Error::UnknownFrame {
                        channel: self.id,
                        frame_id: result.frame_id,
                    }
                );
                self.rearm(rearm);
            }
        }
    }

    fn rearm(self: &Arc<Self>, next: Option<u64>) {
        let Some(next) = next else {
            return;
        };
        if let Err(e) = self.arm_fetch() {
            error!(
                "channel {} failed to arm fetch for frame {}: {}",
                self.id, next, e
            );
            self.fault();
            let dropped = self.frames.abandon();
            if !dropped.is_empty() {
                warn!(
                    "channel {} dropped {} queued frames",
                    self.id,
                    dropped.len()
                );
            }
            self.wake_drain();
        }
    }

    fn wake_drain(&self) {
        if let Some(promise) = self.eos.lock().take() {
            promise.signal();
        }
    }

    fn fault(&self) {
        if !self.faulted.swap(true, Ordering::SeqCst) {
            warn!("decode channel {} is now faulted", self.id);
        }
    }

    fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }
}

/// An open video decode channel.
pub struct VdecChannel<U: Send + 'static> {
    id: ChannelId,
    // Declared first so queues are destroyed before the buffers they reference are freed.
    resources: ChannelResources,
    device: Arc<dyn Device>,
    hw_channel: u32,
    submit_queue: QueueId,
    signals: Option<SignalPair>,
    record: DeviceBuffer,
    opened: VdecChannelRecord,
    eos_timeout: Option<Duration>,
    validator: Arc<dyn FormatValidator>,
    completion: Arc<Completion<U>>,
    _dispatcher: Arc<CompletionDispatcher>,
}

impl<U: Send + 'static> VdecChannel<U> {
    pub(crate) fn open(
        manager: &ChannelLifecycleManager,
        config: &VdecConfig,
        callback: FrameCallback<U>,
    ) -> Result<VdecChannel<U>> {
        config.validate()?;
        manager
            .validator()
            .check_format(Stage::DecodeOutput, config.out_format)?;
        let device = manager.device();
        let variant = manager.signal_variant(config.with_signal, true)?;

        let mut resources = ChannelResources::new(device);
        let signals = match variant {
            Some(variant) => Some(resources.create_signal_pair(variant)?),
            None => None,
        };
        let submit_queue = resources.create_queue()?;
        let fetch_queue = resources.create_queue()?;

        let mut record = VdecChannelRecord {
            hw_channel: config.hw_channel,
            codec: config.codec as u32,
            out_format: config.out_format as u32,
            out_width: config.out_width,
            out_height: config.out_height,
            ref_frames: config.ref_frames,
            submit_signal: signals.map_or(NO_SIGNAL, |s| s.submit.hw_id()),
            fetch_signal: signals.map_or(NO_SIGNAL, |s| s.fetch.hw_id()),
            status: 0,
            reserved: 0,
        };
        let record_buf = DeviceBuffer::with_value(device, &record)?;
        let result = DeviceBuffer::with_value(device, &DecodeResultRecord::default())?;
        run_control_task(
            device,
            Kernel::CreateVdecChannel,
            signals.as_ref().map(|s| &s.submit),
            resources.signals(),
            &record_buf,
            &mut record,
            &[result.addr()],
        )?;

        let id = ChannelId::allocate();
        info!(
            "opened decode channel {} on hardware channel {} ({} signals)",
            id,
            config.hw_channel,
            match variant {
                Some(variant) => format!("{:?}", variant),
                None => "no".to_string(),
            }
        );
        let completion = Arc::new(Completion {
            id,
            device: Arc::clone(device),
            fetch_queue,
            fetch_signal: signals.map(|s| s.fetch),
            record: record_buf.addr(),
            result,
            frames: FrameCallbackQueue::new(),
            eos: Mutex::new(None),
            callback: Mutex::new(callback),
            dispatch: manager.dispatcher().handle(),
            faulted: AtomicBool::new(false),
        });
        Ok(VdecChannel {
            id,
            resources,
            device: Arc::clone(device),
            hw_channel: config.hw_channel,
            submit_queue,
            signals,
            record: record_buf,
            opened: record,
            eos_timeout: config.eos_timeout(),
            validator: Arc::clone(manager.validator()),
            completion,
            _dispatcher: Arc::clone(manager.dispatcher()),
        })
    }

    pub fn hw_channel(&self) -> u32 {
        self.hw_channel
    }

    pub fn is_faulted(&self) -> bool {
        self.completion.is_faulted()
    }

    /// Id of the last frame submitted since open or the last drain (0 if none).
    pub fn frame_counter(&self) -> u64 {
        self.completion.frames.last_frame_id()
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.completion.frames.snapshot()
    }

    /// Submits one bitstream chunk for decoding into `output`.
    ///
    /// Returns the frame id once the device accepted the input. The decoded picture is delivered
    /// to the channel callback later, in submission order. Calls on one channel must not overlap.
    pub fn send_frame(
        &self,
        input: Arc<StreamDesc>,
        output: Arc<PicDesc>,
        user_data: U,
    ) -> Result<u64> {
        self.check_usable()?;
        if input.is_eos() {
            return Err(Error::InvalidArgument(
                "end of stream is sent with drain".to_string(),
            ));
        }
        self.validator
            .check_format(Stage::DecodeOutput, output.info().format)?;
        input.copy_to_device()?;
        output.copy_to_device()?;

        let frame_id = self.completion.frames.next_frame_id();
        self.launch_send(frame_id, input.addr(), Some(output.addr()))?;
        let pushed = self.completion.frames.push_frame(
            frame_id,
            PendingFrame {
                input,
                output,
                user_data,
            },
        );
        self.arm_if_needed(pushed, frame_id)?;
        self.synchronize_submit()?;
        debug!("channel {} submitted frame {}", self.id, frame_id);
        Ok(frame_id)
    }

    /// Waits until every frame sent so far has been delivered, then resets the channel to its
    /// idle state with the frame counter back at zero.
    ///
    /// Blocks without limit unless the channel was opened with an end-of-stream timeout.
    pub fn drain(&self) -> Result<()> {
        self.check_usable()?;
        let eos = StreamDesc::end_of_stream(&self.device)?;
        eos.copy_to_device()?;

        let (promise, waitable) = sync::create_promise_and_waitable();
        *self.completion.eos.lock() = Some(promise);
        if let Err(e) = self.send_end_of_stream(&eos) {
            self.completion.eos.lock().take();
            return Err(e);
        }
        self.wait_end_of_stream(waitable)?;

        let (stale_fifo, stale_records) = self.completion.frames.reset();
        if stale_fifo != 0 || stale_records != 0 {
            warn!(
                "channel {} dropped {} queued and {} unfinished frames at end of stream",
                self.id, stale_fifo, stale_records
            );
        }
        debug!("channel {} drained", self.id);
        Ok(())
    }

    fn send_end_of_stream(&self, eos: &StreamDesc) -> Result<()> {
        self.launch_send(EOS_FRAME_ID, eos.addr(), None)?;
        let pushed = self.completion.frames.push_end_of_stream();
        self.arm_if_needed(pushed, EOS_FRAME_ID)?;
        self.synchronize_submit()
    }

    fn wait_end_of_stream(&self, waitable: Waitable) -> Result<()> {
        if waitable.wait(self.eos_timeout).timed_out() {
            self.completion.eos.lock().take();
            error!("channel {} timed out waiting for end of stream", self.id);
            self.completion.fault();
            return Err(Error::EosTimeout(self.id));
        }
        self.check_usable()
    }

    fn launch_send(
        &self,
        frame_id: u64,
        input: DeviceAddr,
        output: Option<DeviceAddr>,
    ) -> Result<()> {
        let task = TaskDescriptor::new(Kernel::VdecSendFrame)
            .operand(self.record.addr())
            .operand(input)
            .operand(output)
            .inline(&frame_id);
        let submitter = TaskSubmitter::new(
            self.device.as_ref(),
            self.submit_queue,
            self.signals.as_ref().map(|s| &s.submit),
        );
        submitter.launch(&task)?;
        submitter.await_accept().map_err(|e| self.fault_with(e))
    }

    fn arm_if_needed(&self, pushed: Pushed, frame_id: u64) -> Result<()> {
        if pushed == Pushed::Queued {
            return Ok(());
        }
        self.completion.arm_fetch().map_err(|e| {
            self.completion.frames.cancel_arm(frame_id);
            self.fault_with(e)
        })
    }

    fn synchronize_submit(&self) -> Result<()> {
        self.device
            .synchronize(self.submit_queue)
            .map_err(|e| self.fault_with(Error::Device("synchronize", e)))
    }

    fn fault_with(&self, e: Error) -> Error {
        error!("channel {}: {}", self.id, e);
        self.completion.fault();
        e
    }

    fn check_usable(&self) -> Result<()> {
        if self.completion.is_faulted() {
            return Err(Error::ChannelFaulted(self.id));
        }
        Ok(())
    }
}

impl<U: Send + 'static> Channel for VdecChannel<U> {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn close(mut self) -> Result<()> {
        let mut first_error = None;
        if !self.is_faulted() {
            if let Err(e) = self.drain() {
                error!("channel {} failed to drain before close: {}", self.id, e);
                first_error.get_or_insert(e);
            }
        }
        // A faulted fetch queue may never finish; destroying it drops what is left.
        if !self.is_faulted() {
            if let Err(e) = self.device.synchronize(self.completion.fetch_queue) {
                error!("channel {} failed to flush fetch queue: {}", self.id, e);
                first_error.get_or_insert(Error::Device("synchronize", e));
            }
        }
        let mut record = record_for_destroy(self.id, &self.record, &self.opened, &mut first_error);
        if let Err(e) = run_control_task(
            &self.device,
            Kernel::DestroyVdecChannel,
            self.signals.as_ref().map(|s| &s.submit),
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
        info!("closed decode channel {}", self.id);
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::channel::close;
    use crate::descriptor::PicInfo;
    use crate::descriptor::PixelFormat;
    use crate::descriptor::StreamInfo;
    use crate::device::fake::FakeDevice;
    use crate::device::fake::FakeOp;
    use crate::device::fake::LiveResources;
    use crate::signal::Capability;
    use crate::signal::CapabilityProbe;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn manager(fake: &Arc<FakeDevice>, version: u32) -> ChannelLifecycleManager {
        let device: Arc<dyn Device> = fake.clone();
        let probe = CapabilityProbe::with_capability(Capability::parse(version).unwrap());
        ChannelLifecycleManager::new(device, Arc::new(probe)).unwrap()
    }

    fn config() -> VdecConfig {
        VdecConfig {
            hw_channel: 3,
            out_width: 64,
            out_height: 48,
            ..Default::default()
        }
    }

    fn buffers(device: &Arc<dyn Device>) -> (Arc<StreamDesc>, Arc<PicDesc>) {
        let input = StreamDesc::new(
            device,
            StreamInfo {
                size: 1024,
                ..Default::default()
            },
        )
        .unwrap();
        let output = PicDesc::new(
            device,
            PicInfo {
                format: PixelFormat::Nv12,
                ..Default::default()
            },
        )
        .unwrap();
        (Arc::new(input), Arc::new(output))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while !condition() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn open(
        manager: &ChannelLifecycleManager,
        config: &VdecConfig,
    ) -> (VdecChannel<u64>, mpsc::Receiver<(u64, u64, u32)>) {
        let (tx, rx) = mpsc::channel();
        let channel = manager
            .open_decoder(config, move |frame: DecodedFrame<u64>| {
                let width = frame.output.info().width;
                tx.send((frame.frame_id, frame.user_data, width)).unwrap();
            })
            .unwrap();
        (channel, rx)
    }

    #[test]
    fn frames_arrive_in_order_and_drain_resets() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let (channel, rx) = open(&manager, &config());
        for i in 1..=20u64 {
            let (input, output) = buffers(manager.device());
            assert_eq!(channel.send_frame(input, output, i * 10).unwrap(), i);
        }
        channel.drain().unwrap();
        let delivered: Vec<(u64, u64, u32)> = rx.try_iter().collect();
        assert_eq!(delivered.len(), 20, "every frame lands before drain returns");
        for (i, (frame_id, user_data, width)) in delivered.into_iter().enumerate() {
            assert_eq!(frame_id, i as u64 + 1);
            assert_eq!(user_data, frame_id * 10);
            assert_eq!(width, 64);
        }
        assert_eq!(channel.frame_counter(), 0);
        assert_eq!(fake.max_outstanding_fetches(), 1);
        channel.close().unwrap();
        assert_eq!(fake.live(), LiveResources::default());
    }

    #[test]
    fn fetch_pipeline_walkthrough() {
        let fake = FakeDevice::new(200);
        fake.set_manual_decode(true);
        let manager = manager(&fake, 200);
        let config = config();
        let (channel, rx) = open(&manager, &config);

        for expected in 1..=3u64 {
            let (input, output) = buffers(manager.device());
            assert_eq!(channel.send_frame(input, output, expected).unwrap(), expected);
        }
        assert_eq!(
            channel.queue_snapshot(),
            QueueSnapshot {
                state: FetchState::Armed,
                pending: vec![2, 3],
                records: 3,
            }
        );

        assert!(fake.complete_next_frame(config.hw_channel));
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().0, 1);
        assert_eq!(channel.queue_snapshot().pending, vec![3]);
        assert_eq!(channel.queue_snapshot().state, FetchState::Armed);

        assert!(fake.complete_next_frame(config.hw_channel));
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().0, 2);
        assert!(channel.queue_snapshot().pending.is_empty());
        assert_eq!(channel.queue_snapshot().state, FetchState::Armed);

        assert!(fake.complete_next_frame(config.hw_channel));
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().0, 3);
        assert_eq!(channel.queue_snapshot().state, FetchState::Idle);
        assert_eq!(channel.queue_snapshot().records, 0);

        let completer = {
            let fake = fake.clone();
            let hw_channel = config.hw_channel;
            thread::spawn(move || {
                assert!(fake.wait_for_decoding(hw_channel, 1, TIMEOUT));
                assert!(fake.complete_next_frame(hw_channel));
            })
        };
        channel.drain().unwrap();
        completer.join().unwrap();

        assert!(rx.try_recv().is_err(), "no callback for end of stream");
        assert_eq!(
            channel.queue_snapshot(),
            QueueSnapshot {
                state: FetchState::Idle,
                pending: Vec::new(),
                records: 0,
            }
        );
        assert_eq!(channel.frame_counter(), 0);
        channel.close().unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn drain_waits_for_queued_frames() {
        let fake = FakeDevice::new(200);
        fake.set_manual_decode(true);
        let manager = manager(&fake, 200);
        let config = config();
        let (channel, rx) = open(&manager, &config);
        for i in 1..=4u64 {
            let (input, output) = buffers(manager.device());
            channel.send_frame(input, output, i).unwrap();
        }
        let completer = {
            let fake = fake.clone();
            thread::spawn(move || {
                // Four frames and the sentinel.
                assert!(fake.wait_for_decoding(config.hw_channel, 5, TIMEOUT));
                for _ in 0..5 {
                    assert!(fake.complete_next_frame(config.hw_channel));
                }
            })
        };
        channel.drain().unwrap();
        completer.join().unwrap();
        let ids: Vec<u64> = rx.try_iter().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        channel.close().unwrap();
    }

    #[test]
    fn drain_on_idle_channel_still_round_trips() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let (channel, _rx) = open(&manager, &config());
        channel.drain().unwrap();
        channel.drain().unwrap();
        assert_eq!(fake.kernel_launches(Kernel::VdecSendFrame), 2);
        channel.close().unwrap();
        assert_eq!(fake.kernel_launches(Kernel::VdecSendFrame), 3);
    }

    #[test]
    fn signal_free_channel_uses_plain_kernels() {
        let fake = FakeDevice::new(100_003);
        let manager = manager(&fake, 100_003);
        let (channel, rx) = open(&manager, &config());
        for i in 1..=3u64 {
            let (input, output) = buffers(manager.device());
            channel.send_frame(input, output, i).unwrap();
        }
        channel.drain().unwrap();
        assert_eq!(rx.try_iter().count(), 3);
        assert_eq!(fake.live().notifies, 0);
        assert_eq!(fake.live().events, 0);
        channel.close().unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn notify_channel_decodes() {
        let fake = FakeDevice::new(100);
        let manager = manager(&fake, 100);
        let (channel, rx) = open(&manager, &config());
        assert_eq!(fake.live().notifies, 2);
        for i in 1..=5u64 {
            let (input, output) = buffers(manager.device());
            channel.send_frame(input, output, i).unwrap();
        }
        channel.drain().unwrap();
        assert_eq!(rx.try_iter().count(), 5);
        channel.close().unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn open_unwinds_every_step() {
        let steps = [
            (FakeOp::CreateEvent, 1),
            (FakeOp::CreateEvent, 2),
            (FakeOp::SignalHwId, 2),
            (FakeOp::CreateQueue, 1),
            (FakeOp::CreateQueue, 2),
            (FakeOp::CreateQueue, 3),
            (FakeOp::Alloc, 1),
            (FakeOp::Alloc, 2),
            (FakeOp::EventReset, 1),
            (FakeOp::EventReset, 2),
            (FakeOp::CopyToDevice, 3),
            (FakeOp::LaunchKernel, 1),
            (FakeOp::Synchronize, 1),
            (FakeOp::CopyFromDevice, 1),
        ];
        for (op, nth) in steps {
            let fake = FakeDevice::new(200);
            let manager = manager(&fake, 200);
            fake.fail_nth(op, nth);
            let result = manager.open_decoder(&config(), |_: DecodedFrame<()>| {});
            assert!(result.is_err(), "{:?} #{} should fail open", op, nth);
            assert!(
                fake.live().is_empty(),
                "{:?} #{} leaked {:?}",
                op,
                nth,
                fake.live()
            );
        }
    }

    #[test]
    fn rejected_open_is_internal_error() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        fake.reject_kernel(Kernel::CreateVdecChannel, 5);
        let result = manager.open_decoder(&config(), |_: DecodedFrame<()>| {});
        assert!(matches!(
            result,
            Err(Error::DeviceRejected {
                kernel: "CreateVdecChannel",
                status: 5
            })
        ));
        assert!(fake.live().is_empty());
    }

    #[test]
    fn busy_hardware_channel_is_rejected() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let (first, _rx) = open(&manager, &config());
        let second = manager.open_decoder(&config(), |_: DecodedFrame<()>| {});
        assert!(matches!(second, Err(Error::DeviceRejected { .. })));
        first.close().unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn failed_reset_faults_channel() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let (channel, _rx) = open(&manager, &config());
        fake.fail_nth(FakeOp::EventReset, 1);
        let (input, output) = buffers(manager.device());
        assert!(matches!(
            channel.send_frame(input, output, 1),
            Err(Error::Device("event_reset", _))
        ));
        assert!(channel.is_faulted());
        let (input, output) = buffers(manager.device());
        assert!(matches!(
            channel.send_frame(input, output, 2),
            Err(Error::ChannelFaulted(_))
        ));
        assert!(matches!(channel.drain(), Err(Error::ChannelFaulted(_))));
        channel.close().unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn failed_launch_leaves_channel_usable() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let (channel, rx) = open(&manager, &config());
        fake.fail_nth(FakeOp::LaunchKernel, 1);
        let (input, output) = buffers(manager.device());
        assert!(channel.send_frame(input, output, 1).is_err());
        assert!(!channel.is_faulted());
        assert_eq!(channel.queue_snapshot().records, 0);
        let (input, output) = buffers(manager.device());
        channel.send_frame(input, output, 2).unwrap();
        channel.drain().unwrap();
        let delivered: Vec<u64> = rx.try_iter().map(|(_, data, _)| data).collect();
        assert_eq!(delivered, vec![2]);
        channel.close().unwrap();
    }

    #[test]
    fn unknown_frame_id_is_dropped_and_pipeline_advances() {
        let fake = FakeDevice::new(200);
        fake.set_manual_decode(true);
        let manager = manager(&fake, 200);
        let config = config();
        let (channel, rx) = open(&manager, &config);
        for i in 1..=3u64 {
            let (input, output) = buffers(manager.device());
            channel.send_frame(input, output, i).unwrap();
        }

        fake.misreport_next_frame(999);
        for _ in 0..3 {
            assert!(fake.complete_next_frame(config.hw_channel));
        }
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().0, 2);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().0, 3);
        assert!(!channel.is_faulted());
        assert_eq!(
            channel.queue_snapshot(),
            QueueSnapshot {
                state: FetchState::Idle,
                pending: Vec::new(),
                // Frame 1 was never reported back.
                records: 1,
            }
        );

        let completer = {
            let fake = fake.clone();
            thread::spawn(move || {
                assert!(fake.wait_for_decoding(config.hw_channel, 1, TIMEOUT));
                assert!(fake.complete_next_frame(config.hw_channel));
            })
        };
        channel.drain().unwrap();
        completer.join().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(channel.queue_snapshot().records, 0);
        assert_eq!(channel.frame_counter(), 0);
        fake.set_manual_decode(false);
        channel.close().unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn failed_rearm_faults_channel_and_wakes_drain() {
        let fake = FakeDevice::new(200);
        fake.set_manual_decode(true);
        let manager = manager(&fake, 200);
        let config = config();
        let (channel, rx) = open(&manager, &config);
        for i in 1..=3u64 {
            let (input, output) = buffers(manager.device());
            channel.send_frame(input, output, i).unwrap();
        }

        thread::scope(|s| {
            let drainer = s.spawn(|| channel.drain());
            // Drain is waiting once the sentinel is queued and reached the device.
            assert!(wait_until(|| channel.queue_snapshot().pending == vec![2, 3, 0]));
            assert!(fake.wait_for_decoding(config.hw_channel, 4, TIMEOUT));
            fake.fail_nth(FakeOp::LaunchKernel, 1);
            assert!(fake.complete_next_frame(config.hw_channel));
            assert!(matches!(
                drainer.join().unwrap(),
                Err(Error::ChannelFaulted(_))
            ));
        });

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().0, 1);
        assert!(channel.is_faulted());
        let snapshot = channel.queue_snapshot();
        assert_eq!(snapshot.state, FetchState::Idle);
        assert!(snapshot.pending.is_empty());
        let (input, output) = buffers(manager.device());
        assert!(matches!(
            channel.send_frame(input, output, 4),
            Err(Error::ChannelFaulted(_))
        ));
        channel.close().unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn close_destroys_with_open_record_when_read_back_fails() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let config = config();
        let (channel, _rx) = open(&manager, &config);
        // The first read is the end-of-stream result during the drain in close.
        fake.fail_nth(FakeOp::CopyFromDevice, 2);
        assert!(matches!(
            channel.close(),
            Err(Error::Device("copy_from_device", _))
        ));
        assert_eq!(fake.open_channels(), 0);
        assert!(fake.live().is_empty());

        // The hardware channel was really released.
        let (channel, _rx) = open(&manager, &config);
        channel.close().unwrap();
    }

    #[test]
    fn drain_timeout_faults_channel() {
        let fake = FakeDevice::new(200);
        fake.set_manual_decode(true);
        let manager = manager(&fake, 200);
        let config = VdecConfig {
            eos_timeout_ms: Some(50),
            ..config()
        };
        let (channel, _rx) = open(&manager, &config);
        assert!(matches!(channel.drain(), Err(Error::EosTimeout(_))));
        assert!(channel.is_faulted());
        channel.close().unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn eos_input_is_rejected() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let (channel, _rx) = open(&manager, &config());
        let input = Arc::new(StreamDesc::end_of_stream(manager.device()).unwrap());
        let (_, output) = buffers(manager.device());
        assert!(matches!(
            channel.send_frame(input, output, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(close(Some(channel)).is_ok());
    }

    #[test]
    fn unsupported_output_format_is_rejected_unchanged() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let config = VdecConfig {
            out_format: PixelFormat::Rgb888,
            ..config()
        };
        let result = manager.open_decoder(&config, |_: DecodedFrame<()>| {});
        assert!(matches!(
            result,
            Err(Error::Validation(
                crate::validate::ValidationError::UnsupportedFormat {
                    stage: Stage::DecodeOutput,
                    format: PixelFormat::Rgb888,
                }
            ))
        ));
        assert_eq!(fake.live(), LiveResources::default());
    }
}
