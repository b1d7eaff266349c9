// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Channel identity and lifecycle.
//!
//! Opening a channel acquires, in order, its completion signals, its long-lived execution
//! queues and its device memory, then runs the device "create channel" kernel on a transient
//! queue. Everything acquired is tracked by [`ChannelResources`], so an error at any step releases
//! exactly what was acquired before it, in reverse order. Closing mirrors this with the
//! "destroy channel" kernel and releases the same handles even when that kernel fails.

use std::fmt;
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::debug;
use base::error;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::config::TransformConfig;
use crate::config::VdecConfig;
use crate::config::VencConfig;
use crate::decoder::DecodedFrame;
use crate::decoder::VdecChannel;
use crate::device::Device;
use crate::device::DeviceAddr;
use crate::device::QueueId;
use crate::dispatch::CompletionDispatcher;
use crate::encoder::EncodedFrame;
use crate::encoder::VencChannel;
use crate::error::Error;
use crate::error::Result;
use crate::image::TransformChannel;
use crate::layout::TransformChannelRecord;
use crate::layout::VdecChannelRecord;
use crate::layout::VencChannelRecord;
use crate::resource::DeviceBuffer;
use crate::resource::TransientQueue;
use crate::signal::Capability;
use crate::signal::CapabilityProbe;
use crate::signal::CompletionSignal;
use crate::signal::SignalPair;
use crate::signal::SignalVariant;
use crate::task::Kernel;
use crate::task::TaskDescriptor;
use crate::task::TaskSubmitter;
use crate::validate::DefaultValidator;
use crate::validate::FormatValidator;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide channel index. Never reused while the process runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn allocate() -> ChannelId {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn index(self) -> u64 {
        self.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An open channel.
pub trait Channel {
    fn id(&self) -> ChannelId;

    /// Flushes outstanding work, destroys the device-side channel and releases every host-owned
    /// handle. Handles are released even when an earlier step fails; the first error is returned.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Closes `channel` if there is one. Closing nothing succeeds without touching the device.
pub fn close<C: Channel>(channel: Option<C>) -> Result<()> {
    match channel {
        Some(channel) => channel.close(),
        None => Ok(()),
    }
}

/// Signals and queues acquired for one channel, released in reverse order of acquisition.
pub(crate) struct ChannelResources {
    device: Arc<dyn Device>,
    signals: Vec<CompletionSignal>,
    queues: Vec<QueueId>,
}

impl ChannelResources {
    pub fn new(device: &Arc<dyn Device>) -> ChannelResources {
        ChannelResources {
            device: Arc::clone(device),
            signals: Vec::new(),
            queues: Vec::new(),
        }
    }

    pub fn create_signal(&mut self, variant: SignalVariant) -> Result<CompletionSignal> {
        let signal = CompletionSignal::create(self.device.as_ref(), variant)?;
        self.signals.push(signal);
        Ok(signal)
    }

    pub fn create_signal_pair(&mut self, variant: SignalVariant) -> Result<SignalPair> {
        let submit = self.create_signal(variant)?;
        let fetch = self.create_signal(variant)?;
        Ok(SignalPair { submit, fetch })
    }

    pub fn create_queue(&mut self) -> Result<QueueId> {
        let queue = self
            .device
            .create_queue()
            .map_err(|e| Error::Device("create_queue", e))?;
        self.queues.push(queue);
        Ok(queue)
    }

    /// Signals whose stale state must be cleared before the device first uses them.
    pub fn signals(&self) -> &[CompletionSignal] {
        &self.signals
    }

    /// Destroys every queue, then every signal, newest first. Keeps going past failures and
    /// returns the first one.
    pub fn release(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(queue) = self.queues.pop() {
            debug!("destroying queue {:?}", queue);
            if let Err(e) = self.device.destroy_queue(queue) {
                error!("failed to destroy queue {:?}: {}", queue, e);
                first_error.get_or_insert(Error::Device("destroy_queue", e));
            }
        }
        while let Some(signal) = self.signals.pop() {
            debug!("destroying signal {:?}", signal.id());
            if let Err(e) = signal.destroy(self.device.as_ref()) {
                error!("failed to destroy signal {:?}: {}", signal.id(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ChannelResources {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// A channel record whose device-written status decides whether a control kernel succeeded.
pub(crate) trait ChannelRecord: FromBytes + IntoBytes + Immutable {
    fn status(&self) -> u32;
}

impl ChannelRecord for TransformChannelRecord {
    fn status(&self) -> u32 {
        self.status
    }
}

impl ChannelRecord for VdecChannelRecord {
    fn status(&self) -> u32 {
        self.status
    }
}

impl ChannelRecord for VencChannelRecord {
    fn status(&self) -> u32 {
        self.status
    }
}

/// Reads the channel record back for the destroy kernel.
///
/// If the read fails the error goes into `first_error` and `opened`, the record as the device
/// accepted it at open, is used instead so the destroy still names this channel.
pub(crate) fn record_for_destroy<R: ChannelRecord + Copy>(
    id: ChannelId,
    record_buf: &DeviceBuffer,
    opened: &R,
    first_error: &mut Option<Error>,
) -> R {
    match record_buf.read::<R>() {
        Ok(record) => record,
        Err(e) => {
            error!(
                "channel {} failed to read back its record, using the one from open: {}",
                id, e
            );
            first_error.get_or_insert(e);
            *opened
        }
    }
}

/// Runs one create or destroy kernel on a transient queue.
///
/// `record` is copied to the device as operand 0, followed by `extra` operands, and copied back
/// once the queue drains. A non-zero status in the returned record is a device rejection.
pub(crate) fn run_control_task<R: ChannelRecord>(
    device: &Arc<dyn Device>,
    kernel: Kernel,
    signal: Option<&CompletionSignal>,
    stale: &[CompletionSignal],
    record_buf: &DeviceBuffer,
    record: &mut R,
    extra: &[DeviceAddr],
) -> Result<()> {
    let queue = TransientQueue::new(device)?;
    for stale_signal in stale {
        stale_signal.reset_stale(device.as_ref(), queue.id())?;
    }
    record_buf.write(record)?;
    let task = extra.iter().fold(
        TaskDescriptor::new(kernel).operand(record_buf.addr()),
        |task, addr| task.operand(*addr),
    );
    TaskSubmitter::new(device.as_ref(), queue.id(), signal).launch(&task)?;
    queue.synchronize()?;
    *record = record_buf.read::<R>()?;
    queue.release()?;
    match record.status() {
        0 => Ok(()),
        status => Err(Error::DeviceRejected {
            kernel: kernel.name(),
            status,
        }),
    }
}

/// Opens channels on one device.
///
/// The capability probe is injected so every channel opened through managers sharing it uses the
/// same signal variant. All channels opened here deliver completions on one dispatcher thread.
pub struct ChannelLifecycleManager {
    device: Arc<dyn Device>,
    probe: Arc<CapabilityProbe>,
    validator: Arc<dyn FormatValidator>,
    dispatcher: Arc<CompletionDispatcher>,
}

impl ChannelLifecycleManager {
    pub fn new(
        device: Arc<dyn Device>,
        probe: Arc<CapabilityProbe>,
    ) -> Result<ChannelLifecycleManager> {
        Ok(ChannelLifecycleManager {
            device,
            probe,
            validator: Arc::new(DefaultValidator),
            dispatcher: Arc::new(CompletionDispatcher::start("accel")?),
        })
    }

    /// Replaces the format rules used by channels opened afterwards.
    pub fn with_validator(mut self, validator: Arc<dyn FormatValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub(crate) fn validator(&self) -> &Arc<dyn FormatValidator> {
        &self.validator
    }

    pub(crate) fn dispatcher(&self) -> &Arc<CompletionDispatcher> {
        &self.dispatcher
    }

    pub(crate) fn capability(&self) -> Result<Capability> {
        self.probe.capability(&self.device)
    }

    /// The signal variant a new channel uses, or `None` if it runs without signals.
    ///
    /// Devices that complete decode and transform work on their own ignore the request for
    /// signals when `allow_signal_free` is set.
    pub(crate) fn signal_variant(
        &self,
        with_signal: bool,
        allow_signal_free: bool,
    ) -> Result<Option<SignalVariant>> {
        if !with_signal {
            return Ok(None);
        }
        let capability = self.capability()?;
        if allow_signal_free && capability.runs_signal_free() {
            debug!("device runs signal free, not creating signals");
            return Ok(None);
        }
        Ok(Some(capability.signal_variant()))
    }

    /// Opens a decode channel whose results are delivered to `callback`.
    pub fn open_decoder<U, F>(&self, config: &VdecConfig, callback: F) -> Result<VdecChannel<U>>
    where
        U: Send + 'static,
        F: FnMut(DecodedFrame<U>) + Send + 'static,
    {
        VdecChannel::open(self, config, Box::new(callback))
    }

    /// Opens an encode channel whose results are delivered to `callback`.
    pub fn open_encoder<U, F>(&self, config: &VencConfig, callback: F) -> Result<VencChannel<U>>
    where
        U: Send + 'static,
        F: FnMut(EncodedFrame<U>) + Send + 'static,
    {
        VencChannel::open(self, config, Box::new(callback))
    }

    pub fn open_transform(&self, config: &TransformConfig) -> Result<TransformChannel> {
        TransformChannel::open(self, config)
    }

    /// Closes `channel` if there is one.
    pub fn close<C: Channel>(&self, channel: Option<C>) -> Result<()> {
        close(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;
    use crate::device::fake::FakeOp;

    #[test]
    fn channel_ids_increase() {
        let a = ChannelId::allocate();
        let b = ChannelId::allocate();
        assert!(b.index() > a.index());
    }

    #[test]
    fn close_nothing_is_ok() {
        assert!(close::<TransformChannel>(None).is_ok());
    }

    #[test]
    fn resources_release_in_reverse_order() {
        let fake = FakeDevice::new(200);
        let device: Arc<dyn Device> = fake.clone();
        let mut resources = ChannelResources::new(&device);
        let pair = resources
            .create_signal_pair(SignalVariant::Notify)
            .unwrap();
        let first = resources.create_queue().unwrap();
        let second = resources.create_queue().unwrap();
        resources.release().unwrap();
        assert_eq!(
            fake.destroyed_queues(),
            vec![second, first],
            "queues are destroyed newest first"
        );
        assert_eq!(
            fake.destroyed_signals(),
            vec![pair.fetch.id(), pair.submit.id()]
        );
        assert!(fake.live().is_empty());
    }

    #[test]
    fn release_continues_past_failures() {
        let fake = FakeDevice::new(200);
        let device: Arc<dyn Device> = fake.clone();
        let mut resources = ChannelResources::new(&device);
        resources
            .create_signal_pair(SignalVariant::Event)
            .unwrap();
        resources.create_queue().unwrap();
        fake.fail_nth(FakeOp::DestroyQueue, 1);
        assert!(matches!(
            resources.release(),
            Err(Error::Device("destroy_queue", _))
        ));
        assert_eq!(fake.live().events, 0);
    }

    #[test]
    fn rejected_control_task_reports_status() {
        let fake = FakeDevice::new(200);
        let device: Arc<dyn Device> = fake.clone();
        fake.reject_kernel(Kernel::CreateChannel, 7);
        let mut record = TransformChannelRecord {
            mode: 1,
            signal: crate::layout::NO_SIGNAL,
            ..Default::default()
        };
        let record_buf = DeviceBuffer::with_value(&device, &record).unwrap();
        let result = run_control_task(
            &device,
            Kernel::CreateChannel,
            None,
            &[],
            &record_buf,
            &mut record,
            &[],
        );
        assert!(matches!(
            result,
            Err(Error::DeviceRejected {
                kernel: "CreateChannel",
                status: 7
            })
        ));
        assert_eq!(record.status, 7);
        drop(record_buf);
        assert!(fake.live().is_empty());
    }
}
