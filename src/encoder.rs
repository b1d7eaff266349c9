// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video encode channel.
//!
//! Unlike decoding, every encoded frame gets its own fetch sequence on the fetch queue: a wait on
//! the fetch signal, the completion trigger and a `VencReleaseFrame` command that hands the output
//! slot back to the device. The device raises the fetch signal once per frame, after the previous
//! frame was released, so the fetch queue consumes results in submission order.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::debug;
use base::error;
use base::info;
use base::warn;
use sync::Mutex;

use crate::channel::record_for_destroy;
use crate::channel::run_control_task;
use crate::channel::Channel;
use crate::channel::ChannelId;
use crate::channel::ChannelLifecycleManager;
use crate::channel::ChannelResources;
use crate::config::VencConfig;
use crate::descriptor::PicDesc;
use crate::descriptor::StreamDesc;
use crate::descriptor::StreamInfo;
use crate::device::Device;
use crate::device::QueueId;
use crate::dispatch::CompletionDispatcher;
use crate::dispatch::DispatchHandle;
use crate::error::Error;
use crate::error::Result;
use crate::layout::VencChannelRecord;
use crate::layout::VencFrameConfig;
use crate::layout::VencReleaseConfig;
use crate::resource::DeviceBuffer;
use crate::signal::SignalPair;
use crate::task::Kernel;
use crate::task::TaskDescriptor;
use crate::task::TaskSubmitter;
use crate::validate::FormatValidator;
use crate::validate::Stage;

/// Output memory owned by the device and recycled on release.
const MEM_MODE_DEVICE: u8 = 0;

/// An encoded frame handed to the channel's callback.
pub struct EncodedFrame<U> {
    /// Submission sequence number, starting at 1.
    pub token: u64,
    pub input: Arc<PicDesc>,
    /// The bitstream the device produced, with its size and status filled in.
    pub output: Arc<StreamDesc>,
    pub status: u32,
    pub user_data: U,
}

pub type EncodeCallback<U> = Box<dyn FnMut(EncodedFrame<U>) + Send + 'static>;

struct PendingEncode<U> {
    input: Arc<PicDesc>,
    output: Arc<StreamDesc>,
    user_data: U,
}

struct Completion<U> {
    id: ChannelId,
    pending: Mutex<BTreeMap<u64, PendingEncode<U>>>,
    callback: Mutex<EncodeCallback<U>>,
}

impl<U: Send + 'static> Completion<U> {
    fn on_encoded(&self, token: u64) {
        let Some(pending) = self.pending.lock().remove(&token) else {
            error!("channel {} got a result for unknown encode {}", self.id, token);
            return;
        };
        if let Err(e) = pending.output.copy_from_device() {
            error!(
                "channel {} failed to read encode {} result: {}",
                self.id, token, e
            );
            return;
        }
        let frame = EncodedFrame {
            token,
            status: pending.output.info().status,
            input: pending.input,
            output: pending.output,
            user_data: pending.user_data,
        };
        let mut callback = self.callback.lock();
        (*callback)(frame);
    }
}

/// An open video encode channel.
pub struct VencChannel<U: Send + 'static> {
    id: ChannelId,
    resources: ChannelResources,
    device: Arc<dyn Device>,
    config: VencConfig,
    submit_queue: QueueId,
    fetch_queue: QueueId,
    signals: SignalPair,
    record: DeviceBuffer,
    opened: VencChannelRecord,
    next_token: AtomicU64,
    faulted: AtomicBool,
    validator: Arc<dyn FormatValidator>,
    completion: Arc<Completion<U>>,
    dispatch: DispatchHandle,
    _dispatcher: Arc<CompletionDispatcher>,
}

impl<U: Send + 'static> VencChannel<U> {
    pub(crate) fn open(
        manager: &ChannelLifecycleManager,
        config: &VencConfig,
        callback: EncodeCallback<U>,
    ) -> Result<VencChannel<U>> {
        config.validate()?;
        manager
            .validator()
            .check_format(Stage::EncodeInput, config.pic_format)?;
        let device = manager.device();
        let variant = manager
            .signal_variant(true, false)?
            .ok_or(Error::Internal("encode channels always use signals"))?;

        let mut resources = ChannelResources::new(device);
        let signals = resources.create_signal_pair(variant)?;
        let submit_queue = resources.create_queue()?;
        let fetch_queue = resources.create_queue()?;

        let mut record = VencChannelRecord {
            codec: config.codec as u32,
            pic_format: config.pic_format as u32,
            width: config.width,
            height: config.height,
            rc_mode: config.rate_control as u32,
            src_rate: config.src_rate,
            max_bit_rate: config.max_bit_rate,
            ip_prop: config.ip_prop,
            submit_signal: signals.submit.hw_id(),
            fetch_signal: signals.fetch.hw_id(),
            status: 0,
            reserved: 0,
        };
        let record_buf = DeviceBuffer::with_value(device, &record)?;
        run_control_task(
            device,
            Kernel::CreateVencChannel,
            Some(&signals.submit),
            resources.signals(),
            &record_buf,
            &mut record,
            &[],
        )?;

        let id = ChannelId::allocate();
        info!(
            "opened encode channel {} ({:?} {}x{})",
            id, config.codec, config.width, config.height
        );
        Ok(VencChannel {
            id,
            resources,
            device: Arc::clone(device),
            config: config.clone(),
            submit_queue,
            fetch_queue,
            signals,
            record: record_buf,
            opened: record,
            next_token: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
            validator: Arc::clone(manager.validator()),
            completion: Arc::new(Completion {
                id,
                pending: Mutex::new(BTreeMap::new()),
                callback: Mutex::new(callback),
            }),
            dispatch: manager.dispatcher().handle(),
            _dispatcher: Arc::clone(manager.dispatcher()),
        })
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Encodes produced so far whose callbacks have not run yet.
    pub fn pending(&self) -> usize {
        self.completion.pending.lock().len()
    }

    /// Submits one picture for encoding. Returns its token once the device accepted it; the
    /// bitstream is delivered to the channel callback later.
    pub fn send_frame(&self, input: Arc<PicDesc>, force_idr: bool, user_data: U) -> Result<u64> {
        self.check_usable()?;
        let info = input.info();
        self.validator.check_encode_input(
            info.format,
            self.config.width,
            self.config.height,
            info.size,
        )?;
        input.copy_to_device()?;
        let output = Arc::new(StreamDesc::new(
            &self.device,
            StreamInfo {
                format: self.config.codec,
                ..Default::default()
            },
        )?);

        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let send = TaskDescriptor::new(Kernel::VencSendFrame)
            .operand(self.record.addr())
            .operand(input.addr())
            .operand(output.addr())
            .inline(&VencFrameConfig {
                eos: 0,
                force_idr: force_idr.into(),
                reserved: [0; 2],
            });
        self.completion.pending.lock().insert(
            token,
            PendingEncode {
                input,
                output,
                user_data,
            },
        );
        let submitter = self.submitter();
        if let Err(e) = submitter.launch(&send) {
            self.completion.pending.lock().remove(&token);
            return Err(e);
        }
        submitter.await_accept().map_err(|e| self.fault_with(e))?;
        self.arm_fetch(token).map_err(|e| self.fault_with(e))?;
        self.device
            .synchronize(self.submit_queue)
            .map_err(|e| self.fault_with(Error::Device("synchronize", e)))?;
        debug!("channel {} submitted encode {}", self.id, token);
        Ok(token)
    }

    /// Flushes the encoder: every frame sent so far has been delivered when this returns.
    pub fn send_eos(&self) -> Result<()> {
        self.check_usable()?;
        let eos = TaskDescriptor::new(Kernel::VencSendFrame)
            .operand(self.record.addr())
            .operand(None)
            .operand(None)
            .inline(&VencFrameConfig {
                eos: 1,
                force_idr: 0,
                reserved: [0; 2],
            });
        self.submitter().submit(&eos).map_err(|e| self.fault_with(e))?;
        self.device
            .synchronize(self.submit_queue)
            .map_err(|e| self.fault_with(Error::Device("synchronize", e)))?;
        self.device
            .synchronize(self.fetch_queue)
            .map_err(|e| self.fault_with(Error::Device("synchronize", e)))?;
        let leftover = self.pending();
        if leftover != 0 {
            warn!(
                "channel {} flushed with {} encodes undelivered",
                self.id, leftover
            );
        }
        Ok(())
    }

    fn submitter(&self) -> TaskSubmitter<'_> {
        TaskSubmitter::new(
            self.device.as_ref(),
            self.submit_queue,
            Some(&self.signals.submit),
        )
    }

    fn arm_fetch(&self, token: u64) -> Result<()> {
        self.signals
            .fetch
            .wait_then_maybe_reset(self.device.as_ref(), self.fetch_queue)?;
        let completion = Arc::clone(&self.completion);
        self.device
            .launch_callback(
                self.fetch_queue,
                self.dispatch
                    .host_callback(move || completion.on_encoded(token)),
            )
            .map_err(|e| Error::Device("launch_callback", e))?;
        let release = TaskDescriptor::new(Kernel::VencReleaseFrame)
            .operand(self.record.addr())
            .inline(&VencReleaseConfig {
                mem_mode: MEM_MODE_DEVICE,
                reserved: [0; 3],
            });
        TaskSubmitter::new(
            self.device.as_ref(),
            self.fetch_queue,
            Some(&self.signals.fetch),
        )
        .launch(&release)
    }

    fn fault_with(&self, e: Error) -> Error {
        error!("channel {}: {}", self.id, e);
        if !self.faulted.swap(true, Ordering::SeqCst) {
            warn!("encode channel {} is now faulted", self.id);
        }
        e
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_faulted() {
            return Err(Error::ChannelFaulted(self.id));
        }
        Ok(())
    }
}

impl<U: Send + 'static> Channel for VencChannel<U> {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn close(mut self) -> Result<()> {
        let mut first_error = None;
        if !self.is_faulted() {
            if let Err(e) = self.send_eos() {
                error!("channel {} failed to flush before close: {}", self.id, e);
                first_error.get_or_insert(e);
            }
        }
        let mut record = record_for_destroy(self.id, &self.record, &self.opened, &mut first_error);
        if let Err(e) = run_control_task(
            &self.device,
            Kernel::DestroyVencChannel,
            Some(&self.signals.submit),
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
        info!("closed encode channel {}", self.id);
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::descriptor::PicInfo;
    use crate::descriptor::PixelFormat;
    use crate::descriptor::StreamFormat;
    use crate::device::fake::FakeDevice;
    use crate::device::fake::FakeOp;
    use crate::signal::Capability;
    use crate::signal::CapabilityProbe;
    use crate::validate::ValidationError;

    fn manager(fake: &Arc<FakeDevice>, version: u32) -> ChannelLifecycleManager {
        let device: Arc<dyn Device> = fake.clone();
        let probe = CapabilityProbe::with_capability(Capability::parse(version).unwrap());
        ChannelLifecycleManager::new(device, Arc::new(probe)).unwrap()
    }

    fn config() -> VencConfig {
        VencConfig {
            width: 64,
            height: 48,
            ..Default::default()
        }
    }

    fn picture(device: &Arc<dyn Device>, size: u32) -> Arc<PicDesc> {
        Arc::new(
            PicDesc::new(
                device,
                PicInfo {
                    format: PixelFormat::Nv12,
                    width: 64,
                    height: 48,
                    width_stride: 64,
                    height_stride: 48,
                    size,
                    ..Default::default()
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn encodes_in_order_with_both_signal_variants() {
        for version in [100, 200] {
            let fake = FakeDevice::new(version);
            let manager = manager(&fake, version);
            let (tx, rx) = mpsc::channel();
            let channel = manager
                .open_encoder(&config(), move |frame: EncodedFrame<&'static str>| {
                    let info = frame.output.info();
                    let report = (
                        frame.token,
                        frame.user_data,
                        frame.status,
                        info.size,
                        info.format,
                    );
                    tx.send(report).unwrap();
                })
                .unwrap();
            let names = ["a", "b", "c", "d"];
            for (i, name) in names.into_iter().enumerate() {
                let input = picture(manager.device(), 64 * 48 * 3 / 2);
                assert_eq!(channel.send_frame(input, i == 0, name).unwrap(), i as u64 + 1);
            }
            channel.send_eos().unwrap();
            let delivered: Vec<_> = rx.try_iter().collect();
            assert_eq!(delivered.len(), names.len(), "version {}", version);
            for (i, (token, name, status, size, format)) in delivered.into_iter().enumerate() {
                assert_eq!(token, i as u64 + 1);
                assert_eq!(name, names[i]);
                assert_eq!(status, 0);
                assert!(size > 0);
                assert_eq!(format, StreamFormat::H264Main);
            }
            assert_eq!(channel.pending(), 0);
            channel.close().unwrap();
            assert!(fake.live().is_empty(), "version {}", version);
        }
    }

    #[test]
    fn input_size_is_checked_before_submission() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let channel = manager
            .open_encoder(&config(), |_: EncodedFrame<()>| {})
            .unwrap();
        let min = 64 * 48 * 3 / 2;
        let input = picture(manager.device(), min - 1);
        assert!(matches!(
            channel.send_frame(input, false, ()),
            Err(Error::Validation(ValidationError::InputSizeOutOfRange { .. }))
        ));
        let input = picture(manager.device(), min * 2);
        assert!(channel.send_frame(input, false, ()).is_err());
        assert_eq!(fake.kernel_launches(Kernel::VencSendFrame), 0);
        channel.close().unwrap();
    }

    #[test]
    fn encoder_ignores_signal_free_capability() {
        let fake = FakeDevice::new(100_003);
        let manager = manager(&fake, 100_003);
        let channel = manager
            .open_encoder(&config(), |_: EncodedFrame<()>| {})
            .unwrap();
        assert_eq!(fake.live().notifies, 2);
        channel.close().unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn open_unwinds_on_rejection() {
        let fake = FakeDevice::new(100);
        let manager = manager(&fake, 100);
        fake.reject_kernel(Kernel::CreateVencChannel, 3);
        let result = manager.open_encoder(&config(), |_: EncodedFrame<()>| {});
        assert!(matches!(
            result,
            Err(Error::DeviceRejected {
                kernel: "CreateVencChannel",
                status: 3
            })
        ));
        assert!(fake.live().is_empty());
    }

    #[test]
    fn failed_submit_sync_faults_channel() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let channel = manager
            .open_encoder(&config(), |_: EncodedFrame<()>| {})
            .unwrap();
        fake.fail_nth(FakeOp::Synchronize, 1);
        let input = picture(manager.device(), 64 * 48 * 3 / 2);
        assert!(matches!(
            channel.send_frame(input, false, ()),
            Err(Error::Device("synchronize", _))
        ));
        assert!(channel.is_faulted());
        assert!(matches!(
            channel.send_eos(),
            Err(Error::ChannelFaulted(_))
        ));
        channel.close().unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn destroy_rejection_still_releases_handles() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let channel = manager
            .open_encoder(&config(), |_: EncodedFrame<()>| {})
            .unwrap();
        fake.reject_kernel(Kernel::DestroyVencChannel, 9);
        assert!(matches!(
            channel.close(),
            Err(Error::DeviceRejected { status: 9, .. })
        ));
        assert!(fake.live().is_empty());
    }

    #[test]
    fn close_destroys_with_open_record_when_read_back_fails() {
        let fake = FakeDevice::new(200);
        let manager = manager(&fake, 200);
        let channel = manager
            .open_encoder(&config(), |_: EncodedFrame<()>| {})
            .unwrap();
        fake.fail_nth(FakeOp::CopyFromDevice, 1);
        assert!(matches!(
            channel.close(),
            Err(Error::Device("copy_from_device", _))
        ));
        assert_eq!(fake.open_channels(), 0);
        assert!(fake.live().is_empty());
    }
}
