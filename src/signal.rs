// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Completion signals and the capability probe that picks their variant.
//!
//! A completion signal is set by a device kernel when the work it was given is accepted or
//! finished, and waited on from an execution queue so later commands on that queue block until
//! then. Two variants exist:
//!
//! * `Notify`: a counting semaphore. Each set satisfies exactly one wait.
//! * `Event`: a reusable flag. A wait does not clear it, so every wait must be followed by a reset
//!   before the next cycle.
//!
//! Which variant a device supports depends on its kernel version, probed once per
//! [`CapabilityProbe`] and then applied to every channel opened through it.

use std::sync::Arc;
use std::sync::OnceLock;

use base::debug;
use base::error;
use base::info;
use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::device::Device;
use crate::device::QueueId;
use crate::device::SignalId;
use crate::error::Error;
use crate::error::Result;
use crate::resource::DeviceBuffer;
use crate::resource::TransientQueue;
use crate::task::Kernel;
use crate::task::TaskDescriptor;
use crate::task::TaskSubmitter;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalVariant {
    Notify,
    Event,
}

/// One completion signal owned by a channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CompletionSignal {
    variant: SignalVariant,
    id: SignalId,
    hw_id: u32,
}

impl CompletionSignal {
    /// Creates a signal of `variant` and looks up the id kernels use to set it.
    pub fn create(device: &dyn Device, variant: SignalVariant) -> Result<CompletionSignal> {
        let id = match variant {
            SignalVariant::Notify => device
                .create_notify()
                .map_err(|e| Error::Device("create_notify", e))?,
            SignalVariant::Event => device
                .create_event()
                .map_err(|e| Error::Device("create_event", e))?,
        };
        let mut signal = CompletionSignal {
            variant,
            id,
            hw_id: 0,
        };
        match device.signal_hw_id(id) {
            Ok(hw_id) => signal.hw_id = hw_id,
            Err(e) => {
                if let Err(destroy_err) = signal.destroy(device) {
                    error!("failed to destroy signal {:?}: {}", id, destroy_err);
                }
                return Err(Error::Device("signal_hw_id", e));
            }
        }
        debug!("created {:?} signal {:?} (hw id {})", variant, id, signal.hw_id);
        Ok(signal)
    }

    pub fn variant(&self) -> SignalVariant {
        self.variant
    }

    pub fn id(&self) -> SignalId {
        self.id
    }

    pub fn hw_id(&self) -> u32 {
        self.hw_id
    }

    /// Enqueues a wait for this signal on `queue`, followed by a reset for the event variant.
    ///
    /// The two commands form one step: if the reset cannot be enqueued the next cycle on this
    /// signal would pass without waiting, so the error is returned like a failed wait.
    pub fn wait_then_maybe_reset(&self, device: &dyn Device, queue: QueueId) -> Result<()> {
        match self.variant {
            SignalVariant::Notify => device
                .notify_wait(queue, self.id)
                .map_err(|e| Error::Device("notify_wait", e)),
            SignalVariant::Event => {
                device
                    .event_wait(queue, self.id)
                    .map_err(|e| Error::Device("event_wait", e))?;
                device
                    .event_reset(queue, self.id)
                    .map_err(|e| Error::Device("event_reset", e))
            }
        }
    }

    /// Enqueues a reset that clears whatever a previous user of the signal left behind.
    pub fn reset_stale(&self, device: &dyn Device, queue: QueueId) -> Result<()> {
        match self.variant {
            SignalVariant::Notify => Ok(()),
            SignalVariant::Event => device
                .event_reset(queue, self.id)
                .map_err(|e| Error::Device("event_reset", e)),
        }
    }

    pub fn destroy(&self, device: &dyn Device) -> Result<()> {
        match self.variant {
            SignalVariant::Notify => device
                .destroy_notify(self.id)
                .map_err(|e| Error::Device("destroy_notify", e)),
            SignalVariant::Event => device
                .destroy_event(self.id)
                .map_err(|e| Error::Device("destroy_event", e)),
        }
    }
}

/// The signals of a two-queue channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SignalPair {
    /// Set when the device accepts work from the submit queue.
    pub submit: CompletionSignal,
    /// Set when the device has a result ready for the fetch queue.
    pub fetch: CompletionSignal,
}

/// Kernel version from which devices use event signals.
const EVENT_SIGNAL_MIN_VERSION: u32 = 200;
/// Lowest auxiliary version whose schedulers run first-generation kernels without signals.
const SIGNAL_FREE_MIN_AUX_VERSION: u32 = 3;
/// Lowest auxiliary version that ships the PNG decoder.
const PNG_DECODE_MIN_AUX_VERSION: u32 = 1;

/// Versions reported by the device's `GetVersion` kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub kernel_version: u32,
    pub aux_version: u32,
}

impl Capability {
    /// Splits a raw version: three digits are a bare kernel version, six digits carry the
    /// auxiliary version in the low three.
    pub fn parse(raw: u32) -> Result<Capability> {
        match raw.checked_ilog10().map(|digits| digits + 1) {
            Some(3) => Ok(Capability {
                kernel_version: raw,
                aux_version: 0,
            }),
            Some(6) => Ok(Capability {
                kernel_version: raw / 1000,
                aux_version: raw % 1000,
            }),
            _ => Err(Error::UnsupportedVersion(raw)),
        }
    }

    pub fn signal_variant(&self) -> SignalVariant {
        if self.kernel_version >= EVENT_SIGNAL_MIN_VERSION {
            SignalVariant::Event
        } else {
            SignalVariant::Notify
        }
    }

    /// Whether the device completes decode and transform work without signals even when a
    /// channel asks for them.
    pub fn runs_signal_free(&self) -> bool {
        self.kernel_version < EVENT_SIGNAL_MIN_VERSION
            && self.aux_version >= SIGNAL_FREE_MIN_AUX_VERSION
    }

    pub fn supports_png_decode(&self) -> bool {
        self.aux_version >= PNG_DECODE_MIN_AUX_VERSION
    }
}

/// Lazily probes the device capability once and hands the result to every channel.
///
/// A failed probe is not cached; the next caller probes again.
#[derive(Debug, Default)]
pub struct CapabilityProbe {
    cached: OnceLock<Capability>,
    init: Mutex<()>,
}

impl CapabilityProbe {
    pub fn new() -> CapabilityProbe {
        CapabilityProbe::default()
    }

    /// A probe that never touches the device.
    pub fn with_capability(capability: Capability) -> CapabilityProbe {
        let probe = CapabilityProbe::default();
        let _ = probe.cached.set(capability);
        probe
    }

    pub fn capability(&self, device: &Arc<dyn Device>) -> Result<Capability> {
        if let Some(capability) = self.cached.get() {
            return Ok(*capability);
        }
        let _init = self.init.lock();
        if let Some(capability) = self.cached.get() {
            return Ok(*capability);
        }
        let capability = Capability::parse(query_version(device)?)?;
        info!(
            "accelerator kernel version {} (aux {}), using {:?} signals",
            capability.kernel_version,
            capability.aux_version,
            capability.signal_variant()
        );
        let _ = self.cached.set(capability);
        Ok(capability)
    }
}

fn query_version(device: &Arc<dyn Device>) -> Result<u32> {
    let queue = TransientQueue::new(device)?;
    let version = DeviceBuffer::with_value(device, &0u32)?;
    TaskSubmitter::new(device.as_ref(), queue.id(), None)
        .launch(&TaskDescriptor::new(Kernel::GetVersion).operand(version.addr()))?;
    queue.synchronize()?;
    let raw = version.read::<u32>()?;
    drop(version);
    queue.release()?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;
    use crate::device::fake::FakeOp;

    #[test]
    fn parses_short_and_long_versions() {
        assert_eq!(
            Capability::parse(100).unwrap(),
            Capability {
                kernel_version: 100,
                aux_version: 0
            }
        );
        assert_eq!(
            Capability::parse(200_005).unwrap(),
            Capability {
                kernel_version: 200,
                aux_version: 5
            }
        );
        assert!(matches!(
            Capability::parse(2000),
            Err(Error::UnsupportedVersion(2000))
        ));
        assert!(matches!(
            Capability::parse(0),
            Err(Error::UnsupportedVersion(0))
        ));
    }

    #[test]
    fn variant_follows_kernel_version() {
        let v100 = Capability::parse(100_001).unwrap();
        assert_eq!(v100.signal_variant(), SignalVariant::Notify);
        assert!(!v100.runs_signal_free());
        assert!(v100.supports_png_decode());
        assert!(Capability::parse(100_003).unwrap().runs_signal_free());
        let v200 = Capability::parse(200).unwrap();
        assert_eq!(v200.signal_variant(), SignalVariant::Event);
        assert!(!v200.supports_png_decode());
    }

    #[test]
    fn probe_caches_success() {
        let fake = FakeDevice::new(200_001);
        let device: Arc<dyn Device> = fake.clone();
        let probe = CapabilityProbe::new();
        assert_eq!(probe.capability(&device).unwrap().aux_version, 1);
        assert_eq!(probe.capability(&device).unwrap().kernel_version, 200);
        assert_eq!(fake.kernel_launches(Kernel::GetVersion), 1);
        assert!(fake.live().is_empty());
    }

    #[test]
    fn probe_retries_after_failure() {
        let fake = FakeDevice::new(100);
        let device: Arc<dyn Device> = fake.clone();
        let probe = CapabilityProbe::new();
        fake.fail_nth(FakeOp::Synchronize, 1);
        assert!(probe.capability(&device).is_err());
        assert!(fake.live().is_empty());
        assert_eq!(probe.capability(&device).unwrap().kernel_version, 100);
        assert_eq!(fake.kernel_launches(Kernel::GetVersion), 2);
    }

    #[test]
    fn unparseable_version_is_not_cached() {
        let fake = FakeDevice::new(12);
        let device: Arc<dyn Device> = fake.clone();
        let probe = CapabilityProbe::new();
        assert!(matches!(
            probe.capability(&device),
            Err(Error::UnsupportedVersion(12))
        ));
        assert!(probe.capability(&device).is_err());
        assert_eq!(fake.kernel_launches(Kernel::GetVersion), 2);
    }

    #[test]
    fn preset_probe_skips_device() {
        let fake = FakeDevice::new(100);
        let device: Arc<dyn Device> = fake.clone();
        let probe = CapabilityProbe::with_capability(Capability::parse(200).unwrap());
        assert_eq!(
            probe.capability(&device).unwrap().signal_variant(),
            SignalVariant::Event
        );
        assert_eq!(fake.kernel_launches(Kernel::GetVersion), 0);
    }

    #[test]
    fn event_wait_is_followed_by_reset() {
        let fake = FakeDevice::new(200);
        let device: Arc<dyn Device> = fake.clone();
        let queue = device.create_queue().unwrap();
        let signal = CompletionSignal::create(device.as_ref(), SignalVariant::Event).unwrap();
        fake.raise_signal(signal.hw_id());
        signal
            .wait_then_maybe_reset(device.as_ref(), queue)
            .unwrap();
        device.synchronize(queue).unwrap();
        assert!(!fake.signal_is_raised(signal.hw_id()));
        signal.destroy(device.as_ref()).unwrap();
        device.destroy_queue(queue).unwrap();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn failed_reset_is_reported() {
        let fake = FakeDevice::new(200);
        let device: Arc<dyn Device> = fake.clone();
        let queue = device.create_queue().unwrap();
        let signal = CompletionSignal::create(device.as_ref(), SignalVariant::Event).unwrap();
        fake.fail_nth(FakeOp::EventReset, 1);
        assert!(matches!(
            signal.wait_then_maybe_reset(device.as_ref(), queue),
            Err(Error::Device("event_reset", _))
        ));
        signal.destroy(device.as_ref()).unwrap();
        device.destroy_queue(queue).unwrap();
    }

    #[test]
    fn hw_id_failure_destroys_signal() {
        let fake = FakeDevice::new(100);
        fake.fail_nth(FakeOp::SignalHwId, 1);
        assert!(CompletionSignal::create(fake.as_ref(), SignalVariant::Notify).is_err());
        assert!(fake.live().is_empty());
    }
}
