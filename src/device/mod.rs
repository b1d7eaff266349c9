// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The accelerator runtime as seen from the host.
//!
//! Everything the control plane does to the hardware goes through the [`Device`] trait: creating
//! and destroying execution queues and completion signals, enqueueing kernels, waits, resets and
//! host callbacks, draining queues, and moving bytes between host and device memory.
//!
//! Commands enqueued on one queue execute in order relative to each other and asynchronously
//! relative to the host. `synchronize` blocks until every command enqueued so far has executed and
//! reports the first error any of them hit.

pub mod fake;

use std::fmt;
use std::fmt::Display;

use thiserror::Error as ThisError;

/// Host handle of a device execution queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(pub u32);

/// Host handle of a completion signal (notify or event).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignalId(pub u32);

/// An address in device memory.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddr(pub u64);

impl DeviceAddr {
    pub const NULL: DeviceAddr = DeviceAddr(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn offset(self, bytes: u64) -> DeviceAddr {
        DeviceAddr(self.0 + bytes)
    }
}

impl Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Status code returned by a failed runtime call.
#[derive(ThisError, Copy, Clone, Debug, PartialEq, Eq)]
#[error("runtime status {0}")]
pub struct DeviceError(pub i32);

pub type Result<T> = std::result::Result<T, DeviceError>;

/// A closure the device runs on its own callback thread once every command enqueued before it on
/// the same queue has executed.
pub type HostCallback = Box<dyn FnOnce() + Send + 'static>;

/// The accelerator runtime.
///
/// Implementations must be usable from several threads at once: submissions come from caller
/// threads while host callbacks run on a thread owned by the runtime.
pub trait Device: Send + Sync {
    /// Creates an execution queue.
    fn create_queue(&self) -> Result<QueueId>;
    /// Destroys `queue`. Commands that have not executed yet are discarded.
    fn destroy_queue(&self, queue: QueueId) -> Result<()>;
    /// Blocks until every command enqueued on `queue` so far has executed.
    fn synchronize(&self, queue: QueueId) -> Result<()>;

    /// Enqueues the kernel `name` with the argument block `args`.
    fn launch_kernel(&self, queue: QueueId, name: &str, args: &[u8]) -> Result<()>;
    /// Enqueues a host callback.
    fn launch_callback(&self, queue: QueueId, callback: HostCallback) -> Result<()>;

    /// Creates a counting notify signal.
    fn create_notify(&self) -> Result<SignalId>;
    fn destroy_notify(&self, notify: SignalId) -> Result<()>;
    /// Enqueues a wait that consumes one post of `notify`.
    fn notify_wait(&self, queue: QueueId, notify: SignalId) -> Result<()>;

    /// Creates a reusable event signal.
    fn create_event(&self) -> Result<SignalId>;
    fn destroy_event(&self, event: SignalId) -> Result<()>;
    /// Enqueues a wait for `event` to be set. The wait does not clear the event.
    fn event_wait(&self, queue: QueueId, event: SignalId) -> Result<()>;
    /// Enqueues a reset of `event`.
    fn event_reset(&self, queue: QueueId, event: SignalId) -> Result<()>;

    /// Id the device kernels use to address `signal`.
    fn signal_hw_id(&self, signal: SignalId) -> Result<u32>;

    /// Allocates `size` bytes of device memory.
    fn alloc(&self, size: usize) -> Result<DeviceAddr>;
    fn free(&self, addr: DeviceAddr) -> Result<()>;
    /// Copies `src` to device memory at `dst`. A runtime whose memory is shared with the host
    /// implements this as a plain store.
    fn copy_to_device(&self, dst: DeviceAddr, src: &[u8]) -> Result<()>;
    /// Copies device memory at `src` into `dst`.
    fn copy_from_device(&self, dst: &mut [u8], src: DeviceAddr) -> Result<()>;
}
