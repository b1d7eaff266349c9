// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Owned device handles that release themselves when dropped.

use std::mem::size_of;
use std::sync::Arc;

use base::debug;
use base::error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::device::Device;
use crate::device::DeviceAddr;
use crate::device::QueueId;
use crate::error::Error;
use crate::error::Result;

/// A device memory allocation, freed on drop.
pub struct DeviceBuffer {
    device: Arc<dyn Device>,
    addr: DeviceAddr,
    len: usize,
}

impl DeviceBuffer {
    pub fn new(device: &Arc<dyn Device>, len: usize) -> Result<DeviceBuffer> {
        let addr = device
            .alloc(len)
            .map_err(|e| Error::Device("alloc", e))?;
        Ok(DeviceBuffer {
            device: Arc::clone(device),
            addr,
            len,
        })
    }

    /// Allocates a buffer sized for `T` and stores `value` in it.
    pub fn with_value<T: IntoBytes + Immutable>(
        device: &Arc<dyn Device>,
        value: &T,
    ) -> Result<DeviceBuffer> {
        let buffer = DeviceBuffer::new(device, size_of::<T>())?;
        buffer.write(value)?;
        Ok(buffer)
    }

    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `value` to the start of the buffer.
    pub fn write<T: IntoBytes + Immutable>(&self, value: &T) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > self.len {
            return Err(Error::InvalidArgument(format!(
                "{} bytes do not fit a {} byte device buffer",
                bytes.len(),
                self.len
            )));
        }
        self.device
            .copy_to_device(self.addr, bytes)
            .map_err(|e| Error::Device("copy_to_device", e))
    }

    /// Copies a `T` back from the start of the buffer.
    pub fn read<T: FromBytes + IntoBytes>(&self) -> Result<T> {
        let mut value = T::new_zeroed();
        if size_of::<T>() > self.len {
            return Err(Error::InvalidArgument(format!(
                "{} bytes do not fit a {} byte device buffer",
                size_of::<T>(),
                self.len
            )));
        }
        self.device
            .copy_from_device(value.as_mut_bytes(), self.addr)
            .map_err(|e| Error::Device("copy_from_device", e))?;
        Ok(value)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.device.free(self.addr) {
            error!("failed to free device buffer {}: {}", self.addr, e);
        }
    }
}

/// A queue that only lives for one control exchange with the device.
///
/// Use `release` to destroy it and observe the result; dropping it destroys it best-effort.
pub struct TransientQueue {
    device: Arc<dyn Device>,
    queue: QueueId,
    released: bool,
}

impl TransientQueue {
    pub fn new(device: &Arc<dyn Device>) -> Result<TransientQueue> {
        let queue = device
            .create_queue()
            .map_err(|e| Error::Device("create_queue", e))?;
        debug!("created transient queue {:?}", queue);
        Ok(TransientQueue {
            device: Arc::clone(device),
            queue,
            released: false,
        })
    }

    pub fn id(&self) -> QueueId {
        self.queue
    }

    /// Blocks until every command enqueued on the queue has executed.
    pub fn synchronize(&self) -> Result<()> {
        self.device
            .synchronize(self.id())
            .map_err(|e| Error::Device("synchronize", e))
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.device
            .destroy_queue(self.queue)
            .map_err(|e| Error::Device("destroy_queue", e))
    }
}

impl Drop for TransientQueue {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.device.destroy_queue(self.queue) {
            error!("failed to destroy transient queue {:?}: {}", self.queue, e);
        }
    }
}
