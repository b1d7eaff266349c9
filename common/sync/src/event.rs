// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use crate::Condvar;
use crate::Mutex;

/// A manual-reset event.
///
/// Once set, every `wait` returns immediately until somebody calls `reset`.
#[derive(Debug, Default)]
pub struct Event {
    set: Mutex<bool>,
    cvar: Condvar,
}

impl Event {
    /// Creates an event in the reset state.
    pub const fn new() -> Event {
        Event {
            set: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Sets the event and wakes all waiters.
    pub fn set(&self) {
        *self.set.lock() = true;
        self.cvar.notify_all();
    }

    /// Clears the event.
    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Waits up to `timeout` for the event to be set. Returns `false` on timeout.
    ///
    /// Waiting does not clear the event.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (set, _) = self
            .cvar
            .wait_timeout_while(self.set.lock(), timeout, |set| !*set);
        *set
    }
}
