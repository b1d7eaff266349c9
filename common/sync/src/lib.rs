// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitive types whose methods panic rather than returning error in case of poison.
//!
//! The Mutex/Condvar types in this crate wrap the standard library versions and mirror the same
//! methods, except that they panic where the standard library would return an Error. A panic while
//! a lock is held already takes down the process in release builds (panic=abort), so callers never
//! have to consider poison.
//!
//! On top of those wrappers the crate provides the signalling primitives the accelerator model is
//! built from:
//!
//! - [`Semaphore`]: a counting signal. Every `post` satisfies exactly one `wait`.
//! - [`Event`]: a reusable flag. Once set it satisfies every `wait` until it is `reset`.
//! - [`Promise`]/[`Waitable`]: a one-shot hand-off between two threads.

mod condvar;
mod event;
mod mutex;
mod semaphore;

use std::sync::Arc;
use std::sync::WaitTimeoutResult;
use std::time::Duration;

pub use crate::condvar::Condvar;
pub use crate::event::Event;
pub use crate::mutex::Mutex;
pub use crate::mutex::WouldBlock;
pub use crate::semaphore::Semaphore;

/// Waitable allows one thread to wait on a signal from another thread.
///
/// A Waitable is usually created with a Promise using
/// `create_promise_and_waitable`, and the Promise is used by one thread and the
/// Waitable can be used by another thread. Promise and Waitable do not use any
/// OS-level synchronization primitives.
pub struct Waitable(Arc<(Condvar, Mutex<bool>)>);

impl Waitable {
    /// Return an already-signaled Waitable.
    pub fn signaled() -> Self {
        Waitable(Arc::new((Condvar::new(), Mutex::new(true))))
    }

    /// Perform a blocking wait on this Waitable.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitTimeoutResult {
        let timeout = timeout.unwrap_or(Duration::MAX);
        let (ref condvar, ref signaled_mutex) = *self.0;
        condvar
            .wait_timeout_while(signaled_mutex.lock(), timeout, |signaled| !*signaled)
            .1
    }
}

/// Promise allows one thread to signal a waitable that another thread can wait on.
pub struct Promise(Arc<(Condvar, Mutex<bool>)>);

impl Promise {
    /// Signal this promise, and it's associated Waitable.
    pub fn signal(&self) {
        let (ref condvar, ref signaled_mutex) = *self.0;
        *signaled_mutex.lock() = true;
        condvar.notify_all();
    }
}

/// Create a paired Promise and Waitable.
///
/// Signalling the Promise will signal the Waitable.
pub fn create_promise_and_waitable() -> (Promise, Waitable) {
    let inner = Arc::new((Condvar::new(), Mutex::new(false)));
    (Promise(Arc::clone(&inner)), Waitable(inner))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn promise_wakes_waitable_on_other_thread() {
        let (promise, waitable) = create_promise_and_waitable();
        let handle = thread::spawn(move || promise.signal());
        assert!(!waitable.wait(Some(Duration::from_secs(5))).timed_out());
        handle.join().unwrap();
    }

    #[test]
    fn unsignaled_waitable_times_out() {
        let (_promise, waitable) = create_promise_and_waitable();
        assert!(waitable.wait(Some(Duration::from_millis(10))).timed_out());
        assert!(!Waitable::signaled().wait(None).timed_out());
    }
}
