// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use crate::Condvar;
use crate::Mutex;

/// A counting semaphore.
///
/// Each `post` makes exactly one `wait` return, whether the waiter arrives before or after the
/// post. Nothing has to be re-armed between uses.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u64>,
    cvar: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` permits.
    pub const fn new(initial: u64) -> Semaphore {
        Semaphore {
            count: Mutex::new(initial),
            cvar: Condvar::new(),
        }
    }

    /// Adds one permit and wakes a waiter.
    pub fn post(&self) {
        *self.count.lock() += 1;
        self.cvar.notify_one();
    }

    /// Takes one permit, waiting up to `timeout` for it. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (mut count, result) = self
            .cvar
            .wait_timeout_while(self.count.lock(), timeout, |count| *count == 0);
        if result.timed_out() && *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Takes one permit if one is available without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Number of permits currently available.
    pub fn available(&self) -> u64 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn posts_are_counted() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        assert_eq!(sem.available(), 2);
        assert!(sem.try_wait());
        assert!(sem.wait_timeout(Duration::from_millis(1)));
        assert!(!sem.try_wait());
        assert!(!sem.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn post_wakes_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)))
        };
        sem.post();
        assert!(waiter.join().unwrap());
        assert_eq!(sem.available(), 0);
    }
}
