// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Condvar as StdCondvar;
use std::time::Duration;

use crate::MutexGuard;

/// A Condvar wrapper operating on [`crate::Mutex`] guards, panicking on
/// poisoned locks like the rest of this crate.
#[derive(Default, Debug)]
pub struct Condvar {
    cond: StdCondvar,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            cond: StdCondvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        match self.cond.wait(guard.into_std()) {
            Ok(guard) => MutexGuard::from_std(guard),
            Err(_) => panic!("mutex is poisoned"),
        }
    }

    /// Waits until notified or until `timeout` elapses. Returns the reacquired
    /// guard and whether the wait timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        match self.cond.wait_timeout(guard.into_std(), timeout) {
            Ok((guard, result)) => (MutexGuard::from_std(guard), result.timed_out()),
            Err(_) => panic!("mutex is poisoned"),
        }
    }

    pub fn notify_one(&self) {
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::Mutex;

    use super::*;

    #[test]
    fn wait_for_flag() {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let state2 = state.clone();
        let waiter = thread::spawn(move || {
            let (lock, cond) = &*state2;
            let mut flagged = lock.lock();
            while !*flagged {
                flagged = cond.wait(flagged);
            }
        });
        {
            let (lock, cond) = &*state;
            *lock.lock() = true;
            cond.notify_all();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let lock = Mutex::new(());
        let cond = Condvar::new();
        let (_guard, timed_out) = cond.wait_timeout(lock.lock(), Duration::from_millis(10));
        assert!(timed_out);
    }
}
