// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;

use sync::Condvar;
use sync::Mutex;

/// Whether a [`Event::wait_timeout`] call returned because the event was
/// signaled or because the timeout elapsed first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventWaitResult {
    Signaled,
    TimedOut,
}

#[derive(Default, Debug)]
struct EventState {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// A manual-reset event.
///
/// Once signaled, every current and future waiter is released until the event
/// is explicitly `reset()`. Clones share the same underlying state, so a
/// signal through one handle wakes waiters on all of them.
#[derive(Clone, Default, Debug)]
pub struct Event(Arc<EventState>);

impl Event {
    pub fn new() -> Event {
        Event(Arc::new(EventState::default()))
    }

    /// Signals the event, releasing all waiters until `reset()` is called.
    pub fn signal(&self) {
        let mut signaled = self.0.signaled.lock();
        *signaled = true;
        self.0.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.0.signaled.lock() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.0.signaled.lock()
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let mut signaled = self.0.signaled.lock();
        while !*signaled {
            signaled = self.0.cond.wait(signaled);
        }
    }

    /// Blocks until the event is signaled or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> EventWaitResult {
        let deadline = std::time::Instant::now() + timeout;
        let mut signaled = self.0.signaled.lock();
        while !*signaled {
            let now = std::time::Instant::now();
            if now >= deadline {
                return EventWaitResult::TimedOut;
            }
            let (guard, timed_out) = self.0.cond.wait_timeout(signaled, deadline - now);
            signaled = guard;
            if timed_out && !*signaled {
                return EventWaitResult::TimedOut;
            }
        }
        EventWaitResult::Signaled
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn signal_wakes_waiter() {
        let evt = Event::new();
        let evt2 = evt.clone();
        let waiter = thread::spawn(move || evt2.wait());
        evt.signal();
        waiter.join().unwrap();
        assert!(evt.is_signaled());
    }

    #[test]
    fn manual_reset_stays_signaled() {
        let evt = Event::new();
        evt.signal();
        evt.wait();
        // A second wait on a manual-reset event must not block.
        assert_eq!(
            evt.wait_timeout(Duration::from_millis(10)),
            EventWaitResult::Signaled
        );
        evt.reset();
        assert_eq!(
            evt.wait_timeout(Duration::from_millis(10)),
            EventWaitResult::TimedOut
        );
    }
}
