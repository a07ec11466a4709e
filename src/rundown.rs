// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use sync::Condvar;
use sync::Mutex;

#[derive(Debug, Default)]
struct RundownState {
    references: u64,
    down: bool,
}

/// Rundown protection: a reference count that blocks teardown while positive.
///
/// Callers that are about to use the protected object acquire a reference and
/// release it when done. Teardown flips the state to "down", after which no
/// new references can be acquired, and waits for the existing ones to drain.
#[derive(Debug, Default)]
pub struct RundownRef {
    state: Mutex<RundownState>,
    released: Condvar,
}

impl RundownRef {
    pub fn new() -> RundownRef {
        RundownRef::default()
    }

    /// Acquires a reference unless the object is being torn down.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.down {
            return false;
        }
        state.references += 1;
        true
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        assert!(state.references > 0, "rundown reference underflow");
        state.references -= 1;
        if state.references == 0 {
            self.released.notify_all();
        }
    }

    /// Forbids new references and blocks until the existing ones drain.
    pub fn wait_for_release(&self) {
        let mut state = self.state.lock();
        state.down = true;
        while state.references > 0 {
            state = self.released.wait(state);
        }
    }

    pub fn is_down(&self) -> bool {
        self.state.lock().down
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn acquire_release() {
        let rundown = RundownRef::new();
        assert!(rundown.try_acquire());
        rundown.release();
        rundown.wait_for_release();
        assert!(!rundown.try_acquire());
    }

    #[test]
    fn teardown_waits_for_drain() {
        let rundown = Arc::new(RundownRef::new());
        assert!(rundown.try_acquire());
        let rundown2 = rundown.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            rundown2.release();
        });
        rundown.wait_for_release();
        assert!(rundown.is_down());
        releaser.join().unwrap();
    }
}
