// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard as StdMutexGuard;
use std::sync::TryLockError;

/// A Mutex wrapper whose `lock()` does not return a `Result`.
///
/// Lock poisoning is handled by panicking: if a thread panics while holding
/// the lock, every subsequent `lock()` call panics as well instead of handing
/// out possibly inconsistent data.
#[derive(Default, Debug)]
pub struct Mutex<T: ?Sized> {
    lock: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Mutex<T> {
        Mutex {
            lock: StdMutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.lock.into_inner().expect("mutex is poisoned")
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<T> {
        match self.lock.lock() {
            Ok(guard) => MutexGuard { guard },
            Err(_) => panic!("mutex is poisoned"),
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        match self.lock.try_lock() {
            Ok(guard) => Some(MutexGuard { guard }),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => panic!("mutex is poisoned"),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.lock.get_mut().expect("mutex is poisoned")
    }
}

/// RAII guard for [`Mutex`]; the lock is released on drop.
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    guard: StdMutexGuard<'a, T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn into_std(self) -> StdMutexGuard<'a, T> {
        self.guard
    }

    pub(crate) fn from_std(guard: StdMutexGuard<'a, T>) -> Self {
        MutexGuard { guard }
    }
}

impl<'a, T: ?Sized> std::ops::Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T: ?Sized> std::ops::DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_mutate() {
        let m = Mutex::new(1u32);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 2);
    }

    #[test]
    fn try_lock_contended() {
        let m = Mutex::new(());
        let _held = m.lock();
        assert!(m.try_lock().is_none());
    }
}
