//! Sleep/wake wait-channels (§5, §9 "Sleep/wake as channels").
//!
//! The reference design is a single cooperative kernel task suspending
//! with `waitfor(channel)` / resuming with `wakeall(channel)`. This
//! substrate preserves that contract over real OS threads: each
//! `WaitChannel` owns a `Condvar`; `sleep` atomically releases the
//! caller's lock guard and blocks until `wake_all` is called, exactly the
//! "release lock, block until the channel fires" contract the design
//! notes ask for, without embedding a scheduler.

use std::sync::{Condvar, Mutex, MutexGuard};

pub struct WaitChannel {
    cv: Condvar,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { cv: Condvar::new() }
    }

    /// Atomically releases `guard` and blocks until another thread calls
    /// [`WaitChannel::wake_all`] on this channel, then reacquires the lock.
    pub fn sleep<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.cv.wait(guard).expect("wait-channel mutex poisoned")
    }

    /// Wakes every task sleeping on this channel.
    pub fn wake_all(&self) {
        self.cv.notify_all();
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience used by components that guard a single `Mutex<T>` with a
/// single named channel (the common case for `SBLOCKBUSY`/`INODELOCKED`).
pub fn lock_unpoisoned<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().expect("mutex poisoned")
}
