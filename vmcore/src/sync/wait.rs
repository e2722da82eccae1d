// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU32, Ordering};

// # Explanation on the memory orders
//
// ```
// [the waker]             [the waiter]
// cond = true;
// wake_all();
//                         wait_until(|| ..);
// ```
//
// As soon as the waiter observes the wake event, it must see the true
// condition, so `wake_all`/`wake_one` bump the epoch with `Release` and the
// waiter reads it with `Acquire`. The condition is always re-tested after the
// epoch is sampled, so a wake that lands between the test and the sampling is
// never lost.

/// A wait queue.
///
/// One may wait on a wait queue until some condition becomes true. Other
/// threads invoke the `wake`-family methods after making the condition true.
///
/// The scheduler is an opaque collaborator of this subsystem, so waiting is
/// implemented as an epoch-counted spin: a waiter samples the epoch, re-tests
/// its condition, and spins until a waker bumps the epoch.
pub struct WaitQueue {
    epoch: AtomicU32,
}

impl WaitQueue {
    /// Creates a new, empty wait queue.
    pub const fn new() -> Self {
        WaitQueue {
            epoch: AtomicU32::new(0),
        }
    }

    /// Waits until some condition is met.
    ///
    /// This method takes a closure that tests a user-given condition.
    /// The method only returns if the condition returns `Some(_)`.
    /// A waker thread should first make the condition `Some(_)`, then invoke
    /// a `wake`-family method. This ordering is important to ensure that
    /// waiter threads do not lose any wakeup notifications.
    pub fn wait_until<F, R>(&self, mut cond: F) -> R
    where
        F: FnMut() -> Option<R>,
    {
        loop {
            let epoch = self.epoch.load(Ordering::Acquire);
            if let Some(res) = cond() {
                return res;
            }
            while self.epoch.load(Ordering::Acquire) == epoch {
                core::hint::spin_loop();
                #[cfg(test)]
                std::thread::yield_now();
            }
        }
    }

    /// Wakes up one waiting thread, if there is one.
    pub fn wake_one(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
    }

    /// Wakes up all waiting threads.
    pub fn wake_all(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
