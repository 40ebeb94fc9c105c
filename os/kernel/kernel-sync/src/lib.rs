//! # Kernel synchronization primitives
//!
//! One primitive lives here: [`SpinMutex`], a busy-waiting mutex with an
//! RAII guard. The VM subsystem uses it to serialize heap-break updates;
//! those critical sections are a handful of arithmetic instructions, which
//! is exactly the regime where spinning beats blocking.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A busy-waiting mutex.
///
/// `SpinMutex<T>` serializes access to `T` with a single atomic flag.
/// [`lock`](Self::lock) spins until the flag clears and hands out a
/// [`SpinMutexGuard`]; dropping the guard releases the lock, so every exit
/// path of a critical section — early returns included — unlocks.
///
/// The lock is not fair and not reentrant: a thread that locks twice spins
/// on itself forever. Hold it only across short, non-blocking sections.
///
/// # Examples
///
/// ```
/// use kernel_sync::SpinMutex;
///
/// let m = SpinMutex::new(0_u32);
///
/// {
///     let mut g = m.lock();
///     *g = 1;
/// } // guard drops, unlocking
///
/// assert_eq!(*m.lock(), 1);
/// ```
pub struct SpinMutex<T> {
    /// Set while some guard is alive.
    locked: AtomicBool,
    /// The protected value.
    value: UnsafeCell<T>,
}

// Safety: the flag provides mutual exclusion (Acquire on take, Release on
// drop), so the mutex may be shared or moved across threads whenever the
// protected value itself may move between threads.
unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    /// An unlocked mutex around `value`.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    ///
    /// Spins on plain loads with [`core::hint::spin_loop`] between
    /// attempts, retrying the atomic swap only once the flag reads clear.
    /// Never yields the thread.
    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinMutexGuard { mutex: self }
    }

    /// Acquire the lock only if it is free right now.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinMutexGuard { mutex: self })
        }
    }

    /// Access the value through exclusive ownership, skipping the lock.
    ///
    /// With `&mut self` no guard can be alive, so no locking is needed.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

/// RAII guard for a [`SpinMutex`]; the lock releases when it drops.
///
/// Dereferences to the protected value.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard's existence proves the lock is held.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard's existence proves the lock is held.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guard_releases_on_drop() {
        let m = SpinMutex::new(0_u32);
        {
            let mut g = m.lock();
            *g = 7;
        }
        assert_eq!(*m.lock(), 7);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = SpinMutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn get_mut_bypasses_the_lock() {
        let mut m = SpinMutex::new(1_u32);
        *m.get_mut() = 2;
        assert_eq!(*m.lock(), 2);
    }

    #[test]
    fn increments_from_many_threads_are_not_lost() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 1000;

        let counter = Arc::new(SpinMutex::new(0_usize));
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..ROUNDS {
                    *counter.lock() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker");
        }

        assert_eq!(*counter.lock(), THREADS * ROUNDS);
    }
}
