//! IRQ-disabling spinlock with owner tracking.
//!
//! Acquisition disables local interrupts through the `pushcli` protocol
//! and records the owning CPU; the guard re-enables on drop. Re-acquiring
//! a lock already held by the executing CPU is a deadlock and panics.
//!
//! The guard doubles as the "locked witness": helpers that require a
//! caller-held lock take the guard (or `&mut` of the protected data)
//! instead of probing lock state at runtime.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::x86_64::interrupts;
use crate::percpu;

pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    /// Owning CPU id plus one; zero when unheld.
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        SpinLock { locked: AtomicBool::new(false), owner: AtomicUsize::new(0), data: UnsafeCell::new(data) }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spin until the lock is acquired. Interrupts stay disabled until the
    /// guard drops.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        interrupts::pushcli();

        // A CPU that spins on a lock it already holds can never make
        // progress; catch it instead of hanging. Hosted test threads all
        // report the same CPU id, so the check is bare-metal only.
        #[cfg(target_os = "none")]
        if self.held_by_current_cpu() {
            panic!("spinlock: re-acquisition on cpu{}", percpu::cpu_id());
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                crate::arch::pause();
            }
        }
        self.owner.store(percpu::cpu_id() + 1, Ordering::Relaxed);
        SpinGuard { lock: self }
    }

    /// Single acquisition attempt; used by the balancer and aging passes
    /// which skip contended queues rather than wait.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        interrupts::pushcli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(percpu::cpu_id() + 1, Ordering::Relaxed);
            Some(SpinGuard { lock: self })
        } else {
            interrupts::popcli();
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn held_by_current_cpu(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.owner.load(Ordering::Relaxed) == percpu::cpu_id() + 1
    }

    /// Exclusive access without locking; usable while the lock is
    /// statically unshared.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> SpinGuard<'a, T> {
    /// The lock this guard protects; lets wait paths re-acquire after a
    /// sleep.
    pub fn lock_ref(&self) -> &'a SpinLock<T> {
        self.lock
    }

    /// Release the lock, run `f`, then re-acquire. The scheduler's wait
    /// path uses this to sleep without the lock held and return with it
    /// held again.
    pub fn unlocked<R>(self, f: impl FnOnce() -> R) -> (SpinGuard<'a, T>, R) {
        let lock = self.lock;
        drop(self);
        let r = f();
        (lock.lock(), r)
    }
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(0, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        interrupts::popcli();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_gives_exclusive_access() {
        let lock = SpinLock::new(41);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn unlocked_releases_and_reacquires() {
        let lock = SpinLock::new(7);
        let g = lock.lock();
        let (g, observed) = g.unlocked(|| lock.try_lock().map(|h| *h));
        assert_eq!(observed, Some(7));
        assert_eq!(*g, 7);
    }
}
