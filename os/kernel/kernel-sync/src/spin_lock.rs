use core::cell::UnsafeCell;
use core::fmt;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};

/// Busy-waiting lock around the frame bitmap and the kernel VA hint.
///
/// Acquisition is a compare-and-swap on the flag; release issues a full
/// fence and then clears it. Interrupts stay as they are: on a single core
/// a handler that takes a lock already held by the code it interrupted
/// spins forever, so the memory manager never runs inside such a handler
/// while a guard is alive.
pub struct SpinLock<T> {
    held: AtomicBool,
    /// Number of completed critical sections.
    acquisitions: AtomicU64,
    value: UnsafeCell<T>,
}

// SAFETY: the flag serializes all access to `value`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            acquisitions: AtomicU64::new(0),
            value: UnsafeCell::new(value),
        }
    }

    fn acquire(&self) -> bool {
        self.held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin until the lock is free and take it.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while !self.acquire() {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Take the lock only if nobody holds it.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| SpinLockGuard { lock: self })
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    /// How many guards have been released so far.
    #[inline]
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Exclusive access without touching the flag.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("held", &self.is_locked())
            .field("acquisitions", &self.acquisitions())
            .finish_non_exhaustive()
    }
}

/// Access to the protected value; dropping it releases the lock.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the flag is ours.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the flag is ours.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.acquisitions.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.held.store(false, Ordering::Release);
    }
}
