use std::ops::{Deref, DerefMut};
use std::panic::Location;

use crate::carrier;
use crate::error::Error;
use crate::Agent;

/// The capability set a lock must offer for the agent to track it: a
/// blocking acquire that yields a guard, released when the guard drops.
///
/// Implemented for `std::sync::Mutex` and `std::sync::RwLock` (tracked as
/// its write lock), and for `parking_lot::Mutex` with the `parking_lot`
/// feature.
pub trait RawLock {
    /// Guard type held while the lock is owned.
    type Guard<'a>
    where
        Self: 'a;

    /// Blocks until the lock is held. `None` when the lock cannot be
    /// acquired, e.g. a previous holder panicked.
    fn acquire(&self) -> Option<Self::Guard<'_>>;
}

impl<T> RawLock for std::sync::Mutex<T> {
    type Guard<'a>
        = std::sync::MutexGuard<'a, T>
    where
        Self: 'a;

    fn acquire(&self) -> Option<Self::Guard<'_>> {
        self.lock().ok()
    }
}

impl<T> RawLock for std::sync::RwLock<T> {
    type Guard<'a>
        = std::sync::RwLockWriteGuard<'a, T>
    where
        Self: 'a;

    fn acquire(&self) -> Option<Self::Guard<'_>> {
        self.write().ok()
    }
}

#[cfg(feature = "parking_lot")]
impl<T> RawLock for parking_lot_crate::Mutex<T> {
    type Guard<'a>
        = parking_lot_crate::MutexGuard<'a, T>
    where
        Self: 'a;

    fn acquire(&self) -> Option<Self::Guard<'_>> {
        Some(self.lock())
    }
}

/// Holds a tracked lock.
///
/// Dropping the guard captures the matching `LockRelease` event and then
/// releases the underlying lock, on every exit path including unwinding.
/// Dereferences to the locked data.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct TrackedGuard<'a, L: RawLock + 'a> {
    agent: &'a Agent,
    guard: L::Guard<'a>,
    lock_id: String,
    lock_type: String,
    location: &'static Location<'static>,
}

impl Agent {
    /// Scoped lock acquisition helper: takes `lock`, captures a
    /// `LockAcquire` event, and returns a guard whose drop captures the
    /// matching `LockRelease` and releases the lock.
    ///
    /// # Errors
    ///
    /// Fails fast, before the lock is taken:
    /// [`Error::ContextRequired`] when no context is bound to the current
    /// execution unit, and [`Error::LockUnavailable`] when the lock cannot
    /// be acquired.
    #[track_caller]
    pub fn scoped_lock<'a, L: RawLock>(
        &'a self,
        lock: &'a L,
        lock_id: &str,
        lock_type: &str,
    ) -> Result<TrackedGuard<'a, L>, Error> {
        let location = Location::caller();
        if carrier::current().is_none() {
            return Err(Error::ContextRequired);
        }
        let guard = lock.acquire().ok_or_else(|| Error::LockUnavailable {
            lock_id: lock_id.to_owned(),
        })?;
        self.track_lock_acquire_at(lock_id, lock_type, location);
        Ok(TrackedGuard {
            agent: self,
            guard,
            lock_id: lock_id.to_owned(),
            lock_type: lock_type.to_owned(),
            location,
        })
    }

    /// Runs `thunk` under a tracked lock; the closure receives the guard
    /// for access to the locked data.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Agent::scoped_lock`].
    #[track_caller]
    pub fn with_lock<L: RawLock, T>(
        &self,
        lock: &L,
        lock_id: &str,
        lock_type: &str,
        thunk: impl FnOnce(&mut TrackedGuard<'_, L>) -> T,
    ) -> Result<T, Error> {
        let mut guard = self.scoped_lock(lock, lock_id, lock_type)?;
        Ok(thunk(&mut guard))
    }
}

impl<'a, L: RawLock + 'a> Deref for TrackedGuard<'a, L>
where
    L::Guard<'a>: Deref,
{
    type Target = <L::Guard<'a> as Deref>::Target;

    fn deref(&self) -> &Self::Target {
        self.guard.deref()
    }
}

impl<'a, L: RawLock + 'a> DerefMut for TrackedGuard<'a, L>
where
    L::Guard<'a>: DerefMut,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.deref_mut()
    }
}

impl<L: RawLock> Drop for TrackedGuard<'_, L> {
    fn drop(&mut self) {
        // The release is recorded while the lock is still held; the
        // underlying guard drops after this body.
        self.agent
            .track_lock_release_at(&self.lock_id, &self.lock_type, self.location);
    }
}
