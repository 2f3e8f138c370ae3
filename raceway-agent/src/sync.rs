#[cfg(feature = "parking_lot")]
pub(crate) use parking_lot_crate::{Mutex, MutexGuard};

#[cfg(not(feature = "parking_lot"))]
pub(crate) use self::std_impl::*;

#[cfg(not(feature = "parking_lot"))]
mod std_impl {
    use std::sync::{self, PoisonError};
    pub(crate) use std::sync::MutexGuard;

    /// `std::sync::Mutex` that shrugs off poisoning. The buffer and the
    /// context cell must stay usable after a panicked holder.
    #[derive(Debug, Default)]
    pub(crate) struct Mutex<T: ?Sized>(sync::Mutex<T>);

    impl<T> Mutex<T> {
        pub(crate) fn new(data: T) -> Self {
            Self(sync::Mutex::new(data))
        }
    }

    impl<T: ?Sized> Mutex<T> {
        pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
            self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}
