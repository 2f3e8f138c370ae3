//! Scoped binding of a context to the current execution unit.
//!
//! A binding installed with [`bind`] is visible to everything the unit runs
//! synchronously beneath it, and to futures carried with
//! [`ContextExt::in_context`], which re-establish the binding around every
//! poll so the context follows a task across `.await` points and executor
//! thread migration. Preemptively spawned threads do *not* inherit a
//! binding: the agent cannot hook platform thread spawn, so the host must
//! rebind explicitly on the new thread. That asymmetry is deliberate.

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{self, Poll};

use crate::context::ContextCell;

thread_local! {
    static BOUND: RefCell<Vec<ContextCell>> = const { RefCell::new(Vec::new()) };
}

/// Installs `cell` as the current context for the enclosing execution unit.
///
/// Bindings nest: the most recent one wins, and dropping the returned guard
/// restores whatever was bound before, on every exit path.
#[must_use = "dropping the guard immediately removes the binding"]
pub fn bind(cell: ContextCell) -> BindGuard {
    BOUND.with(|stack| stack.borrow_mut().push(cell.clone()));
    BindGuard {
        cell,
        _not_send: PhantomData,
    }
}

/// The context bound to the current execution unit, if any.
pub fn current() -> Option<ContextCell> {
    BOUND.with(|stack| stack.borrow().last().cloned())
}

/// Restores the previous binding when dropped.
pub struct BindGuard {
    cell: ContextCell,
    // Bindings are per-thread state; sending the guard elsewhere would
    // unbind the wrong thread.
    _not_send: PhantomData<*const ()>,
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        // Guards are usually dropped in reverse binding order, but nothing
        // forces that; remove the newest binding of this cell specifically.
        let _ = BOUND.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(idx) = stack.iter().rposition(|bound| bound.ptr_eq(&self.cell)) {
                stack.remove(idx);
            }
        });
    }
}

impl std::fmt::Debug for BindGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindGuard").finish_non_exhaustive()
    }
}

pin_project_lite::pin_project! {
    /// A future with a context bound for the duration of every poll.
    ///
    /// Returned by [`ContextExt::in_context`].
    #[derive(Debug)]
    pub struct WithContext<F> {
        #[pin]
        inner: F,
        cell: ContextCell,
    }
}

impl<F: Future> Future for WithContext<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = bind(this.cell.clone());
        this.inner.poll(task_cx)
    }
}

/// Extension trait carrying a context along with a future.
pub trait ContextExt: Sized {
    /// Binds `cell` around every poll of `self`.
    ///
    /// Tasks spawned with the combinator observe the context exactly as the
    /// spawning code does:
    ///
    /// ```rust,ignore
    /// tokio::spawn(handle_request(req).in_context(cell.clone()));
    /// ```
    fn in_context(self, cell: ContextCell) -> WithContext<Self>;
}

impl<F: Future> ContextExt for F {
    fn in_context(self, cell: ContextCell) -> WithContext<Self> {
        WithContext { inner: self, cell }
    }
}
