use std::{
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

use crate::Failure;

/// Creates a connected pair of [`Promise`] and [`PromiseHandle`].
pub(crate) fn promise<T>() -> (Promise<T>, PromiseHandle<T>) {
    let inner = Arc::new(PromiseInner {
        state: Mutex::new(PromiseState::Empty),
        condvar: Condvar::new(),
    });
    (
        Promise {
            inner: inner.clone(),
            fulfilled: false,
        },
        PromiseHandle { inner },
    )
}

enum PromiseState<T> {
    Empty,
    Waiting(Waker),
    Fulfilled(Result<T, Failure>),
    Taken,
    Dropped,
}

struct PromiseInner<T> {
    state: Mutex<PromiseState<T>>,
    condvar: Condvar,
}

impl<T> PromiseInner<T> {
    fn lock(&self) -> MutexGuard<'_, PromiseState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the terminal state and wakes whoever is waiting, sync or async.
    fn settle(&self, new: PromiseState<T>) {
        let old = mem::replace(&mut *self.lock(), new);
        self.condvar.notify_one();
        if let PromiseState::Waiting(waker) = old {
            waker.wake();
        }
    }
}

/// The producing side of a join outcome.
///
/// Owned by the background job that finishes the join. Dropping it unfulfilled resolves the
/// connected [`PromiseHandle`] to [`Failure::Abandoned`].
pub(crate) struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
    fulfilled: bool,
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.inner.settle(PromiseState::Dropped);
        }
    }
}

impl<T> Promise<T> {
    /// Fulfills the promise with the join outcome, consuming it.
    ///
    /// Does not block or fail. If the connected [`PromiseHandle`] was dropped, `outcome` is
    /// dropped as well.
    pub(crate) fn fulfill(mut self, outcome: Result<T, Failure>) {
        self.inner.settle(PromiseState::Fulfilled(outcome));
        self.fulfilled = true;
    }
}

/// A handle to the eventual outcome of [`JoinRunner::submit`].
///
/// The outcome can be retrieved either by blocking the calling thread with
/// [`PromiseHandle::block`], or by `.await`ing the handle from any executor.
///
/// The thread owning a [`Looper`][crate::Looper] should receive outcomes through
/// [`JoinRunner::run`] instead of blocking here.
///
/// [`JoinRunner::submit`]: crate::JoinRunner::submit
/// [`JoinRunner::run`]: crate::JoinRunner::run
pub struct PromiseHandle<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> PromiseHandle<T> {
    /// Blocks the calling thread until the join finishes, and returns its outcome.
    ///
    /// If the producing side was dropped without delivering an outcome (the background pool was
    /// shut down, or a pool thread died), [`Failure::Abandoned`] is returned.
    pub fn block(self) -> Result<T, Failure> {
        let mut state = self.inner.lock();
        loop {
            match mem::replace(&mut *state, PromiseState::Taken) {
                PromiseState::Empty | PromiseState::Waiting(_) => {
                    *state = PromiseState::Empty;
                    state = self
                        .inner
                        .condvar
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                PromiseState::Fulfilled(outcome) => return outcome,
                PromiseState::Taken | PromiseState::Dropped => return Err(Failure::Abandoned),
            }
        }
    }

    /// Tests whether a call to [`PromiseHandle::block`] will block or return immediately.
    pub fn will_block(&self) -> bool {
        // The producer holds the only other reference until it settles the promise or drops.
        Arc::strong_count(&self.inner) == 2
    }
}

impl<T> Future for PromiseHandle<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.lock();
        match mem::replace(&mut *state, PromiseState::Taken) {
            PromiseState::Empty | PromiseState::Waiting(_) => {
                *state = PromiseState::Waiting(cx.waker().clone());
                Poll::Pending
            }
            PromiseState::Fulfilled(outcome) => Poll::Ready(outcome),
            PromiseState::Taken | PromiseState::Dropped => Poll::Ready(Err(Failure::Abandoned)),
        }
    }
}
