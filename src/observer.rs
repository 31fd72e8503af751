//! Join lifecycle notifications.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{context::ContextId, runner::JoinStrategy, Failure};

/// Identifies one invocation of [`JoinRunner::run`], [`JoinRunner::submit`] or
/// [`JoinRunner::offload`].
///
/// [`JoinRunner::run`]: crate::JoinRunner::run
/// [`JoinRunner::submit`]: crate::JoinRunner::submit
/// [`JoinRunner::offload`]: crate::JoinRunner::offload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinId(u64);

impl JoinId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JoinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "join#{}", self.0)
    }
}

/// One of the two sides of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The first task, `task_a`.
    A,
    /// The second task, `task_b`.
    B,
}

/// A step in the life of a join.
///
/// A join moves through `Pending`, `Submitted` for each side, `BothComplete`, `Combining` and
/// finally `Delivered`. A failing side skips straight from `Failed` to `Delivered`. A single
/// offloaded task only ever has side [`Side::A`] and never reaches `BothComplete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinEvent {
    /// The join was accepted by the runner. `strategy` is `None` for a single offloaded task.
    Pending { strategy: Option<JoinStrategy> },
    /// A task was handed to its context.
    Submitted { side: Side },
    /// A task began running on `context`.
    Started { side: Side, context: ContextId },
    /// A task returned a value on `context`.
    Completed { side: Side, context: ContextId },
    /// A task returned an error or panicked.
    Failed { side: Side, failure: Failure },
    /// Both tasks completed successfully.
    BothComplete,
    /// The combine step began running on `context`.
    Combining { context: ContextId },
    /// The outcome was handed to a callback or promise. `context` is where that happened.
    Delivered { success: bool, context: ContextId },
}

/// Receives lifecycle notifications from a [`JoinRunner`].
///
/// Observers are called from whichever context the event happens on, and have no influence on
/// the join. They must not block.
///
/// [`JoinRunner`]: crate::JoinRunner
pub trait JoinObserver: Send + Sync {
    /// Called once per event of `join`, in the order the events happen.
    fn on_event(&self, join: JoinId, event: &JoinEvent);
}

/// The default observer, writing every event to the [`log`] facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl JoinObserver for LogObserver {
    fn on_event(&self, join: JoinId, event: &JoinEvent) {
        match event {
            JoinEvent::Failed { side, failure } => {
                log::warn!("{join}: task {side:?} failed: {failure}")
            }
            JoinEvent::Delivered { success: false, .. } => log::debug!("{join}: delivered error"),
            JoinEvent::Delivered { success: true, .. } => log::debug!("{join}: delivered result"),
            JoinEvent::Started { side, context } => {
                log::trace!("{join}: task {side:?} running on {context}")
            }
            JoinEvent::Combining { context } => log::trace!("{join}: combining on {context}"),
            other => log::trace!("{join}: {other:?}"),
        }
    }
}
