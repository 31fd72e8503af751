//! Run two blocking tasks in the background, join their results, and hand the outcome back to a
//! thread that must never block.
//!
//! # Overview
//!
//! Many programs have one thread with a special role: a UI thread, an event loop, a game loop.
//! Such a thread must not perform slow, blocking work, but it is the thread that needs the
//! results of that work. This library structures that pattern around three types:
//!
//! - [`Looper`] is the *restricted* context. It is a message loop owned by the special thread,
//!   fed by [`Dispatcher`]s from other threads.
//! - [`BackgroundPool`] is an owned set of worker threads (the *background* contexts) that run
//!   the blocking work. Like every owned thread in this crate, it is joined when dropped and
//!   forwards panics to its owner.
//! - [`JoinRunner`] forks two tasks onto background threads, joins their results with a combine
//!   function, and posts exactly one of the success or error callbacks to the [`Looper`].
//!
//! There is no ambient "current thread" detection. Every task and callback is handed the
//! [`Context`] token it runs on, and functions with an affinity requirement check it with
//! [`Context::expect_background`] or [`Context::expect_restricted`]. Failing such a check is a
//! programming error and panics with a [`ContractViolation`]; ordinary errors are [`Failure`]s and
//! are delivered to the error callback.
//!
//! # Usage
//!
//! ```
//! use affinity_join::{Failure, JoinRunner, JoinStrategy, Looper};
//!
//! let looper = Looper::new();
//! let runner = JoinRunner::builder().build(looper.dispatcher()).unwrap();
//! let quit = looper.dispatcher();
//! let quit2 = quit.clone();
//!
//! runner.run(
//!     looper.context(),
//!     JoinStrategy::ConcurrentForkJoin,
//!     |cx| {
//!         cx.expect_background("fetch a");
//!         Ok::<_, Failure>("A1")
//!     },
//!     |cx| {
//!         cx.expect_background("fetch b");
//!         Ok::<_, Failure>("B1")
//!     },
//!     |a, b| format!("{a}+{b}"),
//!     move |cx, joined| {
//!         cx.expect_restricted("show result");
//!         assert_eq!(joined, "A1+B1");
//!         quit.quit();
//!     },
//!     move |_, failure| {
//!         quit2.quit();
//!         panic!("unexpected failure: {failure}");
//!     },
//! );
//!
//! // Runs the delivery callback on this thread.
//! looper.run();
//! ```
//!
//! When the outcome is not needed on the restricted context, [`JoinRunner::submit`] returns a
//! [`PromiseHandle`] that can be blocked on or `.await`ed instead:
//!
//! ```
//! use affinity_join::{Failure, JoinRunner, JoinStrategy, Looper};
//!
//! let looper = Looper::new();
//! let runner = JoinRunner::builder().build(looper.dispatcher()).unwrap();
//!
//! let handle = runner.submit(
//!     looper.context(),
//!     JoinStrategy::Sequential,
//!     |_| Ok::<_, Failure>(1),
//!     |_| Err::<i32, _>(Failure::new("boom")),
//!     |a, b| a + b,
//! );
//! assert_eq!(handle.block(), Err(Failure::new("boom")));
//! ```

mod context;
mod failure;
mod looper;
mod observer;
mod pool;
mod promise;
mod runner;
pub mod sample;

#[cfg(test)]
mod test;

pub use context::{Affinity, Context, ContextId, ContractViolation};
pub use failure::{catching, Failure};
pub use looper::{Dispatcher, Looper};
pub use observer::{JoinEvent, JoinId, JoinObserver, LogObserver, Side};
pub use pool::{BackgroundPool, PoolBuilder};
pub use promise::PromiseHandle;
pub use runner::{JoinRunner, JoinStrategy, RunnerBuilder};
