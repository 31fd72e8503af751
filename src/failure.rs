use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use crate::context::ContractViolation;

/// An operational failure of a join: something went wrong while computing the result.
///
/// A [`Failure`] is always recovered at the join boundary and handed to exactly one error
/// callback. Misuse of the affinity contract is reported differently, see [`ContractViolation`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    /// Error returned by a task.
    #[error("{0}")]
    Task(String),
    /// A task or the combine step panicked.
    #[error("panicked: {0}")]
    Panicked(String),
    /// A caller-sensitive join was started from the restricted context.
    #[error("join started from restricted context `{0}`, which must not block")]
    RestrictedCaller(String),
    /// The result was dropped without being produced, for example because the background pool
    /// shut down or a worker thread died.
    #[error("the result was abandoned before it was produced")]
    Abandoned,
}

impl Failure {
    /// Creates a [`Failure::Task`] with the given message.
    pub fn new<M: Into<String>>(message: M) -> Self {
        Failure::Task(message.into())
    }
}

/// Runs a fallible step, turning a panic into [`Failure::Panicked`].
///
/// Panics carrying a [`ContractViolation`] are not failures but bugs in the caller; they are
/// re-raised unchanged.
pub fn catching<T, F>(step: F) -> Result<T, Failure>
where
    F: FnOnce() -> Result<T, Failure>,
{
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(result) => result,
        Err(payload) => {
            if payload.is::<ContractViolation>() {
                panic::resume_unwind(payload);
            }
            Err(Failure::Panicked(panic_message(&*payload)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}
