//! Execution context tokens and thread-affinity checks.
//!
//! Code in this crate never asks "which thread am I on?". Instead, every task and callback is
//! handed the [`Context`] it is running on, and functions with an affinity requirement check that
//! token at entry with [`Context::expect_background`] or [`Context::expect_restricted`].
//!
//! A failed check is a programming error, not a runtime condition, so it panics with a
//! [`ContractViolation`] payload instead of returning a [`Failure`][crate::Failure].

use std::{
    fmt,
    panic::panic_any,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which class of execution context a [`Context`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// The single context used for result delivery. Must never run blocking work.
    Restricted,
    /// A worker context suitable for slow, blocking operations.
    Background,
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Affinity::Restricted => "the restricted",
            Affinity::Background => "a background",
        })
    }
}

/// A token describing the execution context the holder is currently running on.
///
/// Tokens are created by the types that own an execution context ([`Looper`] for the restricted
/// context, [`BackgroundPool`] for its worker threads) and are only lent out to code running on
/// that context.
///
/// [`Looper`]: crate::Looper
/// [`BackgroundPool`]: crate::BackgroundPool
#[derive(Debug, Clone)]
pub struct Context {
    id: ContextId,
    affinity: Affinity,
    name: Arc<str>,
}

impl Context {
    pub(crate) fn new(affinity: Affinity, name: impl Into<Arc<str>>) -> Self {
        Self {
            id: ContextId::next(),
            affinity,
            name: name.into(),
        }
    }

    /// Returns the process-unique id of this context.
    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Returns whether this is the restricted context or a background one.
    #[inline]
    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Returns the human-readable name given to this context.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether this is the affinity-restricted context.
    #[inline]
    pub fn is_restricted(&self) -> bool {
        self.affinity == Affinity::Restricted
    }

    /// Asserts that `operation` is running on a background context.
    ///
    /// # Panics
    ///
    /// Panics with a [`ContractViolation`] payload if `self` is the restricted context.
    #[track_caller]
    pub fn expect_background(&self, operation: &'static str) {
        if self.is_restricted() {
            self.violate(operation, Affinity::Background);
        }
    }

    /// Asserts that `operation` is running on the restricted context.
    ///
    /// # Panics
    ///
    /// Panics with a [`ContractViolation`] payload if `self` is a background context.
    #[track_caller]
    pub fn expect_restricted(&self, operation: &'static str) {
        if !self.is_restricted() {
            self.violate(operation, Affinity::Restricted);
        }
    }

    #[track_caller]
    fn violate(&self, operation: &'static str, expected: Affinity) -> ! {
        let violation = ContractViolation {
            operation,
            expected,
            context: self.name.clone(),
        };
        log::error!("{violation}");
        panic_any(violation)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.id)
    }
}

/// Panic payload raised when a function runs on a context its affinity contract forbids.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{operation}` must run on {expected} context, but was called on `{context}`")]
pub struct ContractViolation {
    operation: &'static str,
    expected: Affinity,
    context: Arc<str>,
}

impl ContractViolation {
    /// The name of the function whose contract was violated.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// The affinity the function required.
    pub fn expected(&self) -> Affinity {
        self.expected
    }
}

#[cfg(test)]
mod tests {
    use std::panic::catch_unwind;

    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Context::new(Affinity::Background, "a");
        let b = Context::new(Affinity::Background, "a");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn matching_affinity_passes() {
        Context::new(Affinity::Background, "bg").expect_background("work");
        Context::new(Affinity::Restricted, "main").expect_restricted("deliver");
    }

    #[test]
    fn background_only_on_restricted_panics() {
        let main = Context::new(Affinity::Restricted, "main");
        let payload = catch_unwind(|| main.expect_background("slow")).unwrap_err();
        let violation = payload.downcast::<ContractViolation>().unwrap();
        assert_eq!(violation.operation(), "slow");
        assert_eq!(violation.expected(), Affinity::Background);
        assert_eq!(
            violation.to_string(),
            "`slow` must run on a background context, but was called on `main`"
        );
    }

    #[test]
    fn restricted_only_on_background_panics() {
        let bg = Context::new(Affinity::Background, "worker-0");
        let payload = catch_unwind(|| bg.expect_restricted("deliver")).unwrap_err();
        let violation = payload.downcast::<ContractViolation>().unwrap();
        assert_eq!(violation.expected(), Affinity::Restricted);
    }
}
