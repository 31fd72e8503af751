//! A stand-in workload: slow operations that must stay off the restricted context, and handlers
//! that must run on it.
//!
//! This is the workload the strategies in [`JoinStrategy`] are compared with (see the `compare`
//! demo). Every function checks its affinity on entry, so using one on the wrong context panics
//! with a [`ContractViolation`].
//!
//! [`JoinStrategy`]: crate::JoinStrategy
//! [`ContractViolation`]: crate::ContractViolation

use std::{thread, time::Duration};

use crate::{Context, Failure};

/// Result of [`SlowOps::slow_method_a`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultA;

/// Result of [`SlowOps::slow_method_b`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultB;

/// Result of [`make_result`] and [`SlowOps::too_slow_method`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combined;

/// Artificially slow operations, each blocking for a configurable delay.
#[derive(Debug, Clone, Copy)]
pub struct SlowOps {
    delay: Duration,
}

impl Default for SlowOps {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
        }
    }
}

impl SlowOps {
    /// Creates slow operations that each block for `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Returns how long each operation blocks.
    #[inline]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Produces a [`Combined`] in one go. Must run on a background context.
    pub fn too_slow_method(&self, cx: &Context) -> Result<Combined, Failure> {
        cx.expect_background("too_slow_method");
        thread::sleep(self.delay);
        Ok(Combined)
    }

    /// Produces the first half of the result. Must run on a background context.
    pub fn slow_method_a(&self, cx: &Context) -> Result<ResultA, Failure> {
        cx.expect_background("slow_method_a");
        log::debug!("slow_method_a running on {cx}");
        thread::sleep(self.delay);
        Ok(ResultA)
    }

    /// Produces the second half of the result. Must run on a background context.
    pub fn slow_method_b(&self, cx: &Context) -> Result<ResultB, Failure> {
        cx.expect_background("slow_method_b");
        log::debug!("slow_method_b running on {cx}");
        thread::sleep(self.delay);
        Ok(ResultB)
    }
}

/// Joins the two halves. Runs on whichever context the join strategy combines on.
pub fn make_result(_a: ResultA, _b: ResultB) -> Combined {
    log::debug!("make_result joining results");
    Combined
}

/// Handles a successful result. Must run on the restricted context.
pub fn success_process(cx: &Context, result: Combined) {
    cx.expect_restricted("success_process");
    log::info!("success {result:?}");
}

/// Handles a failure. Must run on the restricted context.
pub fn error_process(cx: &Context, failure: Failure) {
    cx.expect_restricted("error_process");
    log::info!("error: {failure}");
}
