//! Invariant checks for programmer errors.
//!
//! Recoverable validation failures are returned as [`RhiError`](crate::RhiError) and
//! logged at the call site. Invariant violations go through [`rhi_assert!`], which is
//! fatal when the `validation` feature is enabled and only logged otherwise.

use std::fmt;

/// Asserts an invariant of the RHI layer.
///
/// Logs through `log::error!` and panics in validation builds.
#[macro_export]
macro_rules! rhi_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            $crate::validation::report_assert(format_args!($($arg)+));
        }
    };
}

#[cold]
#[track_caller]
#[doc(hidden)]
pub fn report_assert(args: fmt::Arguments<'_>) {
    log::error!(target: "zenith_rhi_pool::assert", "{}", args);
    if cfg!(feature = "validation") {
        panic!("RHI invariant violated: {}", args);
    }
}

/// Whether frame-phase gating and other validation-only bookkeeping are active.
#[inline]
pub const fn is_enabled() -> bool {
    cfg!(feature = "validation")
}
