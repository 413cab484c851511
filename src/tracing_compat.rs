//! Structured logging that compiles away when unused.
//!
//! - **With `tracing-integration`**: re-exports the `tracing` macros.
//! - **Without it**: no-op macros that expand to nothing.
//!
//! Stage construction, hub lifecycle, executor rounds and uncaught errors log
//! through this module. Signal delivery (`on_next`) is never logged above
//! `trace`.
//!
//! ```rust,ignore
//! use rivulet::tracing_compat::{debug, debug_span, Level};
//!
//! debug!(vpu = %name, tasks = queued, "round finished");
//! let _span = debug_span!("activation", vpu = %name).entered();
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{Level, Span, debug, debug_span, error, info, info_span, span, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! Expansion targets used when tracing is disabled.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    /// No-op span macro returning a `NoopSpan`.
    #[macro_export]
    macro_rules! span {
        ($($arg:tt)*) => {
            $crate::tracing_compat::NoopSpan
        };
    }

    /// No-op debug_span macro.
    #[macro_export]
    macro_rules! debug_span {
        ($($arg:tt)*) => {
            $crate::tracing_compat::NoopSpan
        };
    }

    /// No-op info_span macro.
    #[macro_export]
    macro_rules! info_span {
        ($($arg:tt)*) => {
            $crate::tracing_compat::NoopSpan
        };
    }

    pub use crate::{debug, debug_span, error, info, info_span, span, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::{debug, debug_span, error, info, info_span, span, trace, warn};

/// Span returned by the span macros when tracing is disabled.
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug, Clone, Copy)]
pub struct NoopSpan;

#[cfg(not(feature = "tracing-integration"))]
impl NoopSpan {
    /// Returns a guard that does nothing on drop.
    #[inline]
    #[must_use]
    pub fn enter(&self) -> NoopGuard {
        NoopGuard
    }

    /// Returns self.
    #[inline]
    #[must_use]
    pub fn entered(self) -> Self {
        self
    }

    /// Always true.
    #[inline]
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        true
    }

    /// Ignores the value.
    #[inline]
    pub fn record<V>(&self, _field: &str, _value: V) {}

    /// The current span, always a no-op.
    #[inline]
    #[must_use]
    pub fn current() -> Self {
        Self
    }
}

/// Guard returned by [`NoopSpan::enter`].
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug)]
pub struct NoopGuard;

/// Level placeholder when tracing is disabled.
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Level;

#[cfg(not(feature = "tracing-integration"))]
impl Level {
    /// Trace level.
    pub const TRACE: Self = Self;
    /// Debug level.
    pub const DEBUG: Self = Self;
    /// Info level.
    pub const INFO: Self = Self;
    /// Warn level.
    pub const WARN: Self = Self;
    /// Error level.
    pub const ERROR: Self = Self;
}

/// Alias for [`NoopSpan`] when tracing is disabled.
#[cfg(not(feature = "tracing-integration"))]
pub type Span = NoopSpan;
