//! Error types and error handling strategy for rivulet.
//!
//! Two families of failure exist and they never mix:
//!
//! - **Signalled errors** ([`Error`]) travel through `on_error` like any other
//!   signal. They are cheap to clone because a hub delivers the same error to
//!   every subscriber and a replaying hub keeps it for late subscribers.
//! - **Protocol violations** ([`ProtocolViolation`](crate::invariant::ProtocolViolation))
//!   are programming errors detected by the invariant layer. They fail fast and
//!   are never sent downstream.
//!
//! # Recovery Classification
//!
//! Every [`ErrorKind`] maps to a [`Recoverability`] so that retrying
//! combinators such as `repeat` can be reasoned about:
//! - `Transient`: the same upstream may succeed when re-subscribed
//! - `Permanent`: re-subscribing will not help
//! - `Unknown`: depends on the producer of the error

use core::fmt;
use std::sync::Arc;

use crate::invariant::ProtocolViolation;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Signalled ===
    /// Error raised by user code or a producer of items.
    User,
    /// A `timeout` stage observed no signal within its window.
    Timeout,
    /// A `*_or_error` stage completed without seeing an item.
    NoSuchElement,

    // === Execution ===
    /// A task body returned an error.
    TaskFailed,
    /// An executor exceeded its round budget.
    Runaway,

    // === Internal ===
    /// A protocol invariant was broken.
    ProtocolViolation,
    /// Configuration could not be loaded.
    Config,
    /// Engine bug or impossible state.
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::User | Self::Timeout | Self::NoSuchElement => ErrorCategory::Signal,
            Self::TaskFailed | Self::Runaway => ErrorCategory::Execution,
            Self::ProtocolViolation | Self::Config | Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns the recoverability classification for this error kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::Timeout | Self::TaskFailed => Recoverability::Transient,
            Self::NoSuchElement
            | Self::Runaway
            | Self::ProtocolViolation
            | Self::Config
            | Self::Internal => Recoverability::Permanent,
            Self::User => Recoverability::Unknown,
        }
    }
}

/// Classification of error recoverability for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure that may succeed on re-subscription.
    Transient,
    /// Permanent failure that will not succeed on re-subscription.
    Permanent,
    /// Cannot be determined from the kind alone.
    Unknown,
}

impl Recoverability {
    /// Returns true if this error is safe to retry.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if this error should never be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent)
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Errors that flow through `on_error`.
    Signal,
    /// Errors raised by executors and tasks.
    Execution,
    /// Engine or configuration failures.
    Internal,
}

/// The main error type carried by `on_error` signals.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error was produced by a `timeout` stage.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns true if this error originated in user code.
    #[must_use]
    pub const fn is_user(&self) -> bool {
        matches!(self.kind, ErrorKind::User)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Attaches an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Creates a user error with a message.
    #[must_use]
    pub fn user(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(msg)
    }

    /// Creates the error emitted when a `timeout` window elapses.
    #[must_use]
    pub fn timeout(after_ms: u64) -> Self {
        Self::new(ErrorKind::Timeout).with_message(format!("no signal within {after_ms}ms"))
    }

    /// Creates the error emitted by `first_or_error` / `last_or_error`.
    #[must_use]
    pub fn no_such_element() -> Self {
        Self::new(ErrorKind::NoSuchElement).with_message("stream completed without an item")
    }

    /// Creates a runaway-executor error naming the stuck tasks.
    #[must_use]
    pub fn runaway(vpu: &str, tasks: &[String]) -> Self {
        Self::new(ErrorKind::Runaway).with_message(format!(
            "Runaway task(s) detected on {vpu}. Tasks still running after max rounds: {}",
            tasks.join(", ")
        ))
    }

    /// Creates an internal error (engine bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<ProtocolViolation> for Error {
    fn from(violation: ProtocolViolation) -> Self {
        Self::new(ErrorKind::ProtocolViolation)
            .with_message(violation.to_string())
            .with_source(violation)
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::new(ErrorKind::Config)
            .with_message(err.to_string())
            .with_source(err)
    }
}

/// Extension trait for adding context to Results.
#[allow(clippy::result_large_err)]
pub trait ResultExt<T> {
    /// Attach a context message on error.
    fn context(self, msg: impl Into<String>) -> Result<T>;
    /// Attach context message computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_message(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_message(f()))
    }
}

/// A specialized Result type for rivulet operations.
#[allow(clippy::result_large_err)]
pub type Result<T> = core::result::Result<T, Error>;
