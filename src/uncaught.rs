//! Process-wide registry for errors that have no downstream listener.
//!
//! Errors reach this registry when a `for_each` terminal subscriber receives
//! `on_error`, or when a VPU task body returns `Err`. Every registered handler
//! sees every report; a handler that panics is logged and the remaining
//! handlers still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use crate::config;
use crate::error::Error;
use crate::invariant::ProtocolViolation;
use crate::tracing_compat::error;

/// Callback invoked with every uncaught error.
pub type UncaughtErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

static HANDLERS: LazyLock<Mutex<Vec<UncaughtErrorHandler>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

/// Registers a handler. Registering the same handler twice is a violation.
pub fn add_uncaught_error_handler(handler: UncaughtErrorHandler) -> Result<(), ProtocolViolation> {
    let mut handlers = HANDLERS.lock();
    if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
        return Err(ProtocolViolation::DuplicateErrorHandler);
    }
    handlers.push(handler);
    Ok(())
}

/// Unregisters a handler previously passed to [`add_uncaught_error_handler`].
pub fn remove_uncaught_error_handler(
    handler: &UncaughtErrorHandler,
) -> Result<(), ProtocolViolation> {
    let mut handlers = HANDLERS.lock();
    let index = handlers
        .iter()
        .position(|h| Arc::ptr_eq(h, handler))
        .ok_or(ProtocolViolation::UnknownErrorHandler)?;
    handlers.remove(index);
    Ok(())
}

/// Delivers `err` to every handler, unless uncaught-error handling is
/// disabled for this thread.
pub fn report_uncaught_error(err: &Error) {
    if !config::uncaught_error_handlers_enabled() {
        return;
    }
    error!(error = %err, "uncaught error");
    // Handlers may register or remove handlers; run them outside the lock.
    let handlers: Vec<UncaughtErrorHandler> = HANDLERS.lock().clone();
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
            error!(error = %err, "uncaught error handler panicked");
        }
    }
}
