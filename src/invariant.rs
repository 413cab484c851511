//! Protocol invariants and the fail-fast checking layer.
//!
//! Violations of the stream protocol, the hub terminal-state rule, the task
//! queue discipline or the single-active-VPU rule are programming errors. They
//! are described by [`ProtocolViolation`] and handled here:
//!
//! - [`check`] / [`check_api`] evaluate a condition only when the matching
//!   configuration flag is on, and panic with the violation when it fails.
//!   With checks off the condition closure is never built, so production
//!   configurations pay nothing.
//! - [`fail`] reports a violation already detected by a `Result`-returning API:
//!   panic when checks are on, log and continue otherwise.
//! - [`fatal`] is for conditions that are fatal in every configuration.

use crate::config;
use crate::error::Error;
use crate::tracing_compat::{error, warn};

/// A broken protocol rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// `on_subscribe` arrived when the subscriber was not freshly created.
    #[error("on_subscribe invoked on {subscriber} in state {state}, expected Created")]
    SubscribeInState {
        /// Subscriber description.
        subscriber: String,
        /// State at the time of the call.
        state: &'static str,
    },
    /// `on_next` arrived outside the subscribed state.
    #[error("on_next invoked on {subscriber} in state {state}, expected SubscribeCompleted")]
    NextInState {
        /// Subscriber description.
        subscriber: String,
        /// State at the time of the call.
        state: &'static str,
    },
    /// A terminal signal arrived outside the subscribed state.
    #[error("{signal} invoked on {subscriber} in state {state}, expected SubscribeCompleted")]
    TerminalInState {
        /// Subscriber description.
        subscriber: String,
        /// `on_error` or `on_complete`.
        signal: &'static str,
        /// State at the time of the call.
        state: &'static str,
    },
    /// A task was queued while it was already queued.
    #[error("task {task} queued while already queued")]
    TaskAlreadyQueued {
        /// Task name.
        task: String,
    },
    /// A disposed task was queued.
    #[error("task {task} queued after being disposed")]
    CancelledTaskQueued {
        /// Task name.
        task: String,
    },
    /// A VPU was activated while another was current.
    #[error("attempted to activate {requested} while {current} is already activated")]
    VpuAlreadyActive {
        /// VPU being activated.
        requested: String,
        /// VPU already current.
        current: String,
    },
    /// A VPU was deactivated while it was not current.
    #[error("attempted to deactivate {requested} but the current VPU is {current}")]
    VpuNotCurrent {
        /// VPU being deactivated.
        requested: String,
        /// VPU actually current, or `none`.
        current: String,
    },
    /// A direct executor received work while a different VPU was current.
    #[error("direct executor of {vpu} received a task while {current} is activated")]
    ForeignVpuActive {
        /// VPU owning the direct executor.
        vpu: String,
        /// VPU that is current.
        current: String,
    },
    /// An executor was initialised twice.
    #[error("executor of {vpu} initialised more than once")]
    ExecutorReinitialized {
        /// VPU owning the executor.
        vpu: String,
    },
    /// A task was queued on an executor that has no live VPU.
    #[error("task {task} queued on an executor without a live VPU")]
    ExecutorDetached {
        /// Name of the rejected task.
        task: String,
    },
    /// A hub received a signal after its terminal signal.
    #[error("{signal} invoked on hub {hub} after {terminal}")]
    HubSignalAfterTerminal {
        /// Hub description.
        hub: String,
        /// Offending call.
        signal: &'static str,
        /// Terminal signal already delivered.
        terminal: &'static str,
    },
    /// The same subscriber subscribed twice to a multicast hub.
    #[error("subscriber already subscribed to {hub}")]
    DuplicateSubscriber {
        /// Hub description.
        hub: String,
    },
    /// `connect` on an already connected stream.
    #[error("connect invoked on {stream} but it is already connected")]
    AlreadyConnected {
        /// Stream description.
        stream: String,
    },
    /// `disconnect` on a stream that is not connected.
    #[error("disconnect invoked on {stream} but it is not connected")]
    NotConnected {
        /// Stream description.
        stream: String,
    },
    /// The same uncaught-error handler was registered twice.
    #[error("uncaught error handler already registered")]
    DuplicateErrorHandler,
    /// An uncaught-error handler was removed but never registered.
    #[error("uncaught error handler is not registered")]
    UnknownErrorHandler,
    /// A fixed-rate schedule was requested with a zero period.
    #[error("schedule_at_fixed_rate requires a period greater than 0, got {period}")]
    ZeroPeriod {
        /// Period requested.
        period: u64,
    },
    /// An operator was built with an argument outside its domain.
    #[error("{operator}: {detail}")]
    InvalidArgument {
        /// Operator name.
        operator: &'static str,
        /// What was wrong.
        detail: String,
    },
}

/// Checks an internal invariant when invariant checking is enabled.
#[track_caller]
pub fn check(condition: bool, violation: impl FnOnce() -> ProtocolViolation) {
    if config::check_invariants() && !condition {
        panic!("{}", violation());
    }
}

/// Checks an API-usage invariant when API invariant checking is enabled.
#[track_caller]
pub fn check_api(condition: bool, violation: impl FnOnce() -> ProtocolViolation) {
    if config::check_api_invariants() && !condition {
        panic!("{}", violation());
    }
}

/// Reports a violation detected by a `Result`-returning API.
#[track_caller]
pub fn fail(violation: &ProtocolViolation) {
    if config::check_invariants() {
        panic!("{violation}");
    }
    warn!(%violation, "protocol violation ignored: invariant checks disabled");
}

/// Aborts the current activation for a condition that is fatal in every
/// configuration.
#[track_caller]
pub fn fatal(err: &Error) -> ! {
    error!(error = %err, "fatal engine error");
    panic!("{err}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn check_passes_when_condition_holds() {
        init_test("check_passes_when_condition_holds");
        check(true, || ProtocolViolation::DuplicateErrorHandler);
        crate::test_complete!("check_passes_when_condition_holds");
    }

    #[test]
    #[should_panic(expected = "uncaught error handler already registered")]
    fn check_panics_in_development() {
        config::install(EngineConfig::development());
        check(false, || ProtocolViolation::DuplicateErrorHandler);
    }

    #[test]
    fn check_is_skipped_in_production() {
        init_test("check_is_skipped_in_production");
        config::install(EngineConfig::production());
        let mut built = false;
        check(false, || {
            built = true;
            ProtocolViolation::DuplicateErrorHandler
        });
        crate::assert_with_log!(!built, "violation never built", false, built);
        fail(&ProtocolViolation::UnknownErrorHandler);
        config::install(EngineConfig::development());
        crate::test_complete!("check_is_skipped_in_production");
    }

    #[test]
    fn messages_name_the_offender() {
        init_test("messages_name_the_offender");
        let violation = ProtocolViolation::VpuAlreadyActive {
            requested: "b".into(),
            current: "a".into(),
        };
        let text = violation.to_string();
        crate::assert_with_log!(
            text == "attempted to activate b while a is already activated",
            "message",
            "attempted to activate b while a is already activated",
            text
        );
        crate::test_complete!("messages_name_the_offender");
    }
}
