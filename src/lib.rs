//! Rivulet: push-based reactive streams on virtual processor units.
//!
//! # Overview
//!
//! A [`Stream`] describes a source of items that are pushed to a subscriber,
//! followed by at most one terminal signal. Streams are cold and
//! re-subscribable; operators compose them without running anything.
//! Cancellation flows upstream and every subscription ends exactly once.
//!
//! Work that should not run inline is handed to a
//! [`VirtualProcessorUnit`]: a named execution context whose executor
//! decides when queued tasks run. Timers go through a pluggable
//! [`time::Scheduler`], so tests can drive virtual time deterministically.
//!
//! # Core Guarantees
//!
//! - **Ordered signals**: `on_subscribe` first, items next, one terminal last
//! - **Single termination**: cancel and terminal signals are each delivered once
//! - **No recursion on drain**: concat, repeat and executor rounds loop instead
//! - **One current VPU**: nested activation on a thread is a protocol violation
//! - **Deterministic time**: a virtual clock advances only when told to
//!
//! # Module Structure
//!
//! - [`stream`]: the push protocol, sources and operators
//! - [`hub`]: broadcast hubs, connectable streams and `share`
//! - [`vpu`]: virtual processor units, tasks and executors
//! - [`time`]: timer schedulers over wall-clock or virtual time
//! - [`config`]: engine configuration, per thread
//! - [`error`](mod@error): the error type carried by error signals
//! - [`invariant`]: protocol violations and the checks that raise them
//! - [`uncaught`]: process-wide handlers for errors nobody subscribed to
//! - [`util`]: the growable ring buffer
//! - [`tracing_compat`]: optional tracing integration (requires `tracing-integration` feature)

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod error;
pub mod hub;
pub mod invariant;
pub mod stream;
pub mod time;
pub mod tracing_compat;
pub mod uncaught;
pub mod util;
pub mod vpu;

#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

pub use config::{ConfigError, EngineConfig, Environment};
pub use error::{Error, ErrorKind, Result};
pub use hub::{ConnectableStream, Hub, MulticastSubject};
pub use invariant::ProtocolViolation;
pub use stream::{EventEmitter, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};
pub use time::{Cancelable, Scheduler, TimerScheduler, VirtualClock};
pub use uncaught::{UncaughtErrorHandler, add_uncaught_error_handler, remove_uncaught_error_handler};
pub use vpu::{Task, VirtualProcessorUnit};
