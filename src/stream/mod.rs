//! Push-based streams and their operators.
//!
//! A [`Stream`] is a cold description: nothing runs until it is
//! subscribed, and each subscription is an independent execution. Operators
//! are inherent methods that wrap the upstream stream in a new stage.
//!
//! # Module Structure
//!
//! - [`protocol`]: the subscriber/subscription contract and [`Stream`]
//! - [`source`]: streams built from values, callbacks and timers
//! - `filter`, `transform`, `completion`: item-level operators
//! - `peek`: side-effect hooks on every signal
//! - `recover`, `timeout`: error handling and resubscription
//! - `rate`: `throttle`, `debounce`, `sample`
//! - `flatten`: streams of streams (`merge`, `concat`, `switch`, `exhaust`)
//! - `hop`: `subscribe_on` and `observe_on`

pub mod protocol;
pub mod source;
pub mod subscriber;
pub mod validate;

mod completion;
mod filter;
mod flatten;
mod hop;
mod peek;
mod rate;
mod recover;
mod timeout;
mod transform;

pub use flatten::{DEFAULT_MAX_CONCURRENCY, concat, merge};
pub use protocol::{EventEmitter, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};
pub use source::{
    Emitter, create, empty, fail, from_action, from_fn, from_result, generate, never, of, of_option, periodic,
    range,
};
pub use subscriber::{CancelHook, DoneSubscription, EmitterSubscriber, ForEachSubscriber};
pub use validate::ValidatingSubscriber;
