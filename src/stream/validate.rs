//! Protocol validation for subscribers.
//!
//! [`ValidatingSubscriber`] tracks the signal sequence one subscriber sees
//! and reports a [`ProtocolViolation`] for anything out of order: a second
//! `on_subscribe`, an item before subscription, or any signal after a
//! terminal one.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::Error;
use crate::invariant::{self, ProtocolViolation};

use super::protocol::{Subscriber, SubscriberRef, SubscriptionRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Created,
    SubscribeStarted,
    SubscribeCompleted,
    Errored,
    Completed,
}

impl SignalState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::SubscribeStarted => "SubscribeStarted",
            Self::SubscribeCompleted => "SubscribeCompleted",
            Self::Errored => "Errored",
            Self::Completed => "Completed",
        }
    }
}

/// Wraps a subscriber and checks the order of the signals it receives.
pub struct ValidatingSubscriber<T> {
    inner: SubscriberRef<T>,
    label: Option<Rc<str>>,
    state: Cell<SignalState>,
}

impl<T> ValidatingSubscriber<T> {
    /// Wraps `inner`; `label` names the stream in violation messages.
    pub fn new(inner: SubscriberRef<T>, label: Option<Rc<str>>) -> Self {
        Self {
            inner,
            label,
            state: Cell::new(SignalState::Created),
        }
    }

    fn label(&self) -> String {
        self.label
            .as_deref()
            .map_or_else(|| "subscriber".to_string(), ToString::to_string)
    }

    fn check_terminal(&self, signal: &'static str, next: SignalState) {
        let state = self.state.get();
        if state != SignalState::SubscribeCompleted {
            invariant::fail(&ProtocolViolation::TerminalInState {
                subscriber: self.label(),
                signal,
                state: state.as_str(),
            });
        }
        self.state.set(next);
    }
}

impl<T> Subscriber<T> for ValidatingSubscriber<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        let state = self.state.get();
        if state != SignalState::Created {
            invariant::fail(&ProtocolViolation::SubscribeInState {
                subscriber: self.label(),
                state: state.as_str(),
            });
        }
        self.state.set(SignalState::SubscribeStarted);
        self.inner.on_subscribe(subscription);
        if self.state.get() == SignalState::SubscribeStarted {
            self.state.set(SignalState::SubscribeCompleted);
        }
    }

    fn on_next(&self, item: T) {
        let state = self.state.get();
        if state != SignalState::SubscribeCompleted {
            invariant::fail(&ProtocolViolation::NextInState {
                subscriber: self.label(),
                state: state.as_str(),
            });
        }
        self.inner.on_next(item);
    }

    fn on_error(&self, error: Error) {
        self.check_terminal("on_error", SignalState::Errored);
        self.inner.on_error(error);
    }

    fn on_complete(&self) {
        self.check_terminal("on_complete", SignalState::Completed);
        self.inner.on_complete();
    }
}
