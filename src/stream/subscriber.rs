//! Terminal subscribers and small subscription types.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::Error;
use crate::tracing_compat::warn;
use crate::uncaught;

use super::protocol::{EventEmitter, Subscriber, Subscription, SubscriptionRef};

/// A subscription that is already done; cancelling it does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DoneSubscription;

impl Subscription for DoneSubscription {
    fn cancel(&self) {}

    fn is_done(&self) -> bool {
        true
    }
}

/// A subscription that runs a hook on its first cancel.
pub struct CancelHook {
    hook: RefCell<Option<Box<dyn FnOnce()>>>,
    done: Cell<bool>,
}

impl CancelHook {
    /// Creates a live subscription running `hook` when cancelled.
    pub fn new(hook: impl FnOnce() + 'static) -> Self {
        Self {
            hook: RefCell::new(Some(Box::new(hook))),
            done: Cell::new(false),
        }
    }

    /// Marks the subscription done without running the hook.
    pub fn finish(&self) {
        self.done.set(true);
        let hook = self.hook.borrow_mut().take();
        drop(hook);
    }
}

impl Subscription for CancelHook {
    fn cancel(&self) {
        if self.done.replace(true) {
            return;
        }
        let hook = self.hook.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn is_done(&self) -> bool {
        self.done.get()
    }
}

/// Runs an action per item and reports errors as uncaught.
pub struct ForEachSubscriber<T, F> {
    action: RefCell<F>,
    _item: PhantomData<fn(T)>,
}

impl<T, F: FnMut(T)> ForEachSubscriber<T, F> {
    /// Wraps `action`.
    pub const fn new(action: F) -> Self {
        Self {
            action: RefCell::new(action),
            _item: PhantomData,
        }
    }
}

impl<T, F: FnMut(T)> Subscriber<T> for ForEachSubscriber<T, F> {
    fn on_subscribe(&self, _subscription: SubscriptionRef) {}

    fn on_next(&self, item: T) {
        if let Ok(mut action) = self.action.try_borrow_mut() {
            action(item);
        } else {
            warn!("for_each action re-entered from its own emission; item dropped");
        }
    }

    fn on_error(&self, error: Error) {
        uncaught::report_uncaught_error(&error);
    }

    fn on_complete(&self) {}
}

/// Forwards signals to an [`EventEmitter`].
pub struct EmitterSubscriber<T> {
    emitter: Rc<dyn EventEmitter<T>>,
}

impl<T> EmitterSubscriber<T> {
    /// Wraps `emitter`.
    pub fn new(emitter: Rc<dyn EventEmitter<T>>) -> Self {
        Self { emitter }
    }
}

impl<T> Subscriber<T> for EmitterSubscriber<T> {
    fn on_subscribe(&self, _subscription: SubscriptionRef) {}

    fn on_next(&self, item: T) {
        if !self.emitter.is_done() {
            self.emitter.next(item);
        }
    }

    fn on_error(&self, error: Error) {
        if !self.emitter.is_done() {
            self.emitter.error(error);
        }
    }

    fn on_complete(&self) {
        if !self.emitter.is_done() {
            self.emitter.complete();
        }
    }
}
