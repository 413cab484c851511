//! Side-effect hooks that observe a stream without changing it.
//!
//! Each `peek_*` hook runs before the signal is forwarded, each `after_*`
//! hook after. Terminate hooks fire on error, completion and cancellation.

use std::rc::{Rc, Weak};

use crate::error::Error;

use super::protocol::{Downstream, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};

enum Hook<T> {
    Subscribe(Rc<dyn Fn()>),
    Next(Rc<dyn Fn(&T)>, Option<fn(&T) -> T>),
    Error(Rc<dyn Fn(&Error)>),
    Complete(Rc<dyn Fn()>),
    Cancel(Rc<dyn Fn()>),
    Terminate(Rc<dyn Fn()>),
}

impl<T> Clone for Hook<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Subscribe(f) => Self::Subscribe(Rc::clone(f)),
            Self::Next(f, copy) => Self::Next(Rc::clone(f), *copy),
            Self::Error(f) => Self::Error(Rc::clone(f)),
            Self::Complete(f) => Self::Complete(Rc::clone(f)),
            Self::Cancel(f) => Self::Cancel(Rc::clone(f)),
            Self::Terminate(f) => Self::Terminate(Rc::clone(f)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum When {
    Before,
    After,
}

struct PeekSource<T> {
    upstream: Stream<T>,
    hook: Hook<T>,
    when: When,
}

impl<T: 'static> Source<T> for PeekSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this| PeekStage {
            this: this.clone(),
            link: Downstream::new(subscriber),
            hook: self.hook.clone(),
            when: self.when,
        });
        self.upstream.subscribe_rc(stage.clone());
        stage
    }
}

struct PeekStage<T> {
    this: Weak<Self>,
    link: Downstream<T>,
    hook: Hook<T>,
    when: When,
}

impl<T: 'static> PeekStage<T> {
    /// Runs `forward` with the matching hook around it.
    fn around(&self, hook: Option<&Rc<dyn Fn()>>, forward: impl FnOnce()) {
        match (hook, self.when) {
            (Some(hook), When::Before) => {
                hook();
                forward();
            }
            (Some(hook), When::After) => {
                forward();
                hook();
            }
            (None, _) => forward(),
        }
    }

    fn terminal_hook(&self, complete: bool) -> Option<&Rc<dyn Fn()>> {
        match &self.hook {
            Hook::Complete(hook) if complete => Some(hook),
            Hook::Terminate(hook) => Some(hook),
            _ => None,
        }
    }
}

impl<T: 'static> Subscriber<T> for PeekStage<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        self.link.set_upstream(subscription);
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let hook = match &self.hook {
            Hook::Subscribe(hook) => Some(hook),
            _ => None,
        };
        self.around(hook, || self.link.subscribe(this));
    }

    fn on_next(&self, item: T) {
        if self.link.is_done() {
            return;
        }
        match (&self.hook, self.when) {
            (Hook::Next(hook, _), When::Before) => {
                hook(&item);
                self.link.next(item);
            }
            (Hook::Next(hook, Some(copy)), When::After) => {
                let seen = copy(&item);
                self.link.next(item);
                hook(&seen);
            }
            _ => self.link.next(item),
        }
    }

    fn on_error(&self, error: Error) {
        if self.link.is_done() {
            return;
        }
        if let Hook::Error(hook) = &self.hook {
            match self.when {
                When::Before => {
                    hook(&error);
                    self.link.error(error);
                }
                When::After => {
                    let seen = error.clone();
                    self.link.error(error);
                    hook(&seen);
                }
            }
            return;
        }
        self.around(self.terminal_hook(false), || self.link.error(error));
    }

    fn on_complete(&self) {
        if self.link.is_done() {
            return;
        }
        self.around(self.terminal_hook(true), || self.link.complete());
    }
}

impl<T: 'static> Subscription for PeekStage<T> {
    fn cancel(&self) {
        if self.link.is_done() {
            return;
        }
        let hook = match &self.hook {
            Hook::Cancel(hook) | Hook::Terminate(hook) => Some(hook),
            _ => None,
        };
        self.around(hook, || self.link.cancel());
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

impl<T: 'static> Stream<T> {
    fn peek_stage(self, prefix: &str, hook: Hook<T>, when: When) -> Self {
        Self::stage(
            PeekSource {
                upstream: self,
                hook,
                when,
            },
            prefix,
            None,
        )
    }

    /// Runs `hook` before `on_subscribe` is forwarded.
    #[must_use]
    pub fn peek_subscribe(self, hook: impl Fn() + 'static) -> Self {
        self.peek_stage("peek_subscribe", Hook::Subscribe(Rc::new(hook)), When::Before)
    }

    /// Runs `hook` after `on_subscribe` was forwarded.
    #[must_use]
    pub fn after_subscribe(self, hook: impl Fn() + 'static) -> Self {
        self.peek_stage("after_subscribe", Hook::Subscribe(Rc::new(hook)), When::After)
    }

    /// Runs `hook` on each item before forwarding it.
    #[must_use]
    pub fn peek(self, hook: impl Fn(&T) + 'static) -> Self {
        self.peek_stage("peek", Hook::Next(Rc::new(hook), None), When::Before)
    }

    /// Runs `hook` on a copy of each item after forwarding it.
    #[must_use]
    pub fn after_next(self, hook: impl Fn(&T) + 'static) -> Self
    where
        T: Clone,
    {
        self.peek_stage(
            "after_next",
            Hook::Next(Rc::new(hook), Some(T::clone)),
            When::After,
        )
    }

    /// Runs `hook` before an error is forwarded.
    #[must_use]
    pub fn peek_error(self, hook: impl Fn(&Error) + 'static) -> Self {
        self.peek_stage("peek_error", Hook::Error(Rc::new(hook)), When::Before)
    }

    /// Runs `hook` after an error was forwarded.
    #[must_use]
    pub fn after_error(self, hook: impl Fn(&Error) + 'static) -> Self {
        self.peek_stage("after_error", Hook::Error(Rc::new(hook)), When::After)
    }

    /// Runs `hook` before completion is forwarded.
    #[must_use]
    pub fn peek_complete(self, hook: impl Fn() + 'static) -> Self {
        self.peek_stage("peek_complete", Hook::Complete(Rc::new(hook)), When::Before)
    }

    /// Runs `hook` after completion was forwarded.
    #[must_use]
    pub fn after_complete(self, hook: impl Fn() + 'static) -> Self {
        self.peek_stage("after_complete", Hook::Complete(Rc::new(hook)), When::After)
    }

    /// Runs `hook` before a downstream cancel travels upstream.
    #[must_use]
    pub fn peek_cancel(self, hook: impl Fn() + 'static) -> Self {
        self.peek_stage("peek_cancel", Hook::Cancel(Rc::new(hook)), When::Before)
    }

    /// Runs `hook` after a downstream cancel travelled upstream.
    #[must_use]
    pub fn after_cancel(self, hook: impl Fn() + 'static) -> Self {
        self.peek_stage("after_cancel", Hook::Cancel(Rc::new(hook)), When::After)
    }

    /// Runs `hook` before an error, a completion or a cancel is forwarded.
    #[must_use]
    pub fn peek_terminate(self, hook: impl Fn() + 'static) -> Self {
        self.peek_stage("peek_terminate", Hook::Terminate(Rc::new(hook)), When::Before)
    }

    /// Runs `hook` after an error, a completion or a cancel was forwarded.
    #[must_use]
    pub fn after_terminate(self, hook: impl Fn() + 'static) -> Self {
        self.peek_stage("after_terminate", Hook::Terminate(Rc::new(hook)), When::After)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::stream::{self, Subscriber, SubscriptionRef};
    use crate::test_utils::{RecordingSubscriber, init_test_logging, install_development_config};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn init_test(name: &str) {
        init_test_logging();
        install_development_config();
        crate::test_phase!(name);
    }

    /// Logs its own signals into a shared journal.
    struct Journal(Rc<RefCell<Vec<String>>>);

    impl Subscriber<i32> for Journal {
        fn on_subscribe(&self, _subscription: SubscriptionRef) {
            self.0.borrow_mut().push("subscribe".into());
        }

        fn on_next(&self, item: i32) {
            self.0.borrow_mut().push(format!("next {item}"));
        }

        fn on_error(&self, _error: Error) {
            self.0.borrow_mut().push("error".into());
        }

        fn on_complete(&self) {
            self.0.borrow_mut().push("complete".into());
        }
    }

    fn push(journal: &Rc<RefCell<Vec<String>>>, entry: &'static str) -> impl Fn() + 'static {
        let journal = Rc::clone(journal);
        move || journal.borrow_mut().push(entry.into())
    }

    #[test]
    fn before_and_after_hooks_bracket_the_signal() {
        init_test("before_and_after_hooks_bracket_the_signal");
        let journal = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&journal);
        let after_seen = Rc::clone(&journal);
        stream::of([1])
            .peek_subscribe(push(&journal, "peek_subscribe"))
            .after_subscribe(push(&journal, "after_subscribe"))
            .peek(move |v| seen.borrow_mut().push(format!("peek {v}")))
            .after_next(move |v| after_seen.borrow_mut().push(format!("after {v}")))
            .peek_complete(push(&journal, "peek_complete"))
            .after_complete(push(&journal, "after_complete"))
            .subscribe(Journal(Rc::clone(&journal)));
        let expected = vec![
            "peek_subscribe",
            "subscribe",
            "after_subscribe",
            "peek 1",
            "next 1",
            "after 1",
            "peek_complete",
            "complete",
            "after_complete",
        ];
        let actual = journal.borrow().clone();
        crate::assert_with_log!(actual == expected, "order", expected, actual);
        crate::test_complete!("before_and_after_hooks_bracket_the_signal");
    }

    #[test]
    fn error_hooks_see_the_error() {
        init_test("error_hooks_see_the_error");
        let journal = Rc::new(RefCell::new(Vec::new()));
        let before = Rc::clone(&journal);
        let after = Rc::clone(&journal);
        stream::fail::<i32>(Error::user("bad"))
            .peek_error(move |e| before.borrow_mut().push(format!("peek {}", e.message().unwrap_or(""))))
            .after_error(move |e| after.borrow_mut().push(format!("after {}", e.message().unwrap_or(""))))
            .subscribe(Journal(Rc::clone(&journal)));
        let expected = vec!["subscribe", "peek bad", "error", "after bad"];
        let actual = journal.borrow().clone();
        crate::assert_with_log!(actual == expected, "order", expected, actual);
        crate::test_complete!("error_hooks_see_the_error");
    }

    #[test]
    fn terminate_hooks_fire_on_cancel_once() {
        init_test("terminate_hooks_fire_on_cancel_once");
        let journal = Rc::new(RefCell::new(Vec::new()));
        let recorder = RecordingSubscriber::<i32>::new();
        let subscription = stream::never()
            .peek_cancel(push(&journal, "peek_cancel"))
            .after_cancel(push(&journal, "after_cancel"))
            .peek_terminate(push(&journal, "peek_terminate"))
            .subscribe_rc(recorder.clone());
        subscription.cancel();
        subscription.cancel();
        let expected = vec!["peek_terminate", "peek_cancel", "after_cancel"];
        let actual = journal.borrow().clone();
        crate::assert_with_log!(actual == expected, "order", expected, actual);
        crate::test_complete!("terminate_hooks_fire_on_cancel_once");
    }

    #[test]
    fn after_terminate_fires_on_completion() {
        init_test("after_terminate_fires_on_completion");
        let journal = Rc::new(RefCell::new(Vec::new()));
        stream::of([5])
            .after_terminate(push(&journal, "after_terminate"))
            .subscribe(Journal(Rc::clone(&journal)));
        let expected = vec!["subscribe", "next 5", "complete", "after_terminate"];
        let actual = journal.borrow().clone();
        crate::assert_with_log!(actual == expected, "order", expected, actual);
        crate::test_complete!("after_terminate_fires_on_completion");
    }
}
