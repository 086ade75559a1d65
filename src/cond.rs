use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A level-triggered condition event: `set`/`clear` flip a flag, `wait`
/// resolves immediately if the flag is already set and otherwise parks
/// until the next `set`. This stands in for the runtime's native condition
/// event described in spec §6 — waiters that arrive after `set` has been
/// called still return immediately, which a plain one-shot `Notify` does
/// not give you on its own.
///
/// `wait` returns `false` once the event has been torn down via
/// [`ConditionEvent::destroy`], matching "returns false if the event was
/// destroyed while waiting".
#[derive(Debug)]
pub struct ConditionEvent {
    flag: AtomicBool,
    destroyed: AtomicBool,
    notify: Notify,
    generation: AtomicUsize,
}

impl ConditionEvent {
    pub fn new(initially_set: bool) -> Arc<ConditionEvent> {
        Arc::new(ConditionEvent {
            flag: AtomicBool::new(initially_set),
            destroyed: AtomicBool::new(false),
            notify: Notify::new(),
            generation: AtomicUsize::new(0),
        })
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Waits until the event is set, returning `true`, or until the event
    /// is destroyed, returning `false`.
    pub async fn wait(&self) -> bool {
        loop {
            if self.destroyed.load(Ordering::SeqCst) {
                return false;
            }
            if self.flag.load(Ordering::SeqCst) {
                return true;
            }

            let gen_before = self.generation.load(Ordering::SeqCst);
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Re-check under the notified future to avoid missing a `set`
            // that raced between the flag load above and subscribing.
            if self.flag.load(Ordering::SeqCst) || self.destroyed.load(Ordering::SeqCst) {
                continue;
            }
            if self.generation.load(Ordering::SeqCst) != gen_before {
                continue;
            }
            notified.await;
        }
    }

    /// Wakes every waiter permanently with a negative result. Used by
    /// `close()` to release any blocked `send`/`recv`/`accept`.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}
