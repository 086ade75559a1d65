//! The timer driver (spec §4.4): after every state-affecting event, the
//! owning session recomputes KCP's next-update deadline and reschedules.
//!
//! Rather than model `call_later`/`cancel_call` as opaque ids, the driver
//! is a single background task per session that sleeps until the next
//! deadline, waking early whenever `kick` is called (a mutation happened
//! and the deadline may have moved closer). This keeps the "at most one
//! outstanding timer per session" invariant trivially true: there's
//! exactly one task, ever, for the session's lifetime.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;

pub(crate) struct UpdateTimer {
    kick: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl UpdateTimer {
    /// Spawns the driver task. `next_deadline` returns how long to sleep
    /// before the next fire (recomputed via `Kcp::check`); `on_fire` runs
    /// the spec §4.4 steps 1-5 and is called once per elapsed deadline.
    pub fn spawn<F, Fut, D>(mut next_deadline: D, mut on_fire: F) -> UpdateTimer
    where
        D: FnMut() -> Duration + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let kick = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let task_kick = kick.clone();
        let task_stopped = stopped.clone();
        let task = tokio::spawn(async move {
            loop {
                if task_stopped.load(Ordering::SeqCst) {
                    return;
                }

                let sleep = time::sleep(next_deadline());
                tokio::pin!(sleep);

                tokio::select! {
                    _ = &mut sleep => {
                        if task_stopped.load(Ordering::SeqCst) {
                            return;
                        }
                        on_fire().await;
                    }
                    _ = task_kick.notified() => {
                        // Just loop: next_deadline() is re-evaluated against
                        // whatever state the kick's caller just changed.
                    }
                }
            }
        });

        UpdateTimer { kick, stopped, task }
    }

    /// Wakes the driver loop so it re-reads the deadline immediately,
    /// without necessarily firing an update. Called after `send` enqueues
    /// data, after an inbound datagram is handled, and on any other
    /// state-affecting event (spec §4.4).
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Cancels the single outstanding timer and stops the driver task.
    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.task.abort();
        self.kick.notify_one();
    }
}

impl Drop for UpdateTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
