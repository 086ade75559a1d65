//! The listener queue (spec §3, §4.6): a bounded FIFO of accepted sessions
//! waiting for `accept()`. `put` never blocks — the multiplexer checks
//! capacity before constructing a child session in the first place, so a
//! full queue just means the connection attempt is silently dropped (spec
//! §4.5, §9 "Ambiguities").

use std::net::SocketAddr;

use tokio::sync::{mpsc, Mutex};

use crate::session::KcpSession;
use std::sync::Arc;

type Accepted = (Arc<KcpSession>, SocketAddr);

pub(crate) struct AcceptQueue {
    tx: mpsc::Sender<Accepted>,
    rx: Mutex<mpsc::Receiver<Accepted>>,
    capacity: usize,
}

impl AcceptQueue {
    pub fn new(backlog: usize) -> AcceptQueue {
        let capacity = backlog.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        AcceptQueue {
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking put. Returns `false` (and drops the item) if the queue
    /// is already full — callers are expected to have already checked
    /// capacity before doing the (more expensive) work of constructing the
    /// session, matching spec §4.5's "otherwise silently drop".
    pub fn try_put(&self, item: Accepted) -> bool {
        self.tx.try_send(item).is_ok()
    }

    /// Blocks until a session is available, or returns `None` once the
    /// sending half (owned by the listener's receive task) is gone.
    pub async fn get(&self) -> Option<Accepted> {
        self.rx.lock().await.recv().await
    }
}
