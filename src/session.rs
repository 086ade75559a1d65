//! The per-peer session (spec §3, §4.3) plus the liveness/keepalive concern
//! folded into its update cycle (spec §4.4, §8 "C8").
//!
//! A `KcpSession` is the reliable-delivery engine for exactly one remote
//! peer: it owns a KCP control block, the three condition events, the
//! assembly buffer and the liveness timestamps. It knows nothing about
//! whether it's the single session of a connected client or one of many
//! children accepted by a listener — that role distinction lives in
//! `socket::KcpSocket`, which also enforces the "operation invalid for a
//! child" rules of spec §4.7.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::cond::ConditionEvent;
use crate::config::KcpConfig;
use crate::error::{KcpResult, KcpSocketError};
use crate::framing;
use crate::skcp::KcpIo;
use crate::timer::UpdateTimer;

/// Outcome of handing one inbound datagram to a session, used by the
/// multiplexer (spec §4.5) to decide whether to keep demuxing to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramOutcome {
    Continue,
    Closed,
}

pub(crate) struct KcpSession {
    kcp: Mutex<KcpIo>,
    connected: AtomicBool,

    pub(crate) sending_queue_empty: Arc<ConditionEvent>,
    pub(crate) sending_queue_not_full: Arc<ConditionEvent>,
    pub(crate) receiving_queue_not_empty: Arc<ConditionEvent>,

    recv_buffer: Mutex<Vec<u8>>,
    water_line: usize,

    zero_timestamp: Instant,
    last_active_ms: AtomicU64,
    last_keepalive_ms: AtomicU64,
    teardown: Duration,
    keepalive_interval: Duration,

    compression: AtomicBool,

    remote_addr: SocketAddr,
    udp: Arc<UdpSocket>,

    error: Mutex<Option<KcpSocketError>>,

    timer: UpdateTimer,
    /// Only `Some` for a client-connected master session, which owns an
    /// exclusive receive loop. Children are demuxed by the listener's
    /// shared loop and never own one of these.
    receive_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl KcpSession {
    pub fn new(conv: u32, config: &KcpConfig, remote_addr: SocketAddr, udp: Arc<UdpSocket>) -> Arc<KcpSession> {
        Arc::new_cyclic(|weak| {
            let kcp = Mutex::new(KcpIo::new(conv, config));
            let zero_timestamp = Instant::now();

            let timer_weak = weak.clone();
            let deadline_weak = weak.clone();
            let timer = UpdateTimer::spawn(
                move || {
                    deadline_weak
                        .upgrade()
                        .map(|session| session.next_deadline())
                        .unwrap_or(Duration::from_secs(1))
                },
                move || {
                    let session = timer_weak.upgrade();
                    async move {
                        if let Some(session) = session {
                            session.fire_update().await;
                        }
                    }
                },
            );

            KcpSession {
                kcp,
                connected: AtomicBool::new(true),
                sending_queue_empty: ConditionEvent::new(true),
                sending_queue_not_full: ConditionEvent::new(true),
                receiving_queue_not_empty: ConditionEvent::new(false),
                recv_buffer: Mutex::new(Vec::new()),
                water_line: config.water_line,
                zero_timestamp,
                last_active_ms: AtomicU64::new(0),
                last_keepalive_ms: AtomicU64::new(0),
                teardown: config.session_expire,
                keepalive_interval: config.keepalive_interval,
                compression: AtomicBool::new(config.compression),
                remote_addr,
                udp,
                error: Mutex::new(None),
                timer,
                receive_task: AsyncMutex::new(None),
            }
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_compression(&self, enabled: bool) {
        self.compression.store(enabled, Ordering::Relaxed);
    }

    pub fn compression(&self) -> bool {
        self.compression.load(Ordering::Relaxed)
    }

    pub async fn set_receive_task(&self, handle: JoinHandle<()>) {
        *self.receive_task.lock().await = Some(handle);
    }

    pub fn current_error(&self) -> KcpSocketError {
        self.error
            .lock()
            .unwrap()
            .as_ref()
            .map(clone_error)
            .unwrap_or(KcpSocketError::InvalidState)
    }

    fn now_ms(&self) -> u64 {
        self.zero_timestamp.elapsed().as_millis() as u64
    }

    /// The 32-bit KCP clock: wall-clock milliseconds since this session's
    /// zero timestamp, truncated to 32 bits (spec §4.4, GLOSSARY "now32").
    fn now32(&self) -> u32 {
        self.now_ms() as u32
    }

    fn touch_last_active(&self) {
        self.last_active_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    fn next_deadline(&self) -> Duration {
        let now32 = self.now32();
        let deadline32 = self.kcp.lock().unwrap().check(now32);
        Duration::from_millis(deadline32.wrapping_sub(now32) as u64)
    }

    /// Enqueues `bytes` into KCP in chunks of at most 8192 bytes (spec
    /// §4.3). Returns the total number of bytes accepted.
    pub async fn send(self: &Arc<Self>, mut bytes: &[u8], all: bool) -> KcpResult<usize> {
        let mut accepted = 0usize;

        while !bytes.is_empty() {
            if !self.is_connected() {
                return if accepted > 0 { Ok(accepted) } else { Err(self.current_error()) };
            }

            let chunk_len = bytes.len().min(8192);
            let chunk = &bytes[..chunk_len];

            let accepted_chunk = {
                let mut kcp = self.kcp.lock().unwrap();
                kcp.send(chunk)
            };

            match accepted_chunk {
                Ok(_) => {
                    accepted += chunk_len;
                    bytes = &bytes[chunk_len..];
                    self.fire_update().await;
                }
                Err(_) => {
                    // KCP's send window is full. With `all == false` and at
                    // least one earlier chunk already accepted, return what
                    // we have so far; otherwise (including the `accepted ==
                    // 0` case, regardless of `all`) fall through and retry
                    // once the window drains, matching the original
                    // `KcpSocketPrivate::send`'s `updateKcp()` +
                    // `sendingQueueEmpty->wait()` retry loop.
                    if accepted > 0 && !all {
                        return Ok(accepted);
                    }
                    self.fire_update().await;
                    if !self.sending_queue_empty.wait().await {
                        return if accepted > 0 { Ok(accepted) } else { Err(self.current_error()) };
                    }
                }
            }
        }

        let waitsnd = self.kcp.lock().unwrap().wait_snd();
        if waitsnd as f64 > self.water_line as f64 * 1.2 {
            self.sending_queue_not_full.clear();
        }
        if !self.sending_queue_not_full.wait().await && accepted == 0 {
            return Err(self.current_error());
        }

        Ok(accepted)
    }

    /// Drains ready KCP messages into the assembly buffer and copies out
    /// up to `buf.len()` bytes (spec §4.3).
    pub async fn recv(self: &Arc<Self>, buf: &mut [u8], all: bool) -> KcpResult<usize> {
        loop {
            self.drain_kcp_into_assembly();

            {
                let mut assembly = self.recv_buffer.lock().unwrap();
                if !assembly.is_empty() && (!all || assembly.len() >= buf.len()) {
                    let n = buf.len().min(assembly.len());
                    buf[..n].copy_from_slice(&assembly[..n]);
                    assembly.drain(..n);
                    return Ok(n);
                }
            }

            if !self.is_connected() {
                return Err(self.current_error());
            }

            self.receiving_queue_not_empty.clear();
            if !self.receiving_queue_not_empty.wait().await {
                return Err(self.current_error());
            }
        }
    }

    fn drain_kcp_into_assembly(&self) {
        let mut kcp = self.kcp.lock().unwrap();
        loop {
            let peek = match kcp.peek_size() {
                Ok(n) => n,
                Err(_) => return,
            };
            let mut msg = vec![0u8; peek];
            match kcp.recv(&mut msg) {
                Ok(n) => {
                    msg.truncate(n);
                    self.recv_buffer.lock().unwrap().extend_from_slice(&msg);
                }
                Err(_) => return,
            }
        }
    }

    /// Hands one inbound datagram (still wrapped in our envelope) to this
    /// session (spec §4.5, §4.1).
    pub async fn handle_datagram(self: &Arc<Self>, buf: &[u8]) -> DatagramOutcome {
        match framing::decode(buf) {
            framing::Envelope::Invalid => {
                trace!("dropping invalid datagram from {}", self.remote_addr);
                DatagramOutcome::Continue
            }
            framing::Envelope::Close => {
                debug!("peer {} sent CLOSE", self.remote_addr);
                self.force_close(KcpSocketError::RemoteHostClosed).await;
                DatagramOutcome::Closed
            }
            framing::Envelope::Keepalive => {
                self.touch_last_active();
                DatagramOutcome::Continue
            }
            framing::Envelope::Data { compressed, payload } => {
                let segment = if compressed {
                    match framing::decode_owned(buf) {
                        Some(s) => s,
                        None => return DatagramOutcome::Continue,
                    }
                } else {
                    payload.to_vec()
                };

                let input_result = self.kcp.lock().unwrap().input(&segment);
                match input_result {
                    Ok(_) => {
                        self.touch_last_active();
                        self.receiving_queue_not_empty.set();
                        self.fire_update().await;
                        DatagramOutcome::Continue
                    }
                    Err(e) => {
                        trace!("kcp.input rejected datagram from {}: {}", self.remote_addr, e);
                        DatagramOutcome::Continue
                    }
                }
            }
        }
    }

    /// Writes a complete envelope to the peer, retrying on a partial
    /// datagram write within this call (spec §7 propagation policy).
    async fn raw_send(&self, packet: &[u8]) -> std::io::Result<()> {
        self.last_keepalive_ms.store(self.now_ms(), Ordering::SeqCst);
        let mut sent = 0;
        while sent < packet.len() {
            sent += self.udp.send_to(&packet[sent..], self.remote_addr).await?;
        }
        Ok(())
    }

    /// The shared update cycle (spec §4.4): called from the timer driver
    /// on every elapsed deadline, and directly after any event that
    /// mutates KCP state (`send`, inbound datagram) for the "every
    /// successful chunk triggers update" requirement of spec §4.3.
    async fn fire_update(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }

        let now_ms = self.now_ms();
        if now_ms.saturating_sub(self.last_active_ms.load(Ordering::SeqCst)) > self.teardown.as_millis() as u64 {
            debug!("session {} idle past teardown, tearing down", self.remote_addr);
            self.force_close(KcpSocketError::NetworkTimeout).await;
            return;
        }

        let now32 = self.now32();
        let segments = {
            let mut kcp = self.kcp.lock().unwrap();
            if kcp.update(now32).is_err() {
                None
            } else {
                Some(kcp.drain_output())
            }
        };

        let segments = match segments {
            Some(s) => s,
            None => {
                self.force_close(KcpSocketError::InvalidState).await;
                return;
            }
        };

        for segment in segments {
            let packet = framing::encode_data(&segment, self.compression());
            if let Err(e) = self.raw_send(&packet).await {
                error!("raw send failed for {}, force-closing: {}", self.remote_addr, e);
                self.force_close(KcpSocketError::Io(e)).await;
                return;
            }
        }

        if now_ms.saturating_sub(self.last_keepalive_ms.load(Ordering::SeqCst)) > self.keepalive_interval.as_millis() as u64 {
            let packet = framing::encode_keepalive();
            if let Err(e) = self.raw_send(&packet).await {
                error!("keepalive send failed for {}, force-closing: {}", self.remote_addr, e);
                self.force_close(KcpSocketError::Io(e)).await;
                return;
            }
        }

        self.recompute_send_events();
        self.timer.kick();
    }

    fn recompute_send_events(&self) {
        let waitsnd = self.kcp.lock().unwrap().wait_snd();
        if waitsnd == 0 {
            self.sending_queue_empty.set();
            self.sending_queue_not_full.set();
        } else {
            self.sending_queue_empty.clear();
            if waitsnd > self.water_line {
                self.sending_queue_not_full.clear();
            } else {
                self.sending_queue_not_full.set();
            }
        }
    }

    /// Graceful close (spec §4.3's `Connected` transition). Drains
    /// outstanding sends, emits a CLOSE envelope, then tears down.
    pub async fn close(self: &Arc<Self>, force: bool) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        if !force {
            self.timer.kick();
            let _ = self.sending_queue_empty.wait().await;
            let packet = framing::encode_close();
            let _ = self.raw_send(&packet).await;
        }

        self.teardown_resources().await;
    }

    /// Forced teardown driven by an internal failure (remote CLOSE, idle
    /// teardown, raw-send failure). Idempotent.
    pub async fn force_close(self: &Arc<Self>, err: KcpSocketError) {
        if self.connected.swap(false, Ordering::SeqCst) {
            *self.error.lock().unwrap() = Some(err);
            self.teardown_resources().await;
        }
    }

    async fn teardown_resources(&self) {
        self.timer.cancel();
        if let Some(task) = self.receive_task.lock().await.take() {
            task.abort();
        }
        self.sending_queue_empty.destroy();
        self.sending_queue_not_full.destroy();
        self.receiving_queue_not_empty.destroy();
    }

    /// `sending_queue_empty.is_set() <=> kcp.waitsnd() == 0` (spec §8
    /// property 3), exposed for tests.
    #[cfg(test)]
    pub(crate) fn wait_snd(&self) -> usize {
        self.kcp.lock().unwrap().wait_snd()
    }
}

fn clone_error(err: &KcpSocketError) -> KcpSocketError {
    match err {
        KcpSocketError::Io(e) => KcpSocketError::Io(std::io::Error::new(e.kind(), e.to_string())),
        KcpSocketError::Kcp(_) => KcpSocketError::InvalidState,
        KcpSocketError::SocketAccessError => KcpSocketError::SocketAccessError,
        KcpSocketError::RemoteHostClosed => KcpSocketError::RemoteHostClosed,
        KcpSocketError::NetworkTimeout => KcpSocketError::NetworkTimeout,
        KcpSocketError::InvalidState => KcpSocketError::InvalidState,
    }
}
