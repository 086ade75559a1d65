//! The endpoint multiplexer (spec §4.5, "C5") and the polymorphic facade
//! (spec §4.7, "C7") combined into one public type, `KcpSocket`, the way
//! the original `KcpSocket`/`KcpSocketPrivate` pair does: one facade, a
//! tagged variant underneath picking master-vs-child behavior (spec §9
//! "Polymorphic dispatch").
//!
//! `KcpListener` and `KcpStream` are thin, role-narrowed views over the
//! same machinery, matching the public shape of `tokio_kcp::{KcpListener,
//! KcpStream}` that this crate is descended from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use log::{debug, error, trace};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::{KcpConfig, Mode};
use crate::error::{KcpResult, KcpSocketError};
use crate::listener::AcceptQueue;
use crate::session::{DatagramOutcome, KcpSession};

/// Mirrors the spec's state diagram (§3 data model). `Connecting` is never
/// actually observed by this implementation — `connect()` is synchronous,
/// like the original `MasterKcpSocketPrivate::connect` it's grounded on —
/// but the variant is kept so `state()` exposes the full state space the
/// spec names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closing,
}

impl SocketState {
    fn to_tag(self) -> u8 {
        match self {
            SocketState::Unconnected => 0,
            SocketState::Bound => 1,
            SocketState::Listening => 2,
            SocketState::Connecting => 3,
            SocketState::Connected => 4,
            SocketState::Closing => 5,
        }
    }

    fn from_tag(tag: u8) -> SocketState {
        match tag {
            1 => SocketState::Bound,
            2 => SocketState::Listening,
            3 => SocketState::Connecting,
            4 => SocketState::Connected,
            5 => SocketState::Closing,
            _ => SocketState::Unconnected,
        }
    }
}

enum MasterRole {
    Unconnected,
    Bound {
        udp: Arc<UdpSocket>,
    },
    Listening(Arc<ListeningRole>),
    Connected {
        udp: Arc<UdpSocket>,
        session: Arc<KcpSession>,
        receive_task: JoinHandle<()>,
    },
}

struct ListeningRole {
    udp: Arc<UdpSocket>,
    children: Arc<StdMutex<HashMap<SocketAddr, Weak<KcpSession>>>>,
    accept_queue: Arc<AcceptQueue>,
    receive_task: JoinHandle<()>,
}

struct MasterInner {
    config: KcpConfig,
    role: AsyncMutex<MasterRole>,
    /// Shadow of the role's variant, written synchronously at every
    /// transition (including at the *start* of `close()`, before its
    /// drain wait) so read-only accessors never need to guess at a
    /// held `role` lock the way `MasterKcpSocketPrivate::close`'s
    /// lock-free `state` field write lets concurrent readers see a
    /// closing socket immediately instead of blocking on it.
    state: AtomicU8,
    /// Cache of the connected session, mirrored alongside `state` so
    /// `send`/`recv` can still be routed correctly while `close()`
    /// holds `role` across its graceful-drain await.
    active_session: StdMutex<Option<Arc<KcpSession>>>,
}

struct ChildInner {
    parent: Weak<MasterInner>,
    session: Arc<KcpSession>,
}

enum Kind {
    Master(Arc<MasterInner>),
    Child(Arc<ChildInner>),
}

/// The public socket type (spec §4.3, §4.7). Covers both the
/// endpoint-owning ("master") role and the per-peer ("child") role handed
/// out by [`KcpListener::accept`].
pub struct KcpSocket {
    kind: Kind,
}

impl KcpSocket {
    pub fn new() -> KcpSocket {
        KcpSocket::with_config(KcpConfig::default())
    }

    pub fn with_config(config: KcpConfig) -> KcpSocket {
        KcpSocket {
            kind: Kind::Master(Arc::new(MasterInner {
                config,
                role: AsyncMutex::new(MasterRole::Unconnected),
                state: AtomicU8::new(SocketState::Unconnected.to_tag()),
                active_session: StdMutex::new(None),
            })),
        }
    }

    fn master(&self) -> KcpResult<&Arc<MasterInner>> {
        match &self.kind {
            Kind::Master(m) => Ok(m),
            Kind::Child(_) => Err(KcpSocketError::InvalidState),
        }
    }

    pub async fn bind(&self, addr: SocketAddr) -> KcpResult<()> {
        let master = self.master()?;
        let mut role = master.role.lock().await;
        match &*role {
            MasterRole::Unconnected => {
                let udp = UdpSocket::bind(addr).await?;
                if master.config.reuse_address {
                    // Platform address-reuse is typically set before bind
                    // via socket2; tokio's `UdpSocket::bind` doesn't expose
                    // that knob directly, so this is a documented no-op on
                    // the stock std/tokio listener and left for a caller
                    // who needs it to construct the socket via `socket2`
                    // and adopt it with `UdpSocket::from_std`.
                    trace!("reuse_address requested for {addr}; apply via socket2 if needed");
                }
                *role = MasterRole::Bound { udp: Arc::new(udp) };
                master.state.store(SocketState::Bound.to_tag(), Ordering::SeqCst);
                Ok(())
            }
            _ => Err(KcpSocketError::InvalidState),
        }
    }

    pub async fn listen(&self, backlog: usize) -> KcpResult<()> {
        let master = self.master()?;
        let mut role = master.role.lock().await;
        let udp = match &*role {
            MasterRole::Bound { udp } => udp.clone(),
            _ => return Err(KcpSocketError::InvalidState),
        };

        let children: Arc<StdMutex<HashMap<SocketAddr, Weak<KcpSession>>>> = Arc::new(StdMutex::new(HashMap::new()));
        let accept_queue = Arc::new(AcceptQueue::new(backlog));

        let task_udp = udp.clone();
        let task_children = children.clone();
        let task_accept_queue = accept_queue.clone();
        let task_config = master.config.clone();
        let receive_task = tokio::spawn(async move {
            run_listen_loop(task_udp, task_config, task_children, task_accept_queue).await;
        });

        debug!("listening on {:?} with backlog {}", udp.local_addr(), backlog);

        *role = MasterRole::Listening(Arc::new(ListeningRole {
            udp,
            children,
            accept_queue,
            receive_task,
        }));
        master.state.store(SocketState::Listening.to_tag(), Ordering::SeqCst);
        Ok(())
    }

    pub async fn connect(&self, addr: SocketAddr) -> KcpResult<()> {
        let master = self.master()?;
        let mut role = master.role.lock().await;
        let udp = match &*role {
            MasterRole::Unconnected => Arc::new(UdpSocket::bind("0.0.0.0:0").await?),
            MasterRole::Bound { udp } => udp.clone(),
            _ => return Err(KcpSocketError::InvalidState),
        };

        let conv: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
        let session = KcpSession::new(conv, &master.config, addr, udp.clone());

        let task_udp = udp.clone();
        let task_session = session.clone();
        let receive_task = tokio::spawn(async move {
            run_client_loop(task_udp, task_session).await;
        });

        debug!("connected to {}", addr);
        *master.active_session.lock().unwrap() = Some(session.clone());
        *role = MasterRole::Connected {
            udp,
            session,
            receive_task,
        };
        master.state.store(SocketState::Connected.to_tag(), Ordering::SeqCst);
        Ok(())
    }

    pub async fn accept(&self) -> KcpResult<KcpSocket> {
        let master = self.master()?;
        let role = master.role.lock().await;
        let listening = match &*role {
            MasterRole::Listening(l) => l.clone(),
            _ => return Err(KcpSocketError::InvalidState),
        };
        drop(role);

        match listening.accept_queue.get().await {
            Some((session, _addr)) => Ok(KcpSocket {
                kind: Kind::Child(Arc::new(ChildInner {
                    parent: Arc::downgrade(master),
                    session,
                })),
            }),
            None => Err(KcpSocketError::SocketAccessError),
        }
    }

    pub async fn send(&self, buf: &[u8]) -> KcpResult<usize> {
        self.session_for_io()?.send(buf, false).await
    }

    pub async fn sendall(&self, buf: &[u8]) -> KcpResult<usize> {
        self.session_for_io()?.send(buf, true).await
    }

    pub async fn recv(&self, buf: &mut [u8]) -> KcpResult<usize> {
        self.session_for_io()?.recv(buf, false).await
    }

    pub async fn recvall(&self, buf: &mut [u8]) -> KcpResult<usize> {
        self.session_for_io()?.recv(buf, true).await
    }

    /// Resolves the active session for a child, or the connected master's
    /// own session, checking the child/parent liveness rule of spec §9.
    fn session_for_io(&self) -> KcpResult<Arc<KcpSession>> {
        match &self.kind {
            Kind::Child(child) => {
                if child.parent.upgrade().is_none() {
                    return Err(KcpSocketError::SocketAccessError);
                }
                Ok(child.session.clone())
            }
            Kind::Master(master) => master
                .active_session
                .lock()
                .unwrap()
                .clone()
                .ok_or(KcpSocketError::InvalidState),
        }
    }

    pub async fn close(&self, force: bool) -> KcpResult<()> {
        match &self.kind {
            Kind::Child(child) => {
                child.session.close(force).await;
                if let Some(parent) = child.parent.upgrade() {
                    let role = parent.role.lock().await;
                    if let MasterRole::Listening(listening) = &*role {
                        listening.children.lock().unwrap().remove(&child.session.remote_addr());
                    }
                }
                Ok(())
            }
            Kind::Master(master) => {
                // Recorded before taking the role lock, matching
                // `MasterKcpSocketPrivate::close`'s lock-free `state`
                // write ahead of its own drain wait, so `is_valid`,
                // `state`, `error`, `peer_addr` and `session_for_io`
                // see "closing" immediately rather than a stale value
                // for as long as the teardown below runs.
                master.state.store(SocketState::Closing.to_tag(), Ordering::SeqCst);
                let mut role = master.role.lock().await;
                let result = match std::mem::replace(&mut *role, MasterRole::Unconnected) {
                    MasterRole::Unconnected => Ok(()),
                    MasterRole::Bound { .. } => Ok(()),
                    MasterRole::Listening(listening) => {
                        let children: Vec<Arc<KcpSession>> = listening
                            .children
                            .lock()
                            .unwrap()
                            .values()
                            .filter_map(Weak::upgrade)
                            .collect();
                        for child in children {
                            child.close(force).await;
                        }
                        listening.receive_task.abort();
                        Ok(())
                    }
                    MasterRole::Connected { session, receive_task, .. } => {
                        session.close(force).await;
                        receive_task.abort();
                        Ok(())
                    }
                };
                *master.active_session.lock().unwrap() = None;
                master.state.store(SocketState::Unconnected.to_tag(), Ordering::SeqCst);
                result
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        match &self.kind {
            Kind::Child(child) => child.parent.upgrade().is_some() && child.session.is_connected(),
            Kind::Master(master) => !matches!(
                SocketState::from_tag(master.state.load(Ordering::SeqCst)),
                SocketState::Unconnected
            ),
        }
    }

    /// Current state in the diagram of spec §3, read from the shadow
    /// `state` tag rather than `role` so it reflects an in-flight
    /// `close()`'s transition to `Closing` immediately.
    pub fn state(&self) -> SocketState {
        match &self.kind {
            Kind::Child(child) => {
                if child.parent.upgrade().is_none() || !child.session.is_connected() {
                    SocketState::Closing
                } else {
                    SocketState::Connected
                }
            }
            Kind::Master(master) => {
                let tag = SocketState::from_tag(master.state.load(Ordering::SeqCst));
                if tag == SocketState::Connected {
                    match master.active_session.lock().unwrap().as_ref() {
                        Some(session) if session.is_connected() => SocketState::Connected,
                        _ => SocketState::Closing,
                    }
                } else {
                    tag
                }
            }
        }
    }

    /// The latched error (spec §4.3 "error state"), if the session has
    /// torn down abnormally. `None` while still connected.
    pub fn error(&self) -> Option<KcpSocketError> {
        match &self.kind {
            Kind::Child(child) => {
                if child.parent.upgrade().is_none() {
                    Some(KcpSocketError::SocketAccessError)
                } else if child.session.is_connected() {
                    None
                } else {
                    Some(child.session.current_error())
                }
            }
            Kind::Master(master) => {
                let session = master.active_session.lock().unwrap().clone()?;
                if session.is_connected() {
                    None
                } else {
                    Some(session.current_error())
                }
            }
        }
    }

    /// The KCP tuning preset this socket was configured with. Children
    /// share their parent's configuration implicitly and aren't tracked
    /// separately.
    pub fn mode(&self) -> Mode {
        match &self.kind {
            Kind::Master(master) => master.config.mode,
            Kind::Child(_) => Mode::default(),
        }
    }

    pub fn peer_addr(&self) -> KcpResult<SocketAddr> {
        match &self.kind {
            Kind::Child(child) => Ok(child.session.remote_addr()),
            Kind::Master(master) => master
                .active_session
                .lock()
                .unwrap()
                .as_ref()
                .map(|session| session.remote_addr())
                .ok_or(KcpSocketError::InvalidState),
        }
    }

    /// `SocketLike`'s file-descriptor accessor has no meaning for this
    /// transport (spec §4.7): there is no OS-level descriptor backing an
    /// individual logical session, only the shared UDP endpoint.
    pub fn as_raw_descriptor(&self) -> Option<i32> {
        None
    }

    pub fn set_compression(&self, enabled: bool) {
        if let Kind::Child(child) = &self.kind {
            child.session.set_compression(enabled);
        }
    }

    pub fn compression(&self) -> bool {
        match &self.kind {
            Kind::Child(child) => child.session.compression(),
            Kind::Master(_) => false,
        }
    }
}

impl Default for KcpSocket {
    fn default() -> KcpSocket {
        KcpSocket::new()
    }
}

async fn run_listen_loop(
    udp: Arc<UdpSocket>,
    config: KcpConfig,
    children: Arc<StdMutex<HashMap<SocketAddr, Weak<KcpSession>>>>,
    accept_queue: Arc<AcceptQueue>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, peer) = match udp.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                error!("listener recv_from failed: {}", e);
                return;
            }
        };
        let datagram = &buf[..n];

        let existing = children.lock().unwrap().get(&peer).and_then(Weak::upgrade);
        if let Some(session) = existing {
            if session.handle_datagram(datagram).await == DatagramOutcome::Closed {
                children.lock().unwrap().remove(&peer);
            }
            continue;
        }

        let conv: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
        let session = KcpSession::new(conv, &config, peer, udp.clone());
        session.handle_datagram(datagram).await;

        if accept_queue.try_put((session.clone(), peer)) {
            children.lock().unwrap().insert(peer, Arc::downgrade(&session));
            debug!("accepted new peer {}", peer);
        } else {
            trace!("accept queue full, dropping connection attempt from {}", peer);
        }
    }
}

async fn run_client_loop(udp: Arc<UdpSocket>, session: Arc<KcpSession>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match udp.recv_from(&mut buf).await {
            Ok((n, _from)) => {
                // Source-port filtering is left permissive per spec §4.5 /
                // §9: the reference implementation forwards regardless of
                // the sender matching the connected peer.
                if session.handle_datagram(&buf[..n]).await == DatagramOutcome::Closed {
                    return;
                }
            }
            Err(e) => {
                error!("client recv_from failed: {}", e);
                session.force_close(KcpSocketError::Io(e)).await;
                return;
            }
        }
    }
}

/// Role-narrowed view over [`KcpSocket`] exposing only `bind`/`listen`/
/// `accept`, matching `tokio_kcp::KcpListener`'s public shape.
pub struct KcpListener {
    socket: KcpSocket,
}

impl KcpListener {
    pub async fn bind(config: KcpConfig, addr: SocketAddr, backlog: usize) -> KcpResult<KcpListener> {
        let socket = KcpSocket::with_config(config);
        socket.bind(addr).await?;
        socket.listen(backlog).await?;
        Ok(KcpListener { socket })
    }

    pub async fn accept(&self) -> KcpResult<(KcpStream, SocketAddr)> {
        let child = self.socket.accept().await?;
        let addr = child.peer_addr()?;
        Ok((KcpStream { socket: child }, addr))
    }

    pub fn local_addr(&self) -> KcpResult<SocketAddr> {
        match &self.socket.kind {
            Kind::Master(master) => match master.role.try_lock() {
                Ok(role) => match &*role {
                    MasterRole::Listening(l) => l.udp.local_addr().map_err(KcpSocketError::Io),
                    _ => Err(KcpSocketError::InvalidState),
                },
                Err(_) => Err(KcpSocketError::InvalidState),
            },
            Kind::Child(_) => Err(KcpSocketError::InvalidState),
        }
    }
}

/// Role-narrowed view over [`KcpSocket`] exposing only `connect`/`send`/
/// `recv`/`close`, matching `tokio_kcp::KcpStream`'s public shape.
pub struct KcpStream {
    socket: KcpSocket,
}

impl KcpStream {
    pub async fn connect(config: &KcpConfig, addr: SocketAddr) -> KcpResult<KcpStream> {
        let socket = KcpSocket::with_config(config.clone());
        socket.connect(addr).await?;
        Ok(KcpStream { socket })
    }

    pub async fn send(&self, buf: &[u8]) -> KcpResult<usize> {
        self.socket.send(buf).await
    }

    pub async fn sendall(&self, buf: &[u8]) -> KcpResult<usize> {
        self.socket.sendall(buf).await
    }

    pub async fn recv(&self, buf: &mut [u8]) -> KcpResult<usize> {
        self.socket.recv(buf).await
    }

    pub async fn recvall(&self, buf: &mut [u8]) -> KcpResult<usize> {
        self.socket.recvall(buf).await
    }

    pub async fn close(&self, force: bool) -> KcpResult<()> {
        self.socket.close(force).await
    }

    pub fn peer_addr(&self) -> KcpResult<SocketAddr> {
        self.socket.peer_addr()
    }
}
