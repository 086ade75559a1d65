use std::time::Duration;

use kcp::Kcp;

/// Tuning presets for the underlying KCP control block (spec §4.2).
///
/// Each preset sets `nodelay`, `interval`, `resend`, `nc`, `mtu` and the
/// send/receive window sizes in one shot, the same way `ikcp_nodelay` /
/// `ikcp_setmtu` / `ikcp_wndsize` are grouped in the original socket's
/// `setMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Conservative defaults suited to a real internet path.
    Internet,
    /// Low-latency settings for a LAN.
    Ethernet,
    /// Aggressive settings for same-host testing.
    Loopback,
}

impl Default for Mode {
    fn default() -> Mode {
        Mode::Internet
    }
}

impl Mode {
    fn nodelay_params(self) -> (bool, i32, i32, bool) {
        match self {
            // (nodelay, interval, resend, nc)
            Mode::Internet => (false, 10, 0, false),
            Mode::Ethernet => (true, 10, 1, true),
            Mode::Loopback => (true, 10, 2, true),
        }
    }

    fn mtu(self) -> usize {
        match self {
            Mode::Internet => 1400,
            Mode::Ethernet => 16384,
            Mode::Loopback => 32768,
        }
    }

    fn wnd_size(self) -> (u16, u16) {
        match self {
            Mode::Internet => (1024, 1024),
            Mode::Ethernet => (64, 64),
            Mode::Loopback => (32, 32),
        }
    }
}

/// Configuration for a [`crate::KcpSocket`](crate::socket::KcpSocket).
///
/// Grounded on `tokio_kcp::KcpConfig`: a plain data struct plus an
/// `apply_to` method that pushes the settings into a freshly created
/// `Kcp<W>` control block.
#[derive(Debug, Clone)]
pub struct KcpConfig {
    pub mode: Mode,

    /// Overrides the MTU implied by `mode` when set.
    pub mtu: Option<usize>,

    /// Overrides the send/receive window sizes implied by `mode`.
    pub wnd_size: Option<(u16, u16)>,

    /// Use KCP's byte-stream mode (`Kcp::new_stream`) instead of
    /// message mode. Stream mode removes message boundaries, which is
    /// what a stream-socket abstraction wants.
    pub stream: bool,

    /// Attempt DEFLATE compression on outgoing data envelopes, keeping the
    /// compressed form only when it's strictly smaller (spec §4.1).
    pub compression: bool,

    /// Idle-teardown timeout. A session with no inbound datagram for
    /// longer than this is force-closed (spec §3, §4.4).
    pub session_expire: Duration,

    /// How often an idle session emits a KEEPALIVE envelope (spec §4.4).
    pub keepalive_interval: Duration,

    /// Outstanding-segment threshold above which `send` blocks (spec §3).
    pub water_line: usize,

    /// Flush every `send` immediately instead of batching with the next
    /// timer tick, trading throughput for latency.
    pub flush_write: bool,

    /// Set `SO_REUSEADDR` (or platform equivalent) before binding.
    pub reuse_address: bool,
}

impl Default for KcpConfig {
    fn default() -> KcpConfig {
        KcpConfig {
            mode: Mode::default(),
            mtu: None,
            wnd_size: None,
            stream: true,
            compression: false,
            session_expire: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            water_line: 32,
            flush_write: false,
            reuse_address: true,
        }
    }
}

impl KcpConfig {
    pub(crate) fn apply_to<W: std::io::Write>(&self, kcp: &mut Kcp<W>) {
        let (nodelay, interval, resend, nc) = self.mode.nodelay_params();
        kcp.set_nodelay(nodelay, interval, resend, nc);

        let mtu = self.mtu.unwrap_or_else(|| self.mode.mtu());
        let _ = kcp.set_mtu(mtu);

        let (snd_wnd, rcv_wnd) = self.wnd_size.unwrap_or_else(|| self.mode.wnd_size());
        kcp.set_wndsize(snd_wnd, rcv_wnd);
    }
}
