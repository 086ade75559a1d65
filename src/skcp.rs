//! The KCP adapter (spec §4.2): wraps the third-party `kcp` control block,
//! collecting whatever it writes out into a plain queue of segments instead
//! of pushing them onto the wire itself. The caller (`session::KcpSession`)
//! drains that queue after every call that might flush and is responsible
//! for framing and sending each segment.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use kcp::{Kcp, KcpResult as KcpLibResult};

use crate::config::KcpConfig;

/// `Write` sink handed to `Kcp<W>` as its output callback. Each `write()`
/// call is one complete outbound segment (the `kcp` crate never calls
/// `write` twice for the same datagram), so we just stash the buffer in a
/// queue shared with `KcpIo`, the same way `tokio_kcp`'s `PacerOutput`
/// hands each write off to a channel instead of sending it inline.
#[derive(Debug, Clone, Default)]
struct SegmentSink {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl Write for SegmentSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.queue.lock().unwrap().push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Owns the `Kcp` control block and exposes the operations the rest of the
/// crate needs (spec §4.2's operation list), translated into idiomatic
/// Rust signatures.
#[derive(Debug)]
pub(crate) struct KcpIo {
    kcp: Kcp<SegmentSink>,
    output: SegmentSink,
}

impl KcpIo {
    pub fn new(conv: u32, config: &KcpConfig) -> KcpIo {
        let output = SegmentSink::default();
        let mut kcp = if config.stream {
            Kcp::new_stream(conv, output.clone())
        } else {
            Kcp::new(conv, output.clone())
        };
        config.apply_to(&mut kcp);
        KcpIo { kcp, output }
    }

    /// Enqueues bytes for transmission. KCP never partially accepts a
    /// single call: either the whole slice is queued or an error is
    /// returned (callers chunk beforehand per spec §4.3).
    pub fn send(&mut self, buf: &[u8]) -> KcpLibResult<usize> {
        self.kcp.send(buf)
    }

    /// Feeds one inbound KCP segment (already stripped of our envelope).
    pub fn input(&mut self, buf: &[u8]) -> KcpLibResult<usize> {
        self.kcp.input(buf)
    }

    pub fn peek_size(&self) -> KcpLibResult<usize> {
        self.kcp.peeksize()
    }

    /// Drains one assembled message into `buf`.
    pub fn recv(&mut self, buf: &mut [u8]) -> KcpLibResult<usize> {
        self.kcp.recv(buf)
    }

    /// Advances KCP's internal clock. May enqueue output segments.
    pub fn update(&mut self, current_ms_32: u32) -> KcpLibResult<()> {
        self.kcp.update(current_ms_32)
    }

    /// Flushes any pending outbound data immediately. May enqueue output
    /// segments.
    pub fn flush(&mut self) -> KcpLibResult<()> {
        self.kcp.flush()
    }

    /// Returns the deadline (in the same 32-bit clock as `update`) at
    /// which `update` should next be called.
    pub fn check(&self, current_ms_32: u32) -> u32 {
        self.kcp.check(current_ms_32)
    }

    /// Number of segments sent but not yet acknowledged.
    pub fn wait_snd(&self) -> usize {
        self.kcp.wait_snd()
    }

    pub fn mss(&self) -> usize {
        self.kcp.mss()
    }

    pub fn conv(&self) -> u32 {
        self.kcp.conv()
    }

    /// Takes every segment queued by the output callback since the last
    /// call, in emission order.
    pub fn drain_output(&mut self) -> Vec<Vec<u8>> {
        self.output.queue.lock().unwrap().drain(..).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn send_enqueues_output_after_update() {
        let config = KcpConfig::default();
        let mut io = KcpIo::new(0x1, &config);
        io.send(b"hello").unwrap();
        io.update(0).unwrap();
        let out = io.drain_output();
        assert!(!out.is_empty(), "update() after send() should flush a segment");
    }

    #[test]
    fn input_then_recv_round_trips() {
        let config = KcpConfig::default();
        let mut a = KcpIo::new(42, &config);
        let mut b = KcpIo::new(42, &config);

        a.send(b"ping").unwrap();
        a.update(0).unwrap();
        for seg in a.drain_output() {
            b.input(&seg).unwrap();
        }

        let mut buf = [0u8; 64];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
