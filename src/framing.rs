//! Wire envelope for datagrams exchanged by this layer (spec §3, §4.1, §6).
//!
//! ```text
//! byte 0:   0x01 | 0x02 | 0x03 | 0x04
//! bytes 1-2 (types 0x01, 0x02 only): uint16 big-endian payload length L
//! bytes 3..3+L (types 0x01, 0x02 only): payload
//! ```

use std::io::{self, Read, Write};

use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};

const TYPE_UNCOMPRESSED: u8 = 0x01;
const TYPE_COMPRESSED: u8 = 0x02;
const TYPE_CLOSE: u8 = 0x03;
const TYPE_KEEPALIVE: u8 = 0x04;

/// A decoded datagram. `Invalid` is never returned to the caller as an
/// error; the multiplexer drops it silently (spec §4.1).
#[derive(Debug, PartialEq, Eq)]
pub enum Envelope<'a> {
    Data { compressed: bool, payload: &'a [u8] },
    Close,
    Keepalive,
    Invalid,
}

/// Encodes a KCP segment as a data envelope, compressing it when
/// `compression` is set and the compressed form is strictly smaller than
/// the original (spec §4.1). `bytes` must be at most 65535 bytes.
pub fn encode_data(bytes: &[u8], compression: bool) -> Vec<u8> {
    debug_assert!(bytes.len() <= u16::MAX as usize);

    if compression {
        if let Some(compressed) = try_deflate(bytes) {
            if compressed.len() < bytes.len() {
                return frame(TYPE_COMPRESSED, &compressed);
            }
        }
    }

    frame(TYPE_UNCOMPRESSED, bytes)
}

pub fn encode_close() -> Vec<u8> {
    vec![TYPE_CLOSE]
}

pub fn encode_keepalive() -> Vec<u8> {
    vec![TYPE_KEEPALIVE]
}

fn frame(ty: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.push(ty);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn try_deflate(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).ok()?;
    encoder.finish().ok()
}

fn inflate(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Decodes a received datagram. The returned `Data` payload borrows from
/// `buf` for the uncompressed case; the compressed case allocates, so
/// callers that need compression support should call
/// [`decode_owned`] instead when they intend to hold the payload across an
/// await point.
pub fn decode(buf: &[u8]) -> Envelope<'_> {
    if buf.is_empty() {
        return Envelope::Invalid;
    }

    match buf[0] {
        TYPE_CLOSE => Envelope::Close,
        TYPE_KEEPALIVE => Envelope::Keepalive,
        TYPE_UNCOMPRESSED | TYPE_COMPRESSED => {
            if buf.len() < 3 {
                return Envelope::Invalid;
            }
            let declared = u16::from_be_bytes([buf[1], buf[2]]) as usize;
            let payload = &buf[3..];
            if declared != payload.len() {
                return Envelope::Invalid;
            }
            Envelope::Data {
                compressed: buf[0] == TYPE_COMPRESSED,
                payload,
            }
        }
        _ => Envelope::Invalid,
    }
}

/// Decodes a datagram and eagerly inflates a compressed payload, returning
/// an owned buffer ready to feed to `Kcp::input`. Returns `None` for
/// `Close`/`Keepalive`/`Invalid`.
pub fn decode_owned(buf: &[u8]) -> Option<Vec<u8>> {
    match decode(buf) {
        Envelope::Data {
            compressed: true,
            payload,
        } => inflate(payload).ok(),
        Envelope::Data {
            compressed: false,
            payload,
        } => Some(payload.to_vec()),
        _ => None,
    }
}

/// Classifies a raw datagram without retaining a borrow, for call sites
/// that only need to branch on the envelope kind (e.g. the listener's
/// demux loop, which must also read `buf[0]` before any session exists).
pub fn peek_kind(buf: &[u8]) -> EnvelopeKind {
    match decode(buf) {
        Envelope::Data { .. } => EnvelopeKind::Data,
        Envelope::Close => EnvelopeKind::Close,
        Envelope::Keepalive => EnvelopeKind::Keepalive,
        Envelope::Invalid => EnvelopeKind::Invalid,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Data,
    Close,
    Keepalive,
    Invalid,
}
