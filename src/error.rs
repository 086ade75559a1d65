use std::io;

use thiserror::Error;

/// Errors surfaced by a [`crate::KcpSocket`](crate::socket::KcpSocket).
///
/// Mirrors the error taxonomy of the original KCP socket: most of these
/// conditions don't unwind the call, they just get latched as the session's
/// "last error" and reported back as a `-1`/`None` from the blocking
/// send/recv/accept paths (see `session::KcpSession::error`).
#[derive(Debug, Error)]
pub enum KcpSocketError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Kcp(#[from] kcp::Error),

    /// Operation attempted on a child session whose master has already been
    /// torn down, or an operation that doesn't make sense for the session's
    /// current role (`bind`/`listen`/`connect`/`accept` on a child).
    #[error("socket access error: parent endpoint is no longer available")]
    SocketAccessError,

    /// The peer sent a CLOSE envelope; the session has moved to
    /// `Unconnected` and all further sends/receives fail with this error.
    #[error("remote host closed the connection")]
    RemoteHostClosed,

    /// No datagram has been seen from the peer for longer than the
    /// configured teardown timeout.
    #[error("connection timed out")]
    NetworkTimeout,

    /// A public operation was attempted from a state that forbids it, e.g.
    /// `send` on an `Unconnected` session, or `listen` on a session that
    /// isn't `Bound`.
    #[error("invalid operation for the current socket state")]
    InvalidState,
}

pub type KcpResult<T> = Result<T, KcpSocketError>;
