//! Closed error taxonomy for the protocol engine and dialers.

use thiserror::Error;

/// Errors raised while negotiating or relaying a SOCKS5/HTTP connection.
///
/// Carries enough detail for the listener to translate a failure back into
/// a client-facing SOCKS5 REP byte or an HTTP status line without having to
/// re-derive the mapping at the call site.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(#[source] std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("upstream authentication failed")]
    AuthFailed,

    #[error("upstream offered no acceptable authentication method")]
    AuthUnsupported,

    #[error("protocol error: {0}")]
    ProtocolError(&'static str),

    #[error("remote refused connection (REP=0x{rep:02x})")]
    RemoteRefused { rep: u8 },

    #[error("destination address/name too long for SOCKS5 framing")]
    AddressTooLong,

    #[error("pool lock not acquired within timeout")]
    LockTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SocksError {
    /// Maps this error onto the client-facing SOCKS5 REP byte per §4.1/§4.2.
    pub fn to_rep(&self) -> u8 {
        match self {
            SocksError::UpstreamUnreachable(_) | SocksError::ConnectTimeout => 0x04,
            SocksError::RemoteRefused { rep } => *rep,
            SocksError::AddressTooLong => 0x08,
            SocksError::AuthFailed | SocksError::AuthUnsupported => 0x01,
            SocksError::ProtocolError(_) => 0x07,
            SocksError::LockTimeout | SocksError::Io(_) => 0x01,
        }
    }
}
