//! rotary_gate/src/dialer.rs
//! Single-hop and chained upstream SOCKS5 dialers (spec §4.2 / §4.3).

use crate::codec::{
    self, Addr, METHOD_NO_AUTH, METHOD_USER_PASS, REP_SUCCESS,
};
use crate::error::SocksError;
use crate::types::Upstream;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a TCP connection to `upstream` and negotiates a CONNECT tunnel to
/// `(target_host, target_port)` through it. Returns the live tunnel socket;
/// subsequent reads/writes on it are raw payload to/from the target.
pub async fn dial(upstream: &Upstream, target_host: &str, target_port: u16) -> Result<TcpStream, SocksError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(upstream.addr()))
        .await
        .map_err(|_| SocksError::ConnectTimeout)?
        .map_err(SocksError::UpstreamUnreachable)?;
    let mut stream = stream;
    tokio::time::timeout(NEGOTIATE_TIMEOUT, negotiate(&mut stream, upstream, target_host, target_port))
        .await
        .map_err(|_| SocksError::ConnectTimeout)??;
    Ok(stream)
}

/// Dials `first`, then over that tunnel, as raw payload, negotiates a
/// second, independent SOCKS5 conversation to `second`, CONNECTing to the
/// final target. No encapsulation: the second negotiation's bytes are simply
/// written/read on the same socket once the first CONNECT has succeeded.
pub async fn dial_chain(
    first: &Upstream,
    second: &Upstream,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream, SocksError> {
    let mut tunnel = dial(first, &second.host, second.port).await?;
    tokio::time::timeout(NEGOTIATE_TIMEOUT, negotiate(&mut tunnel, second, target_host, target_port))
        .await
        .map_err(|_| SocksError::ConnectTimeout)??;
    Ok(tunnel)
}

/// Runs the greeting/auth/CONNECT sequence of spec §4.2 steps 2-6 over any
/// already-open byte stream. Used both for a direct upstream connection and,
/// unmodified, for the second hop of a chained dial.
async fn negotiate<S>(stream: &mut S, upstream: &Upstream, target_host: &str, target_port: u16) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    codec::write_greeting(stream, &[METHOD_NO_AUTH, METHOD_USER_PASS]).await?;
    let method = codec::read_method_selection(stream).await?;
    match method {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let ok = codec::user_pass_auth(stream, &upstream.username, &upstream.password).await?;
            if !ok {
                return Err(SocksError::AuthFailed);
            }
        }
        _ => return Err(SocksError::AuthUnsupported),
    }

    let addr = Addr::classify(target_host)?;
    codec::write_connect_request(stream, &addr, target_port).await?;
    let rep = codec::read_reply(stream).await?;
    if rep != REP_SUCCESS {
        return Err(SocksError::RemoteRefused { rep });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpstreamStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn upstream(host: &str, port: u16) -> Upstream {
        Upstream {
            host: host.to_string(),
            port,
            username: "alice".to_string(),
            password: "s3cret".to_string(),
            status: UpstreamStatus::Inactive,
            last_used: 0,
            fail_count: 0,
        }
    }

    /// Drives one greeting+CONNECT exchange as a fake upstream would, then
    /// relays a marker byte so the test can assert the tunnel is live.
    async fn fake_upstream(listener: TcpListener, want_user_pass: bool) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let methods = codec::read_greeting(&mut sock).await.unwrap();
        assert!(methods.contains(&METHOD_NO_AUTH));
        assert!(methods.contains(&METHOD_USER_PASS));
        let method = if want_user_pass { METHOD_USER_PASS } else { METHOD_NO_AUTH };
        codec::write_method_selection(&mut sock, method).await.unwrap();
        if want_user_pass {
            let (user, pass) = codec::read_user_pass(&mut sock).await.unwrap();
            assert_eq!(user, "alice");
            assert_eq!(pass, "s3cret");
            sock.write_all(&[0x01, 0x00]).await.unwrap();
        }
        let req = codec::read_connect_request(&mut sock).await.unwrap();
        assert_eq!(req.port, 80);
        codec::write_reply(&mut sock, REP_SUCCESS).await.unwrap();
        sock.write_all(b"ok").await.unwrap();
    }

    #[tokio::test]
    async fn dial_succeeds_with_no_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_upstream(listener, false));
        let up = upstream(&addr.ip().to_string(), addr.port());
        let mut tunnel = dial(&up, "example.com", 80).await.unwrap();
        let mut buf = [0u8; 2];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_performs_user_pass_auth_when_selected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_upstream(listener, true));
        let up = upstream(&addr.ip().to_string(), addr.port());
        dial(&up, "example.com", 80).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_reports_remote_refused_on_nonzero_rep() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            codec::read_greeting(&mut sock).await.unwrap();
            codec::write_method_selection(&mut sock, METHOD_NO_AUTH).await.unwrap();
            codec::read_connect_request(&mut sock).await.unwrap();
            codec::write_reply(&mut sock, 0x05).await.unwrap();
        });
        let up = upstream(&addr.ip().to_string(), addr.port());
        let err = dial(&up, "example.com", 80).await.unwrap_err();
        assert!(matches!(err, SocksError::RemoteRefused { rep: 0x05 }));
        server.await.unwrap();
    }
}
