//! rotary_gate/src/listener.rs
//! Per-port accept loop, protocol sniff, and the SOCKS5/HTTP handlers
//! (spec §4.5). Listeners hold no shared state beyond the upstream(s) they
//! were started with and the binding's stop signal, per spec §5,
//! "Listeners and dialers hold no shared state."

use crate::codec::{self, REP_SUCCESS};
use crate::dialer;
use crate::error::SocksError;
use crate::relay;
use crate::state::{ACTIVE_CONN, TOTAL_CONN};
use crate::types::Upstream;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Binds `127.0.0.1:port` and spawns its accept loop in the background.
/// Returns once the bind succeeds (or fails), mirroring spec §4.7's rebind
/// worker needing to know immediately whether the new listener started.
pub async fn spawn_listener(
    port: u16,
    primary: Upstream,
    secondary: Option<Upstream>,
    mut stop_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    match changed {
                        Ok(()) if *stop_rx.borrow() => break,
                        Ok(()) => {}
                        Err(_) => break,
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _peer)) => {
                            let primary = primary.clone();
                            let secondary = secondary.clone();
                            TOTAL_CONN.fetch_add(1, Ordering::Relaxed);
                            ACTIVE_CONN.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, primary, secondary).await {
                                    tracing::debug!(port, error = %e, "connection ended with error");
                                }
                                ACTIVE_CONN.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            tracing::warn!(port, error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    });
    Ok(())
}

/// Wraps a stream so a peeked first byte is replayed to the first reader
/// before reads continue on the underlying stream. Replaces `MSG_PEEK` with
/// a small buffered reader per SPEC_FULL.md §4/REDESIGN FLAGS.
struct PeekedStream<S> {
    prefix: Option<u8>,
    inner: S,
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if let Some(b) = self.prefix.take() {
            buf.put_slice(&[b]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

async fn handle_connection(mut stream: TcpStream, primary: Upstream, secondary: Option<Upstream>) -> Result<(), SocksError> {
    let mut first = [0u8; 1];
    let n = tokio::time::timeout(PEEK_TIMEOUT, stream.read(&mut first))
        .await
        .map_err(|_| SocksError::ProtocolError("client sent nothing within the sniff timeout"))??;
    if n == 0 {
        return Ok(());
    }

    let mut peeked = PeekedStream {
        prefix: Some(first[0]),
        inner: stream,
    };

    if first[0] == codec::SOCKS_VERSION {
        handle_socks5(&mut peeked, &primary, &secondary).await
    } else {
        handle_http(&mut peeked, &primary, &secondary).await
    }
}

async fn dial_configured(primary: &Upstream, secondary: &Option<Upstream>, host: &str, port: u16) -> Result<TcpStream, SocksError> {
    match secondary {
        Some(second) => dialer::dial_chain(primary, second, host, port).await,
        None => dialer::dial(primary, host, port).await,
    }
}

async fn handle_socks5<S>(stream: &mut PeekedStream<S>, primary: &Upstream, secondary: &Option<Upstream>) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // NMETHODS/METHODS are read and discarded. Greeting always replies
    // NO_AUTH regardless of what was offered (spec §4.1 / REDESIGN FLAGS).
    codec::read_greeting(stream).await?;
    codec::write_method_selection(stream, codec::METHOD_NO_AUTH).await?;

    let request = codec::read_connect_request(stream).await?;
    let host = request.addr.to_host_string();

    match dial_configured(primary, secondary, &host, request.port).await {
        Ok(mut tunnel) => {
            codec::write_reply(stream, REP_SUCCESS).await?;
            relay::relay(stream, &mut tunnel).await;
            Ok(())
        }
        Err(e) => {
            codec::write_reply(stream, e.to_rep()).await?;
            Err(e)
        }
    }
}

async fn handle_http<S>(stream: &mut PeekedStream<S>, primary: &Upstream, secondary: &Option<Upstream>) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = codec::read_http_head(stream).await?;

    if head.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = codec::resolve_connect_target(&head.target);
        match dial_configured(primary, secondary, &host, port).await {
            Ok(mut tunnel) => {
                stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
                relay::relay(stream, &mut tunnel).await;
                Ok(())
            }
            Err(e) => {
                stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                Err(e)
            }
        }
    } else {
        let Some((host, port)) = codec::resolve_http_target(&head.target, &head.raw) else {
            stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Err(SocksError::ProtocolError("could not resolve HTTP target"));
        };
        match dial_configured(primary, secondary, &host, port).await {
            Ok(mut tunnel) => {
                // Forward the original request buffer unchanged (no rewrite),
                // per spec §4.1 and scenario S3.
                tunnel.write_all(&head.raw).await?;
                relay::relay(stream, &mut tunnel).await;
                Ok(())
            }
            Err(e) => {
                stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{METHOD_NO_AUTH, REP_HOST_UNREACHABLE};
    use crate::types::UpstreamStatus;
    use tokio::net::TcpStream;

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

    /// Drives one upstream-facing SOCKS5 negotiation as a fake upstream,
    /// returning the requested `(host, port)` and a marker byte afterwards.
    async fn fake_upstream(upstream_listener: TcpListener) -> (String, u16) {
        let (mut sock, _) = upstream_listener.accept().await.unwrap();
        codec::read_greeting(&mut sock).await.unwrap();
        codec::write_method_selection(&mut sock, METHOD_NO_AUTH).await.unwrap();
        let req = codec::read_connect_request(&mut sock).await.unwrap();
        codec::write_reply(&mut sock, REP_SUCCESS).await.unwrap();
        sock.write_all(b"ok").await.unwrap();
        (req.addr.to_host_string(), req.port)
    }

    #[tokio::test]
    async fn s1_socks5_client_gets_success_reply_and_relay() {
        let up_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up_addr = up_listener.local_addr().unwrap();
        let upstream_task = tokio::spawn(fake_upstream(up_listener));

        let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front_listener.local_addr().unwrap();
        drop(front_listener);
        let (_stop_tx2, stop_rx2) = watch::channel(false);
        let up2 = upstream(&up_addr.ip().to_string(), up_addr.port());
        spawn_listener(front_addr.port(), up2, None, stop_rx2).await.unwrap();

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greet_reply = [0u8; 2];
        client.read_exact(&mut greet_reply).await.unwrap();
        assert_eq!(greet_reply, [0x05, 0x00]);

        let domain = b"example.com";
        let mut req = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
        req.extend_from_slice(domain);
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut conn_reply = [0u8; 10];
        client.read_exact(&mut conn_reply).await.unwrap();
        assert_eq!(conn_reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let (host, port) = upstream_task.await.unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);

        let mut got = [0u8; 2];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ok");
    }

    #[tokio::test]
    async fn s2_http_connect_gets_200_and_relay() {
        let up_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up_addr = up_listener.local_addr().unwrap();
        let upstream_task = tokio::spawn(fake_upstream(up_listener));

        let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front_listener.local_addr().unwrap();
        drop(front_listener);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let up = upstream(&up_addr.ip().to_string(), up_addr.port());
        spawn_listener(front_addr.port(), up, None, stop_rx).await.unwrap();

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut resp = vec![0u8; b"HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        let (host, port) = upstream_task.await.unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn socks5_dial_failure_reports_host_unreachable() {
        // Nothing listens on this port, so the dial fails fast with connection refused
        // mapped to the same client-facing path as host-unreachable in spec terms.
        let dead_addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();

        let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front_listener.local_addr().unwrap();
        drop(front_listener);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let up = upstream(&dead_addr.ip().to_string(), dead_addr.port());
        spawn_listener(front_addr.port(), up, None, stop_rx).await.unwrap();

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greet_reply = [0u8; 2];
        client.read_exact(&mut greet_reply).await.unwrap();

        let domain = b"example.com";
        let mut req = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
        req.extend_from_slice(domain);
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut conn_reply = [0u8; 10];
        client.read_exact(&mut conn_reply).await.unwrap();
        assert_eq!(conn_reply[0], 0x05);
        assert_eq!(conn_reply[1], REP_HOST_UNREACHABLE);
    }
}
