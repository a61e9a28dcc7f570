//! rotary_gate/src/relay.rs
//! Bidirectional byte pump between a client socket and an upstream tunnel.
//!
//! Grounded on the teacher's `connection.rs::copy_bidirectional_with_metrics`
//! (a `tokio::select!` loop over two halves with byte counters), stripped of
//! rate limiting and given a 60s idle timeout per spec §4.4/§5 in place of
//! the teacher's governor-based throttling.

use crate::state::{TOTAL_BYTES_RECV, TOTAL_BYTES_SENT};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUF_SIZE: usize = 4096;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pumps bytes in both directions between `client` and `tunnel` until either
/// side closes, an I/O error occurs, or neither side produces bytes within
/// the idle window. Returns `(client_to_tunnel, tunnel_to_client)` byte
/// counts; errors are the caller's to log, never surfaced to either peer.
pub async fn relay<C, T>(client: C, tunnel: T) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut cr, mut cw) = io::split(client);
    let (mut tr, mut tw) = io::split(tunnel);

    let mut c2t: u64 = 0;
    let mut t2c: u64 = 0;
    let mut c_buf = [0u8; BUF_SIZE];
    let mut t_buf = [0u8; BUF_SIZE];
    let mut c_done = false;
    let mut t_done = false;

    loop {
        if c_done && t_done {
            break;
        }
        tokio::select! {
            biased;

            result = cr.read(&mut c_buf), if !c_done => {
                match result {
                    Ok(0) | Err(_) => { c_done = true; let _ = tw.shutdown().await; }
                    Ok(n) => {
                        if tw.write_all(&c_buf[..n]).await.is_err() {
                            c_done = true;
                        } else {
                            c2t += n as u64;
                        }
                    }
                }
            }

            result = tr.read(&mut t_buf), if !t_done => {
                match result {
                    Ok(0) | Err(_) => { t_done = true; let _ = cw.shutdown().await; }
                    Ok(n) => {
                        if cw.write_all(&t_buf[..n]).await.is_err() {
                            t_done = true;
                        } else {
                            t2c += n as u64;
                        }
                    }
                }
            }

            _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                break;
            }
        }
    }

    TOTAL_BYTES_SENT.fetch_add(c2t, Ordering::Relaxed);
    TOTAL_BYTES_RECV.fetch_add(t2c, Ordering::Relaxed);
    (c2t, t2c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relays_bytes_until_both_sides_close() {
        let (client_side, mut client_mock) = duplex(64);
        let (tunnel_side, mut tunnel_mock) = duplex(64);

        let pump = tokio::spawn(async move { relay(client_side, tunnel_side).await });

        client_mock.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        tunnel_mock.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        tunnel_mock.write_all(b"world").await.unwrap();
        let mut got2 = [0u8; 5];
        client_mock.read_exact(&mut got2).await.unwrap();
        assert_eq!(&got2, b"world");

        drop(client_mock);
        drop(tunnel_mock);
        let (c2t, t2c) = pump.await.unwrap();
        assert_eq!(c2t, 5);
        assert_eq!(t2c, 5);
    }
}
