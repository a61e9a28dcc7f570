//! rotary_gate/src/control.rs
//! Control-plane HTTP server (spec §6 ¶2): three fixed plain-text routes,
//! hand-rolled over raw TCP in the style of `notfound945-iface-proxy`'s
//! `http_proxy.rs` request-line parsing, since the wire contract here is
//! static enough that pulling in a framework would add more than it saves.

use crate::pool::Pool;
use chrono::{Local, TimeZone};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Runs the control plane forever, one task per accepted connection
/// (thread-per-request model per spec §5), until the process exits.
pub async fn run(host: &str, port: u16, pool: Arc<Pool>) -> std::io::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    tracing::info!(host, port, "control plane listening");
    loop {
        let (stream, _peer) = listener.accept().await?;
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if let Err(e) = serve_one(stream, &pool).await {
                tracing::debug!(error = %e, "control plane connection ended with error");
            }
        });
    }
}

async fn serve_one(mut stream: TcpStream, pool: &Pool) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(512);
    let mut tmp = [0u8; 512];
    loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 8192 {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let path = text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let body = match path {
        "/favicon.ico" => return write_response(&mut stream, 404, "Not Found", "").await,
        "/stats" => stats_csv(pool).await,
        _ => pool.next_endpoint().await,
    };
    write_response(&mut stream, 200, "OK", &body).await
}

async fn stats_csv(pool: &Pool) -> String {
    let mut out = String::from("index,local_port,remote_host,remote_port,username,last_used,lru_position\n");
    for row in pool.stats_rows().await {
        let last_used = if row.last_used == 0 {
            String::new()
        } else {
            format_local_time(row.last_used)
        };
        out.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            row.index, row.local_port, row.remote_host, row.remote_port, row.username, last_used, row.lru_position
        ));
    }
    out
}

/// Formats a Unix timestamp (seconds) as `YYYY-MM-DD HH:MM:SS` in local time.
fn format_local_time(unix_secs: u64) -> String {
    match Local.timestamp_opt(unix_secs as i64, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => String::new(),
    }
}

async fn write_response(stream: &mut TcpStream, status: u16, reason: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {len}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\r\n\
         {body}",
        status = status,
        reason = reason,
        len = body.len(),
        body = body,
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GatewayOptions, Upstream};
    use tokio::net::TcpStream;

    fn opts() -> GatewayOptions {
        GatewayOptions {
            host: "127.0.0.1".to_string(),
            control_port: 0,
            proxy_file: "unused".to_string(),
            max_active_proxies: 2,
            port_start: 21000,
            dual_proxy: false,
        }
    }

    #[tokio::test]
    async fn root_route_returns_plain_endpoint_body() {
        let pool = Pool::new(opts(), vec![Upstream::new("a".into(), 1080, "1".into(), "1".into())]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool_for_server = Arc::clone(&pool);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_one(stream, &pool_for_server).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut resp = Vec::new();
        client.read_to_end(&mut resp).await.unwrap();
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains("200 OK"));
        assert!(text.contains("127.0.0.1:21000"));
        assert!(text.contains("Access-Control-Allow-Origin: *"));
    }

    #[tokio::test]
    async fn favicon_route_returns_404() {
        let pool = Pool::new(opts(), vec![Upstream::new("a".into(), 1080, "1".into(), "1".into())]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_one(stream, &pool).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /favicon.ico HTTP/1.1\r\n\r\n").await.unwrap();
        let mut resp = Vec::new();
        client.read_to_end(&mut resp).await.unwrap();
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn stats_route_returns_csv_header() {
        let pool = Pool::new(opts(), vec![Upstream::new("a".into(), 1080, "1".into(), "1".into())]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_one(stream, &pool).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /stats HTTP/1.1\r\n\r\n").await.unwrap();
        let mut resp = Vec::new();
        client.read_to_end(&mut resp).await.unwrap();
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains("index,local_port,remote_host,remote_port,username,last_used,lru_position"));
    }
}
