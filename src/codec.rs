//! rotary_gate/src/codec.rs
//! SOCKS5 wire codec and minimal HTTP request-line/header parsing.
//!
//! Generic over `AsyncRead`/`AsyncWrite` the way the teacher's `protocol.rs`
//! keeps its varint/string codec generic over stream bounds, so the same
//! functions serve client-facing and upstream-facing sockets alike.

use crate::error::SocksError;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const SOCKS_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_V4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_V6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_RULESET_DENIED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// A CONNECT target as carried in SOCKS5 framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl Addr {
    /// Classifies a `host` string for outbound SOCKS5 framing: IPv4 literal,
    /// then IPv6 literal, falling back to domain. Mirrors spec §4.1's
    /// "try IPv4 → IPv6 → domain" order.
    pub fn classify(host: &str) -> Result<Addr, SocksError> {
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return Ok(Addr::V4(v4));
        }
        if host.contains(':') {
            if let Ok(v6) = host.parse::<Ipv6Addr>() {
                return Ok(Addr::V6(v6));
            }
        }
        if host.len() > 255 {
            return Err(SocksError::AddressTooLong);
        }
        Ok(Addr::Domain(host.to_string()))
    }

    pub fn to_host_string(&self) -> String {
        match self {
            Addr::V4(a) => a.to_string(),
            Addr::V6(a) => a.to_string(),
            Addr::Domain(d) => d.clone(),
        }
    }
}

/// Reads a client greeting `0x05 | NMETHODS | METHODS[..]`, returns offered methods.
pub async fn read_greeting<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut head = [0u8; 2];
    r.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(proto_err("bad SOCKS version in greeting"));
    }
    let n = head[1] as usize;
    let mut methods = vec![0u8; n];
    if n > 0 {
        r.read_exact(&mut methods).await?;
    }
    Ok(methods)
}

/// Writes a greeting `0x05 | NMETHODS | METHODS[..]` to an upstream.
pub async fn write_greeting<W: AsyncWriteExt + Unpin>(w: &mut W, methods: &[u8]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(2 + methods.len());
    buf.push(SOCKS_VERSION);
    buf.push(methods.len() as u8);
    buf.extend_from_slice(methods);
    w.write_all(&buf).await
}

/// Writes the greeting reply `0x05 | METHOD`.
pub async fn write_method_selection<W: AsyncWriteExt + Unpin>(w: &mut W, method: u8) -> std::io::Result<()> {
    w.write_all(&[SOCKS_VERSION, method]).await
}

/// Reads the greeting reply `0x05 | METHOD`, returning the selected method.
pub async fn read_method_selection<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<u8> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(proto_err("bad SOCKS version in method selection"));
    }
    Ok(buf[1])
}

/// Sends a username/password sub-negotiation and returns true on success.
pub async fn user_pass_auth<S: AsyncReadExt + AsyncWriteExt + Unpin>(
    s: &mut S,
    username: &str,
    password: &str,
) -> std::io::Result<bool> {
    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(0x01);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    s.write_all(&buf).await?;

    let mut reply = [0u8; 2];
    s.read_exact(&mut reply).await?;
    Ok(reply[1] == 0x00)
}

/// Serves the upstream-facing username/password sub-negotiation server side.
/// Not used on the client-facing path (client side always accepts NO_AUTH).
pub async fn read_user_pass<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<(String, String)> {
    let mut ver_ulen = [0u8; 2];
    r.read_exact(&mut ver_ulen).await?;
    let ulen = ver_ulen[1] as usize;
    let mut uname = vec![0u8; ulen];
    r.read_exact(&mut uname).await?;
    let mut plen_buf = [0u8; 1];
    r.read_exact(&mut plen_buf).await?;
    let plen = plen_buf[0] as usize;
    let mut passwd = vec![0u8; plen];
    r.read_exact(&mut passwd).await?;
    Ok((
        String::from_utf8_lossy(&uname).into_owned(),
        String::from_utf8_lossy(&passwd).into_owned(),
    ))
}

/// Writes the CONNECT request `0x05 | 0x01 | 0x00 | ATYP | DST.ADDR | DST.PORT`.
pub async fn write_connect_request<W: AsyncWriteExt + Unpin>(w: &mut W, addr: &Addr, port: u16) -> std::io::Result<()> {
    let mut buf = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match addr {
        Addr::V4(a) => {
            buf.push(ATYP_V4);
            buf.extend_from_slice(&a.octets());
        }
        Addr::V6(a) => {
            buf.push(ATYP_V6);
            buf.extend_from_slice(&a.octets());
        }
        Addr::Domain(d) => {
            buf.push(ATYP_DOMAIN);
            buf.push(d.len() as u8);
            buf.extend_from_slice(d.as_bytes());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    w.write_all(&buf).await
}

/// Parsed client CONNECT request (command is always CONNECT; other commands error).
pub struct ConnectRequest {
    pub addr: Addr,
    pub port: u16,
}

/// Reads `0x05 | CMD | 0x00 | ATYP | DST.ADDR | DST.PORT` from a client.
pub async fn read_connect_request<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<ConnectRequest, SocksError> {
    let mut head = [0u8; 4];
    r.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::ProtocolError("bad SOCKS version in request"));
    }
    if head[1] != CMD_CONNECT {
        return Err(SocksError::ProtocolError("only CONNECT is supported"));
    }
    let addr = read_address(r, head[3]).await?;
    let mut port_buf = [0u8; 2];
    r.read_exact(&mut port_buf).await?;
    Ok(ConnectRequest {
        addr,
        port: u16::from_be_bytes(port_buf),
    })
}

async fn read_address<R: AsyncReadExt + Unpin>(r: &mut R, atyp: u8) -> Result<Addr, SocksError> {
    match atyp {
        ATYP_V4 => {
            let mut b = [0u8; 4];
            r.read_exact(&mut b).await?;
            Ok(Addr::V4(Ipv4Addr::from(b)))
        }
        ATYP_V6 => {
            let mut b = [0u8; 16];
            r.read_exact(&mut b).await?;
            Ok(Addr::V6(Ipv6Addr::from(b)))
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            r.read_exact(&mut len_buf).await?;
            let mut d = vec![0u8; len_buf[0] as usize];
            r.read_exact(&mut d).await?;
            Ok(Addr::Domain(String::from_utf8_lossy(&d).into_owned()))
        }
        _ => Err(SocksError::ProtocolError("unsupported address type")),
    }
}

/// Writes a CONNECT reply `0x05 | REP | 0x00 | ATYP | BND.ADDR | BND.PORT`.
/// Callers pass `0.0.0.0:0` as the bound address on both success and failure,
/// per spec §4.5.
pub async fn write_reply<W: AsyncWriteExt + Unpin>(w: &mut W, rep: u8) -> std::io::Result<()> {
    let buf = [SOCKS_VERSION, rep, 0x00, ATYP_V4, 0, 0, 0, 0, 0, 0];
    w.write_all(&buf).await
}

/// Reads and discards an upstream's CONNECT reply, returning its REP byte.
pub async fn read_reply<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<u8, SocksError> {
    let mut head = [0u8; 4];
    r.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::ProtocolError("bad SOCKS version in reply"));
    }
    let rep = head[1];
    // discard BND.ADDR + BND.PORT regardless of rep, the upstream always sends them
    match head[3] {
        ATYP_V4 => {
            let mut b = [0u8; 4 + 2];
            r.read_exact(&mut b).await?;
        }
        ATYP_V6 => {
            let mut b = [0u8; 16 + 2];
            r.read_exact(&mut b).await?;
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            r.read_exact(&mut len_buf).await?;
            let mut b = vec![0u8; len_buf[0] as usize + 2];
            r.read_exact(&mut b).await?;
        }
        _ => return Err(SocksError::ProtocolError("unsupported address type in reply")),
    }
    Ok(rep)
}

fn proto_err(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

/// A parsed HTTP request head (request line + headers), plus the raw bytes
/// read so far (which may include the start of the body on a single read).
pub struct HttpHead {
    pub method: String,
    pub target: String,
    pub raw: Vec<u8>,
}

/// Reads one HTTP request head from `r`, buffering until `\r\n\r\n`. Caps at
/// 64 KiB to bound memory on malformed/slow clients.
pub async fn read_http_head<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<HttpHead, SocksError> {
    let mut buf = Vec::with_capacity(1024);
    let mut tmp = [0u8; 1024];
    loop {
        let n = r.read(&mut tmp).await?;
        if n == 0 {
            return Err(SocksError::ProtocolError("client closed before headers"));
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Err(SocksError::ProtocolError("headers too large"));
        }
    }
    let head_str = String::from_utf8_lossy(&buf);
    let line = head_str.lines().next().unwrap_or("");
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or(SocksError::ProtocolError("missing HTTP method"))?
        .to_string();
    let target = parts
        .next()
        .ok_or(SocksError::ProtocolError("missing HTTP target"))?
        .to_string();
    Ok(HttpHead { method, target, raw: buf })
}

/// Extracts the first `Host:` header (case-insensitive), if present.
pub fn find_host_header(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    for line in text.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Resolves `(host, port)` for a non-CONNECT request: absolute-form `http://`
/// target, or origin-form path resolved against the `Host:` header.
pub fn resolve_http_target(target: &str, raw: &[u8]) -> Option<(String, u16)> {
    if let Some(rest) = target.strip_prefix("http://") {
        let authority = rest.split('/').next().unwrap_or(rest);
        return Some(split_host_port(authority, 80));
    }
    let host = find_host_header(raw)?;
    Some(split_host_port(&host, 80))
}

/// Resolves `(host, port)` for a CONNECT target `host[:port]`, default 443.
pub fn resolve_connect_target(target: &str) -> (String, u16) {
    split_host_port(target, 443)
}

fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(idx) = authority.rfind(':') {
        if let Ok(port) = authority[idx + 1..].parse::<u16>() {
            return (authority[..idx].to_string(), port);
        }
    }
    (authority.to_string(), default_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_v4_v6_and_domain() {
        assert_eq!(Addr::classify("93.184.216.34").unwrap(), Addr::V4("93.184.216.34".parse().unwrap()));
        assert_eq!(Addr::classify("::1").unwrap(), Addr::V6("::1".parse().unwrap()));
        assert_eq!(Addr::classify("example.com").unwrap(), Addr::Domain("example.com".to_string()));
    }

    #[test]
    fn rejects_domain_over_255_bytes() {
        let long = "a".repeat(256);
        assert!(matches!(Addr::classify(&long), Err(SocksError::AddressTooLong)));
    }

    #[test]
    fn resolves_connect_target_with_default_port() {
        assert_eq!(resolve_connect_target("example.com"), ("example.com".to_string(), 443));
        assert_eq!(resolve_connect_target("example.com:8443"), ("example.com".to_string(), 8443));
    }

    #[test]
    fn resolves_absolute_form_http_target() {
        let raw = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(resolve_http_target("http://example.com/", raw), Some(("example.com".to_string(), 80)));
    }

    #[test]
    fn resolves_origin_form_via_host_header() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        assert_eq!(resolve_http_target("/", raw), Some(("example.com".to_string(), 8080)));
    }

    #[tokio::test]
    async fn greeting_round_trips() {
        let mut buf = Vec::new();
        write_greeting(&mut buf, &[METHOD_NO_AUTH, METHOD_USER_PASS]).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let methods = read_greeting(&mut cursor).await.unwrap();
        assert_eq!(methods, vec![METHOD_NO_AUTH, METHOD_USER_PASS]);
    }

    #[tokio::test]
    async fn connect_request_round_trips_for_each_address_type() {
        for addr in [
            Addr::V4("10.0.0.1".parse().unwrap()),
            Addr::V6("::1".parse().unwrap()),
            Addr::Domain("example.com".to_string()),
        ] {
            let mut buf = Vec::new();
            write_connect_request(&mut buf, &addr, 8080).await.unwrap();
            let mut cursor = std::io::Cursor::new(buf);
            let parsed = read_connect_request(&mut cursor).await.unwrap();
            assert_eq!(parsed.addr, addr);
            assert_eq!(parsed.port, 8080);
        }
    }
}
