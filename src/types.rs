//! rotary_gate/src/types.rs
//! Core data-model records shared by the pool, dialers and control plane.

use std::sync::atomic::{AtomicU64, Ordering};

/// Status of an [`Upstream`] as tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStatus {
    Inactive,
    Active,
}

/// A single externally operated SOCKS5 proxy loaded from the proxy file.
///
/// Identity (`host`, `port`, `username`, `password`) never changes after
/// load; the vector index assigned at load time is the stable key used by
/// bindings, the LRU tracker and the rotation cursor.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub status: UpstreamStatus,
    /// Unix timestamp (seconds), 0 if never used. Rendered as local
    /// `YYYY-MM-DD HH:MM:SS` by the control plane's `/stats` route.
    pub last_used: u64,
    /// Reserved; never incremented in the current design (see spec §3/§9).
    pub fail_count: u32,
}

impl Upstream {
    pub fn new(host: String, port: u16, username: String, password: String) -> Self {
        Upstream {
            host,
            port,
            username,
            password,
            status: UpstreamStatus::Inactive,
            last_used: 0,
            fail_count: 0,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-dispatch counter kept on a [`Binding`]; mirrors `geofront::ConnMetrics`'s
/// use of `AtomicU64` for lock-free increments under a shared read lock.
#[derive(Debug, Default)]
pub struct DispatchCounter(AtomicU64);

impl DispatchCounter {
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The runtime association of a local listener port to a chosen upstream
/// (or, in dual-layer mode, a pair of upstreams).
pub struct Binding {
    pub proxy_index: usize,
    /// Second-hop upstream index; `Some` only in dual-layer mode.
    pub second_layer: Option<usize>,
    pub start_time: u64,
    pub connections: DispatchCounter,
    /// Signals the listener task for this port to stop accepting and exit.
    pub stop: tokio::sync::watch::Sender<bool>,
}

impl Binding {
    pub fn new(
        proxy_index: usize,
        second_layer: Option<usize>,
        start_time: u64,
    ) -> (Self, tokio::sync::watch::Receiver<bool>) {
        let (stop, rx) = tokio::sync::watch::channel(false);
        (
            Binding {
                proxy_index,
                second_layer,
                start_time,
                connections: DispatchCounter::default(),
                stop,
            },
            rx,
        )
    }

    pub fn request_stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Gateway-wide configuration resolved from CLI flags (see §6).
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub host: String,
    pub control_port: u16,
    pub proxy_file: String,
    pub max_active_proxies: u16,
    pub port_start: u16,
    pub dual_proxy: bool,
}
