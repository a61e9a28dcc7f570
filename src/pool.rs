//! rotary_gate/src/pool.rs
//! The rotation pool: owns all upstreams, active port bindings, the
//! dispatch/rotation cursors, and the rebind worker queue (spec §4.7).
//!
//! Single-layer and dual-layer ("chain pool", spec §4.7/§2) modes share this
//! one implementation (`Binding::second_layer` is `Some` only in dual mode)
//! rather than a separate specialized type, collapsing what the spec frames
//! as two sibling components into one generic one. See DESIGN.md.
//!
//! Locking discipline follows spec §5 exactly: the pool lock is released
//! before any socket operation or LRU-lock acquisition, and the two locks
//! are never held nested.

use crate::listener;
use crate::lru::LruTracker;
use crate::types::{Binding, GatewayOptions, Upstream, UpstreamStatus};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const LOCK_TIMEOUT: Duration = Duration::from_secs(3);
const REBIND_WORKERS: usize = 5;
const REBIND_QUEUE_DEPTH: usize = 256;

struct PoolInner {
    all_upstreams: Vec<Upstream>,
    active: HashMap<u16, Binding>,
    port_pool: VecDeque<u16>,
    current_index: usize,
    stopped: bool,
}

pub struct Pool {
    options: GatewayOptions,
    inner: Mutex<PoolInner>,
    lru: Mutex<LruTracker>,
    current_port: AtomicU16,
    rebind_tx: mpsc::Sender<u16>,
    rebind_rx: Mutex<Option<mpsc::Receiver<u16>>>,
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Pool {
    pub fn new(options: GatewayOptions, all_upstreams: Vec<Upstream>) -> Arc<Pool> {
        let port_pool = (options.port_start..options.port_start + options.max_active_proxies).collect();
        let (rebind_tx, rebind_rx) = mpsc::channel(REBIND_QUEUE_DEPTH);
        Arc::new(Pool {
            current_port: AtomicU16::new(options.port_start),
            inner: Mutex::new(PoolInner {
                all_upstreams,
                active: HashMap::new(),
                port_pool,
                current_index: 0,
                stopped: false,
            }),
            lru: Mutex::new(LruTracker::new()),
            rebind_tx,
            rebind_rx: Mutex::new(Some(rebind_rx)),
            options,
        })
    }

    /// Enqueues a rebind for every port in `[port_start, port_start+max_active)`
    /// and starts the fixed pool of rebind workers. Call once at startup.
    pub fn spawn_workers(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let receiver = {
                let mut guard = pool.rebind_rx.lock().await;
                guard.take().expect("rebind receiver taken twice")
            };
            let receiver = Arc::new(Mutex::new(receiver));
            for _ in 0..REBIND_WORKERS {
                let pool = Arc::clone(&pool);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let port = {
                            let mut rx = receiver.lock().await;
                            match rx.recv().await {
                                Some(p) => p,
                                None => break,
                            }
                        };
                        pool.rebind(port).await;
                    }
                });
            }
        });

        let ports: Vec<u16> = (self.options.port_start..self.options.port_start + self.options.max_active_proxies).collect();
        let tx = self.rebind_tx.clone();
        tokio::spawn(async move {
            for p in ports {
                let _ = tx.send(p).await;
            }
        });
    }

    /// Lock-free monotonic advance of the dispatch cursor; returns the value
    /// to use for *this* call. Kept outside the pool lock so a lock timeout
    /// in `next_endpoint()` can still return and advance the cursor
    /// (availability over consistency, spec §4.7/§5).
    fn advance_dispatch_cursor(&self) -> u16 {
        loop {
            let p = self.current_port.load(Ordering::SeqCst);
            let offset = p - self.options.port_start;
            let next = self.options.port_start + ((offset + 1) % self.options.max_active_proxies);
            if self
                .current_port
                .compare_exchange(p, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return p;
            }
        }
    }

    /// Returns the next `127.0.0.1:<port>` endpoint and enqueues a rebind for
    /// the port just handed out, per spec §4.7 `next_endpoint()`.
    pub async fn next_endpoint(&self) -> String {
        let port = self.advance_dispatch_cursor();

        if let Ok(mut guard) = tokio::time::timeout(LOCK_TIMEOUT, self.inner.lock()).await {
            let proxy_index = guard.active.get(&port).map(|b| {
                b.connections.increment();
                b.proxy_index
            });
            drop(guard);

            if let Some(i) = proxy_index {
                self.lru.lock().await.mark_used(i);
                if let Ok(mut guard) = tokio::time::timeout(LOCK_TIMEOUT, self.inner.lock()).await {
                    if let Some(u) = guard.all_upstreams.get_mut(i) {
                        u.last_used = now_unix();
                    }
                }
                let _ = self.rebind_tx.try_send(port);
            }
        }
        // Lock timeout: degrade gracefully, cursor has already advanced above.

        format!("127.0.0.1:{}", port)
    }

    async fn rebind(&self, port: u16) {
        // Phase 1: tear down the old binding, if any (short lock -> IO -> short lock).
        let old_stop = {
            let guard = self.inner.lock().await;
            guard.active.get(&port).map(|b| b.stop.clone())
        };
        if let Some(stop) = old_stop {
            let _ = stop.send(true);
            let mut guard = self.inner.lock().await;
            if let Some(binding) = guard.active.remove(&port) {
                if let Some(u) = guard.all_upstreams.get_mut(binding.proxy_index) {
                    u.status = UpstreamStatus::Inactive;
                }
                drop(guard);
                self.lru.lock().await.remove(binding.proxy_index);
                let mut guard = self.inner.lock().await;
                guard.port_pool.push_back(port);
            }
        }

        // Phase 2: choose the next upstream(s) under the lock, release, then start I/O.
        let chosen = {
            let mut guard = self.inner.lock().await;
            if guard.stopped || guard.all_upstreams.is_empty() {
                return;
            }
            // Leaves the free list here, whether or not an upstream ends up
            // chosen below, so `active` and `port_pool` never both hold it.
            guard.port_pool.retain(|&p| p != port);
            let n = guard.all_upstreams.len();
            let i1 = guard.current_index;
            guard.current_index = (guard.current_index + 1) % n;

            let i2 = if self.options.dual_proxy {
                if n < 2 {
                    tracing::error!(port, "dual-proxy mode needs at least 2 upstreams to pick a distinct second layer");
                    None
                } else {
                    let mut rng = rand::thread_rng();
                    loop {
                        let candidate = rng.gen_range(0..n);
                        if candidate != i1 {
                            break Some(candidate);
                        }
                    }
                }
            } else {
                None
            };

            if self.options.dual_proxy && i2.is_none() {
                guard.port_pool.push_back(port);
                return;
            }

            guard.all_upstreams[i1].status = UpstreamStatus::Active;
            if let Some(i2) = i2 {
                guard.all_upstreams[i2].status = UpstreamStatus::Active;
            }
            (i1, i2, guard.all_upstreams[i1].clone(), i2.map(|i| guard.all_upstreams[i].clone()))
        };
        let (i1, i2, primary, secondary) = chosen;

        {
            let mut lru = self.lru.lock().await;
            lru.mark_used(i1);
            if let Some(i2) = i2 {
                lru.mark_used(i2);
            }
        }

        let (binding, stop_rx) = Binding::new(i1, i2, now_unix());
        {
            let mut guard = self.inner.lock().await;
            guard.active.insert(port, binding);
        }

        let listener_result = listener::spawn_listener(port, primary, secondary, stop_rx).await;
        if let Err(e) = listener_result {
            tracing::error!(port, error = %e, "failed to start listener, reverting binding");
            let mut guard = self.inner.lock().await;
            guard.active.remove(&port);
            guard.all_upstreams[i1].status = UpstreamStatus::Inactive;
            guard.port_pool.push_back(port);
            drop(guard);
            self.lru.lock().await.remove(i1);
        }
    }

    /// Snapshot for the control plane's `/stats` route: one row per active
    /// port, sorted by LRU position ascending.
    pub async fn stats_rows(&self) -> Vec<StatsRow> {
        let snapshot: Vec<(u16, usize, String, u16, String, u64)> = {
            let guard = self.inner.lock().await;
            guard
                .active
                .iter()
                .map(|(port, binding)| {
                    let upstream = &guard.all_upstreams[binding.proxy_index];
                    (
                        *port,
                        binding.proxy_index,
                        upstream.host.clone(),
                        upstream.port,
                        upstream.username.clone(),
                        upstream.last_used,
                    )
                })
                .collect()
        };

        let lru = self.lru.lock().await;
        let mut rows: Vec<StatsRow> = snapshot
            .into_iter()
            .map(|(local_port, index, remote_host, remote_port, username, last_used)| StatsRow {
                index,
                local_port,
                remote_host,
                remote_port,
                username,
                last_used,
                lru_position: lru.position(index),
            })
            .collect();
        rows.sort_by_key(|r| r.lru_position);
        rows
    }

    pub fn port_start(&self) -> u16 {
        self.options.port_start
    }

    /// Stops the pool: marks it stopped under the lock, then stops every
    /// active listener outside the lock. Idempotent: calling twice leaves
    /// `active` empty and never panics.
    pub async fn shutdown(&self) {
        let ports: Vec<tokio::sync::watch::Sender<bool>> = {
            let mut guard = self.inner.lock().await;
            if guard.stopped {
                return;
            }
            guard.stopped = true;
            let senders = guard.active.values().map(|b| b.stop.clone()).collect();
            guard.active.clear();
            senders
        };
        for s in ports {
            let _ = s.send(true);
        }
    }
}

pub struct StatsRow {
    pub index: usize,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub username: String,
    pub last_used: u64,
    pub lru_position: i64,
}
