//! rotary_gate/src/state.rs
//! Process-wide ambient state: metrics counters and the logging reload handle.
//!
//! Pool state itself is not global. It is constructed once in `main` and
//! shared via `Arc` with the listener tasks and the control plane, following
//! the teacher's `LISTENER_STATE`/`CONN_MANAGER` pattern but without the
//! lazy_static indirection, since there is exactly one pool per process and
//! no FFI boundary that needs a process-wide singleton to reach into.

use lazy_static::lazy_static;
use std::sync::atomic::AtomicU64;
use tracing_subscriber::{filter::EnvFilter, reload::Handle as ReloadHandle};

pub static TOTAL_CONN: AtomicU64 = AtomicU64::new(0);
pub static ACTIVE_CONN: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_BYTES_SENT: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_BYTES_RECV: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    pub static ref RELOAD_HANDLE: std::sync::Mutex<Option<ReloadHandle<EnvFilter, tracing_subscriber::Registry>>> =
        std::sync::Mutex::new(None);
}
