//! rotary_gate/src/main.rs
//! CLI entry point (spec §6 ¶4): parses flags, loads the upstream list,
//! starts the rotation pool and control plane, and shuts down cleanly on
//! Ctrl-C.

use clap::Parser;
use rotary_gate::pool::Pool;
use rotary_gate::proxyfile;
use rotary_gate::types::GatewayOptions;
use rotary_gate::{control, logging};
use std::path::PathBuf;
use std::process::ExitCode;

/// Rotating SOCKS5/HTTP proxy gateway.
#[derive(Parser, Debug)]
#[command(name = "rotary-gate", about = "Rotating SOCKS5/HTTP proxy gateway")]
struct Args {
    /// Control-plane bind address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Control-plane port.
    #[arg(long, default_value_t = 7777)]
    port: u16,

    /// Path to the upstream proxy list file.
    #[arg(long = "proxy-file")]
    proxy_file: PathBuf,

    /// Number of local listener ports to keep active.
    #[arg(long = "max-active-proxies", default_value_t = 200)]
    max_active_proxies: u16,

    /// First local listener port; the pool occupies
    /// `[port_start, port_start + max_active_proxies)`.
    #[arg(long = "port-start", default_value_t = 10000)]
    port_start: u16,

    /// Chain each client connection through two upstreams instead of one.
    #[arg(long = "dual-proxy", default_value_t = false)]
    dual_proxy: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_logging("info");

    let args = Args::parse();

    let upstreams = match proxyfile::load_upstreams(&args.proxy_file) {
        Ok(u) => u,
        Err(e) => {
            tracing::error!(path = %args.proxy_file.display(), error = %e, "could not read proxy file");
            return ExitCode::FAILURE;
        }
    };
    if upstreams.is_empty() {
        tracing::error!(path = %args.proxy_file.display(), "proxy file contained no usable upstreams");
        return ExitCode::FAILURE;
    }
    tracing::info!(count = upstreams.len(), dual_proxy = args.dual_proxy, "loaded upstreams");

    let options = GatewayOptions {
        host: args.host.clone(),
        control_port: args.port,
        proxy_file: args.proxy_file.display().to_string(),
        max_active_proxies: args.max_active_proxies,
        port_start: args.port_start,
        dual_proxy: args.dual_proxy,
    };

    let pool = Pool::new(options, upstreams);
    pool.spawn_workers();

    let pool_for_control = pool.clone();
    let control_host = args.host.clone();
    let control_port = args.port;
    let control_task = tokio::spawn(async move {
        if let Err(e) = control::run(&control_host, control_port, pool_for_control).await {
            tracing::error!(error = %e, "control plane exited");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = control_task => {
            tracing::error!("control plane task ended unexpectedly");
        }
    }

    pool.shutdown().await;
    ExitCode::SUCCESS
}
