//! rotary_gate/src/proxyfile.rs
//! Upstream list file loader (spec §6), ported from
//! `proxy_core/pool/proxy_pool_base.py::_load_proxies`.

use crate::types::Upstream;
use std::fs;
use std::path::Path;

/// Parses the upstream list file: non-blank, non-`#` lines with 2-4
/// whitespace-separated fields `host port [username [password]]`. Invalid or
/// out-of-range ports skip the line with a debug log; missing credentials
/// default to the literal strings `"1"`/`"1"`. Duplicate lines are kept as
/// distinct records.
pub fn load_upstreams(path: &Path) -> std::io::Result<Vec<Upstream>> {
    let contents = fs::read_to_string(path)?;
    let mut upstreams = Vec::new();
    let mut valid = 0u32;
    let mut invalid = 0u32;

    for (line_num, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            tracing::debug!(line = line_num + 1, "skipping line: need at least host and port");
            invalid += 1;
            continue;
        }
        let host = parts[0].to_string();
        let port: u16 = match parts[1].parse::<u32>() {
            Ok(p) if (1..=65535).contains(&p) => p as u16,
            Ok(p) => {
                tracing::debug!(line = line_num + 1, port = p, "port out of range");
                invalid += 1;
                continue;
            }
            Err(_) => {
                tracing::debug!(line = line_num + 1, raw = parts[1], "port is not an integer");
                invalid += 1;
                continue;
            }
        };
        let username = parts.get(2).unwrap_or(&"1").to_string();
        let password = parts.get(3).unwrap_or(&"1").to_string();
        upstreams.push(Upstream::new(host, port, username, password));
        valid += 1;
    }

    if invalid > 0 {
        tracing::info!(valid, invalid, path = %path.display(), "loaded upstream list with some invalid entries");
    } else {
        tracing::info!(valid, path = %path.display(), "loaded upstream list");
    }
    Ok(upstreams)
}
