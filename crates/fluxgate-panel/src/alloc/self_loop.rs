//! Rejects forwards whose target is the entry listener itself.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use tokio::net::lookup_host;
use tracing::debug;

use crate::storage::Node;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("remote address {target} points at the entry listener {listener} and would loop")]
pub struct SelfLoop {
    pub target: String,
    pub listener: String,
}

/// Split `host:port`, `[v6]:port`, or a bare host.
pub fn split_host_port(addr: &str) -> (&str, Option<u16>) {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    match addr.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal without a port.
        Some((host, _)) if host.contains(':') => (addr, None),
        Some((host, port)) => (host, port.parse().ok()),
        None => (addr, None),
    }
}

async fn resolve(host: &str) -> HashSet<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return HashSet::from([ip]);
    }
    match tokio::time::timeout(RESOLVE_TIMEOUT, lookup_host((host, 0))).await {
        Ok(Ok(addrs)) => addrs.map(|a| a.ip()).collect(),
        Ok(Err(e)) => {
            debug!(host, error = %e, "Could not resolve host for self-loop check");
            HashSet::new()
        }
        Err(_) => {
            debug!(host, "Timed out resolving host for self-loop check");
            HashSet::new()
        }
    }
}

/// Fail if any comma-separated target in `remote_addr` reaches `entry` on
/// `listen_port`.
///
/// Hosts that do not resolve are compared by name only.
pub async fn check_self_loop(
    entry: &Node,
    listen_port: u16,
    remote_addr: &str,
) -> Result<(), SelfLoop> {
    let entry_hosts = entry.entry_addresses();
    let mut entry_ips = HashSet::new();
    for host in &entry_hosts {
        entry_ips.extend(resolve(split_host_port(host).0).await);
    }

    for target in remote_addr.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (host, port) = split_host_port(target);
        if port != Some(listen_port) {
            continue;
        }
        let same_name = entry_hosts
            .iter()
            .any(|h| split_host_port(h).0.eq_ignore_ascii_case(host));
        if same_name || !resolve(host).await.is_disjoint(&entry_ips) {
            return Err(SelfLoop {
                target: target.to_string(),
                listener: format!("{host}:{listen_port}"),
            });
        }
    }
    Ok(())
}
