// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host inspection: OS, isolation, capabilities and the agent's address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::OnceLock;

use kraken_protocol::HostInfo;
use tokio::net::UdpSocket;
use url::Url;

use crate::error::{Error, Result};
use crate::exec;

/// Fields of `/etc/os-release` the agent cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    /// Lowercase distro id, e.g. `ubuntu`.
    pub id: String,
    pub version_id: String,
    pub pretty_name: String,
}

pub fn parse_os_release(text: &str) -> OsRelease {
    let mut out = OsRelease::default();
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        match key {
            "ID" => out.id = value.to_lowercase(),
            "VERSION_ID" => out.version_id = value,
            "PRETTY_NAME" => out.pretty_name = value,
            _ => {}
        }
    }
    out
}

/// Host name, read once.
pub fn hostname() -> String {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME
        .get_or_init(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .or_else(|_| std::fs::read_to_string("/etc/hostname"))
                .map(|s| s.trim().to_string())
                .ok()
                .filter(|s| !s.is_empty())
                .or_else(|| std::env::var("HOSTNAME").ok())
                .unwrap_or_else(|| "localhost".to_string())
        })
        .clone()
}

pub fn in_docker() -> bool {
    Path::new("/.dockerenv").exists() || cgroup_mentions("docker")
}

pub fn in_lxc() -> bool {
    std::env::var("container").is_ok_and(|v| v == "lxc")
        || std::fs::read_to_string("/proc/1/environ")
            .is_ok_and(|env| env.split('\0').any(|kv| kv == "container=lxc"))
        || cgroup_mentions("lxc")
}

fn cgroup_mentions(needle: &str) -> bool {
    std::fs::read_to_string("/proc/1/cgroup").is_ok_and(|s| s.contains(needle))
}

/// `(isolation_type, isolation)`
pub fn isolation() -> (&'static str, &'static str) {
    if in_docker() {
        ("container", "docker")
    } else if in_lxc() {
        ("container", "lxc")
    } else {
        ("bare-metal", "bare-metal")
    }
}

/// Describe this host for `sys-info`.
///
/// `system` is the declared system id when given, else `<distro>-<version>`.
pub async fn collect_host_info(system_id: Option<&str>) -> HostInfo {
    let os = tokio::fs::read_to_string("/etc/os-release")
        .await
        .map(|t| parse_os_release(&t))
        .unwrap_or_default();
    let system = match system_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ if !os.id.is_empty() => format!("{}-{}", os.id, os.version_id),
        _ => std::env::consts::OS.to_string(),
    };
    let (isolation_type, isolation) = isolation();
    HostInfo {
        system,
        system_type: std::env::consts::OS.to_string(),
        distro_name: os.id,
        distro_version: os.version_id,
        isolation_type: isolation_type.to_string(),
        isolation: isolation.to_string(),
        capabilities: exec::detect_capabilities().await,
    }
}

/// Address the agent reports to the server, and the IP tools can reach it on.
///
/// `KRAKEN_AGENT_SLOT=<n>` gives `agent.<n>`, `KRAKEN_AGENT_BUILTIN` gives
/// `agent`; otherwise the address is the local IP routing to the server.
pub async fn agent_address(server: &str) -> Result<(String, IpAddr)> {
    let ip = local_ip_towards(server).await?;
    if let Some(slot) = std::env::var("KRAKEN_AGENT_SLOT").ok().filter(|s| !s.is_empty()) {
        return Ok((format!("agent.{}", slot), ip));
    }
    if std::env::var_os("KRAKEN_AGENT_BUILTIN").is_some() {
        return Ok(("agent".to_string(), ip));
    }
    Ok((ip.to_string(), ip))
}

/// Local IP chosen by the routing table for traffic to `server`.
///
/// Connecting a UDP socket sends nothing; it only binds a route.
pub async fn local_ip_towards(server: &str) -> Result<IpAddr> {
    let url = Url::parse(server).map_err(|e| Error::Config(format!("invalid server URL: {}", e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Config(format!("server URL has no host: {}", server)))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let target = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::Config(format!("cannot resolve server host '{}'", host)))?;
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}
