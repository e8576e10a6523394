//! Egress watchdog: fail-closed guard against unauthorized outbound traffic.
//!
//! A background task periodically enumerates the TCP sockets owned by this
//! process (rows of `/proc/net/tcp{,6}` on Linux whose inode appears in
//! `/proc/self/fd`) and checks every established or connecting remote against
//! the allow-listed subnets. On the first violation it records an
//! `egress_block` audit event and terminates the whole process with exit
//! code 1. Air-gapping is a runtime property here, not a deployment promise:
//! the broker prefers dying to phoning home.
//!
//! Scope: the broker's own sockets. Sandboxed tool children run with the
//! network namespace unshared and cannot open remote sockets at all;
//! unsandboxed children are bounded by the executor timeout, not this sweep.

use crate::audit::{AuditSink, EventKind};
use crate::config::CoreConfig;
use crate::error::{WardenError, WardenResult};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Subnets outbound connections may target. No cloud IPs.
const SAFE_SUBNETS: &[&str] = &[
    "127.0.0.0/8",    // loopback
    "::1/128",        // IPv6 loopback
    "10.0.0.0/8",     // private
    "172.16.0.0/12",  // private
    "192.168.0.0/16", // private
    "169.254.0.0/16", // link-local
    "fc00::/7",       // IPv6 unique local
    "fe80::/10",      // IPv6 link-local
];

/// One offending socket.
#[derive(Debug, Clone)]
pub struct EgressViolationInfo {
    pub remote: IpAddr,
    pub port: u16,
    pub state: &'static str,
}

/// A parsed CIDR block.
#[derive(Debug, Clone, Copy)]
enum Cidr {
    V4 { net: u32, prefix: u8 },
    V6 { net: u128, prefix: u8 },
}

impl Cidr {
    fn parse(s: &str) -> WardenResult<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (
                a,
                p.parse::<u8>()
                    .map_err(|_| WardenError::Config(format!("bad CIDR prefix in '{s}'")))?,
            ),
            None => (s, 255),
        };
        match addr
            .parse::<IpAddr>()
            .map_err(|_| WardenError::Config(format!("bad CIDR address in '{s}'")))?
        {
            IpAddr::V4(v4) => {
                let prefix = if prefix == 255 { 32 } else { prefix };
                if prefix > 32 {
                    return Err(WardenError::Config(format!("bad CIDR prefix in '{s}'")));
                }
                Ok(Cidr::V4 {
                    net: u32::from(v4),
                    prefix,
                })
            }
            IpAddr::V6(v6) => {
                let prefix = if prefix == 255 { 128 } else { prefix };
                if prefix > 128 {
                    return Err(WardenError::Config(format!("bad CIDR prefix in '{s}'")));
                }
                Ok(Cidr::V6 {
                    net: u128::from(v6),
                    prefix,
                })
            }
        }
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Cidr::V4 { net, prefix }, IpAddr::V4(v4)) => {
                let mask = if *prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                u32::from(v4) & mask == net & mask
            }
            (Cidr::V6 { net, prefix }, IpAddr::V6(v6)) => {
                let mask = if *prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefix)
                };
                u128::from(v6) & mask == net & mask
            }
            _ => false,
        }
    }
}

/// Allow-list of egress subnets: the safe defaults plus operator extras.
#[derive(Debug, Clone)]
pub struct EgressPolicy {
    cidrs: Vec<Cidr>,
}

impl EgressPolicy {
    pub fn from_config(config: &CoreConfig) -> WardenResult<Self> {
        let mut cidrs = Vec::with_capacity(SAFE_SUBNETS.len() + config.egress_allow.len());
        for s in SAFE_SUBNETS {
            cidrs.push(Cidr::parse(s)?);
        }
        for s in &config.egress_allow {
            cidrs.push(Cidr::parse(s)?);
        }
        Ok(Self { cidrs })
    }

    /// True when outbound traffic to `ip` is permitted. IPv4-mapped IPv6
    /// remotes are checked as their IPv4 form.
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if ip.is_unspecified() {
            return true;
        }
        let ip = match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => ip,
            },
            v4 => v4,
        };
        self.cidrs.iter().any(|c| c.contains(ip))
    }
}

/// TCP states worth acting on: 01 ESTABLISHED, 02 SYN_SENT.
fn state_name(hex: &str) -> Option<&'static str> {
    match hex {
        "01" => Some("established"),
        "02" => Some("syn_sent"),
        _ => None,
    }
}

/// One remote endpoint from the kernel table: address, port, state, socket inode.
type SocketRow = (IpAddr, u16, &'static str, u64);

/// Parse one `/proc/net/tcp{,6}` table, keeping remote endpoints of sockets in
/// an actionable state that belong to `uid`. The uid filter is only a cheap
/// prefilter; ownership is decided by inode in [`filter_owned`].
fn parse_proc_net_tcp(content: &str, v6: bool, uid: u32) -> Vec<SocketRow> {
    let mut out = Vec::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let Some(state) = state_name(fields[3]) else {
            continue;
        };
        if fields[7].parse::<u32>() != Ok(uid) {
            continue;
        }
        let Some((addr_hex, port_hex)) = fields[2].split_once(':') else {
            continue;
        };
        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        let Ok(inode) = fields[9].parse::<u64>() else {
            continue;
        };
        let Some(ip) = parse_proc_addr(addr_hex, v6) else {
            continue;
        };
        if port == 0 || ip.is_unspecified() {
            continue;
        }
        out.push((ip, port, state, inode));
    }
    out
}

/// Keep only rows whose socket inode is held by this process. Other processes
/// of the same user share the kernel table but must never trip the kill.
fn filter_owned(rows: Vec<SocketRow>, owned: &std::collections::HashSet<u64>) -> Vec<SocketRow> {
    rows.into_iter()
        .filter(|(_, _, _, inode)| owned.contains(inode))
        .collect()
}

/// The kernel prints addresses as host-endian hex words: one `u32` for IPv4,
/// four for IPv6.
fn parse_proc_addr(hex: &str, v6: bool) -> Option<IpAddr> {
    if v6 {
        if hex.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in hex.as_bytes().chunks(8).enumerate() {
            let chunk = std::str::from_utf8(chunk).ok()?;
            let word = u32::from_str_radix(chunk, 16).ok()?.swap_bytes();
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        Some(IpAddr::V6(Ipv6Addr::from(bytes)))
    } else {
        if hex.len() != 8 {
            return None;
        }
        let raw = u32::from_str_radix(hex, 16).ok()?;
        Some(IpAddr::V4(Ipv4Addr::from(raw.swap_bytes())))
    }
}

pub struct EgressWatchdog {
    policy: EgressPolicy,
    interval: std::time::Duration,
    audit: Arc<AuditSink>,
}

impl EgressWatchdog {
    pub fn new(config: &CoreConfig, audit: Arc<AuditSink>) -> WardenResult<Self> {
        Ok(Self {
            policy: EgressPolicy::from_config(config)?,
            interval: config.watchdog_interval,
            audit,
        })
    }

    pub fn policy(&self) -> &EgressPolicy {
        &self.policy
    }

    /// One sweep over this process's sockets. Returns the offenders; does not
    /// itself terminate anything.
    pub fn check_once(&self) -> Vec<EgressViolationInfo> {
        collect_connections()
            .into_iter()
            .filter(|(ip, _, _, _)| !self.policy.is_allowed(*ip))
            .map(|(remote, port, state, _)| EgressViolationInfo {
                remote,
                port,
                state,
            })
            .collect()
    }

    /// Spawn the sweep loop. The handle never resolves in normal operation:
    /// the owner must supervise it and treat completion as loss of the egress
    /// monitor (a violation ends the process from inside the loop instead).
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        if !cfg!(target_os = "linux") {
            tracing::warn!("egress watchdog disabled: socket enumeration is Linux-only");
            // Stay pending so a supervisor does not mistake "disabled" for "died".
            return tokio::spawn(std::future::pending());
        }
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "egress watchdog started; only local/private subnets allowed"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let violations = self.check_once();
                if violations.is_empty() {
                    continue;
                }
                for v in &violations {
                    tracing::error!(
                        remote = %v.remote,
                        port = v.port,
                        state = v.state,
                        "EGRESS VIOLATION: outbound connection outside allowed subnets"
                    );
                    self.audit.record(
                        EventKind::EgressBlock,
                        None,
                        json!({
                            "remote": v.remote.to_string(),
                            "port": v.port,
                            "state": v.state,
                        }),
                    );
                }
                std::process::exit(1);
            }
        })
    }
}

#[cfg(target_os = "linux")]
fn collect_connections() -> Vec<SocketRow> {
    // Safe: getuid has no failure mode.
    let uid = unsafe { libc::getuid() };
    let owned = self_socket_inodes();
    let mut out = Vec::new();
    if let Ok(content) = std::fs::read_to_string("/proc/net/tcp") {
        out.extend(parse_proc_net_tcp(&content, false, uid));
    }
    if let Ok(content) = std::fs::read_to_string("/proc/net/tcp6") {
        out.extend(parse_proc_net_tcp(&content, true, uid));
    }
    filter_owned(out, &owned)
}

/// Socket inodes held by this process, from the `socket:[N]` links in
/// `/proc/self/fd`.
#[cfg(target_os = "linux")]
fn self_socket_inodes() -> std::collections::HashSet<u64> {
    let mut out = std::collections::HashSet::new();
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return out;
    };
    for entry in entries.flatten() {
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        let target = target.to_string_lossy();
        if let Some(inode) = target
            .strip_prefix("socket:[")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            if let Ok(n) = inode.parse() {
                out.insert(n);
            }
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
fn collect_connections() -> Vec<SocketRow> {
    Vec::new()
}
