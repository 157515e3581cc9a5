//! Host port forwarding.
//!
//! [`PortForward`] describes one host-port (or host-port range) to guest
//! mapping. [`IptablesHostNetwork`] programs it on the host as a `nat
//! PREROUTING` DNAT rule plus a `FORWARD` accept rule, both tagged with
//! the forward id in an iptables comment so they can be found again.

use std::fmt;
use std::net::{IpAddr, TcpListener, UdpSocket};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::HostNetwork;

/// Transport protocol of a forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host port (range) forwarded to a guest address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub protocol: Protocol,
    pub host_port: u16,
    /// Last port of a range; `None` for a single port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port_end: Option<u16>,
    pub vm_ip: IpAddr,
    pub vm_port: u16,
}

impl PortForward {
    /// Inclusive host port range. A single port is `[p, p]`.
    pub fn host_range(&self) -> (u16, u16) {
        (self.host_port, self.host_port_end.unwrap_or(self.host_port))
    }

    /// Number of ports past the first.
    pub fn span(&self) -> u16 {
        let (start, end) = self.host_range();
        end.saturating_sub(start)
    }

    /// Inclusive guest port range the host range maps onto.
    pub fn vm_range(&self) -> (u16, u16) {
        (self.vm_port, self.vm_port.saturating_add(self.span()))
    }

    /// True when both forwards claim a common host port of the same protocol.
    pub fn overlaps(&self, other: &PortForward) -> bool {
        if self.protocol != other.protocol {
            return false;
        }
        let (a, b) = self.host_range();
        let (c, d) = other.host_range();
        a <= d && c <= b
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (start, end) = self.host_range();
        let (vm_start, vm_end) = self.vm_range();
        if start == end {
            write!(f, "{}/{} -> {}:{}", self.protocol, start, self.vm_ip, vm_start)
        } else {
            write!(
                f,
                "{}/{}-{} -> {}:{}-{}",
                self.protocol, start, end, self.vm_ip, vm_start, vm_end
            )
        }
    }
}

// =============================================================================
// IPTABLES
// =============================================================================

/// Whether a rule is being inserted, checked or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Append,
    Check,
    Delete,
}

impl RuleAction {
    fn flag(&self) -> &'static str {
        match self {
            RuleAction::Append => "-A",
            RuleAction::Check => "-C",
            RuleAction::Delete => "-D",
        }
    }
}

/// Comment attached to every rule of a forward.
pub fn rule_tag(id: &str) -> String {
    format!("virtpanel:{}", id)
}

fn port_spec(start: u16, end: u16, sep: char) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}{}{}", start, sep, end)
    }
}

/// Arguments of the `nat PREROUTING` DNAT rule for a forward.
pub fn dnat_rule_args(action: RuleAction, id: &str, forward: &PortForward) -> Vec<String> {
    let (start, end) = forward.host_range();
    let (vm_start, vm_end) = forward.vm_range();
    let destination = match forward.vm_ip {
        IpAddr::V4(ip) => format!("{}:{}", ip, port_spec(vm_start, vm_end, '-')),
        IpAddr::V6(ip) => format!("[{}]:{}", ip, port_spec(vm_start, vm_end, '-')),
    };
    vec![
        "-t".into(),
        "nat".into(),
        action.flag().into(),
        "PREROUTING".into(),
        "-p".into(),
        forward.protocol.as_str().into(),
        "--dport".into(),
        port_spec(start, end, ':'),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        rule_tag(id),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        destination,
    ]
}

/// Arguments of the `FORWARD` accept rule for a forward.
pub fn accept_rule_args(action: RuleAction, id: &str, forward: &PortForward) -> Vec<String> {
    let (vm_start, vm_end) = forward.vm_range();
    vec![
        action.flag().into(),
        "FORWARD".into(),
        "-p".into(),
        forward.protocol.as_str().into(),
        "-d".into(),
        forward.vm_ip.to_string(),
        "--dport".into(),
        port_spec(vm_start, vm_end, ':'),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        rule_tag(id),
        "-j".into(),
        "ACCEPT".into(),
    ]
}

/// Port forwarding through the iptables CLI.
#[derive(Debug, Clone)]
pub struct IptablesHostNetwork {
    iptables: String,
    ip6tables: String,
    check_listeners: bool,
}

impl Default for IptablesHostNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl IptablesHostNetwork {
    pub fn new() -> Self {
        Self {
            iptables: "iptables".to_string(),
            ip6tables: "ip6tables".to_string(),
            check_listeners: true,
        }
    }

    /// Do not refuse host ports that already have a local listener.
    pub fn without_listener_check(mut self) -> Self {
        self.check_listeners = false;
        self
    }

    fn binary(&self, forward: &PortForward) -> &str {
        match forward.vm_ip {
            IpAddr::V4(_) => &self.iptables,
            IpAddr::V6(_) => &self.ip6tables,
        }
    }

    async fn rule_exists(&self, binary: &str, args: &[String]) -> Result<bool> {
        let output = Command::new(binary)
            .args(args)
            .output()
            .await
            .map_err(|e| HypervisorError::OperationFailed(format!("failed to execute {}: {}", binary, e)))?;
        Ok(output.status.success())
    }
}

/// Run an iptables command and check for success.
async fn run_iptables(binary: &str, args: &[String]) -> Result<()> {
    debug!(binary, args = ?args, "Running iptables command");

    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| HypervisorError::OperationFailed(format!("failed to execute {}: {}", binary, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HypervisorError::OperationFailed(format!(
            "{} failed: {}",
            binary,
            stderr.trim()
        )));
    }

    Ok(())
}

/// Fail if any host port of the forward already has a local listener.
fn ensure_ports_free(forward: &PortForward) -> Result<()> {
    let (start, end) = forward.host_range();
    let bind_addr: IpAddr = match forward.vm_ip {
        IpAddr::V4(_) => IpAddr::from([0, 0, 0, 0]),
        IpAddr::V6(_) => IpAddr::from([0u16; 8]),
    };
    for port in start..=end {
        let in_use = match forward.protocol {
            Protocol::Tcp => TcpListener::bind((bind_addr, port)).is_err(),
            Protocol::Udp => UdpSocket::bind((bind_addr, port)).is_err(),
        };
        if in_use {
            return Err(HypervisorError::OperationFailed(format!(
                "host port {}/{} is already in use",
                port, forward.protocol
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl HostNetwork for IptablesHostNetwork {
    #[instrument(skip(self, forward), fields(rule = %forward))]
    async fn apply_port_forward(&self, id: &str, forward: &PortForward) -> Result<()> {
        if self.check_listeners {
            ensure_ports_free(forward)?;
        }

        let binary = self.binary(forward);
        run_iptables(binary, &dnat_rule_args(RuleAction::Append, id, forward)).await?;

        if let Err(e) = run_iptables(binary, &accept_rule_args(RuleAction::Append, id, forward)).await {
            // Leave no half-installed forward behind.
            if let Err(cleanup) =
                run_iptables(binary, &dnat_rule_args(RuleAction::Delete, id, forward)).await
            {
                warn!(id, error = %cleanup, "Failed to roll back DNAT rule");
            }
            return Err(e);
        }

        info!(id, "Port forward applied");
        Ok(())
    }

    #[instrument(skip(self, forward), fields(rule = %forward))]
    async fn remove_port_forward(&self, id: &str, forward: &PortForward) -> Result<()> {
        let binary = self.binary(forward);

        if self
            .rule_exists(binary, &dnat_rule_args(RuleAction::Check, id, forward))
            .await?
        {
            run_iptables(binary, &dnat_rule_args(RuleAction::Delete, id, forward)).await?;
        }
        if self
            .rule_exists(binary, &accept_rule_args(RuleAction::Check, id, forward))
            .await?
        {
            run_iptables(binary, &accept_rule_args(RuleAction::Delete, id, forward)).await?;
        }

        info!(id, "Port forward removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn forward(protocol: Protocol, start: u16, end: Option<u16>) -> PortForward {
        PortForward {
            protocol,
            host_port: start,
            host_port_end: end,
            vm_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 122, 10)),
            vm_port: 80,
        }
    }

    #[test]
    fn test_overlap_same_protocol() {
        let range = forward(Protocol::Tcp, 8000, Some(8010));
        assert!(range.overlaps(&forward(Protocol::Tcp, 8005, None)));
        assert!(range.overlaps(&forward(Protocol::Tcp, 8010, Some(8020))));
        assert!(range.overlaps(&forward(Protocol::Tcp, 7990, Some(8000))));
        assert!(!range.overlaps(&forward(Protocol::Tcp, 8011, None)));
        assert!(!range.overlaps(&forward(Protocol::Tcp, 7000, Some(7999))));
    }

    #[test]
    fn test_overlap_ignores_other_protocol() {
        let tcp = forward(Protocol::Tcp, 8005, None);
        let udp = forward(Protocol::Udp, 8005, None);
        assert!(!tcp.overlaps(&udp));
    }

    #[test]
    fn test_vm_range_follows_host_span() {
        let fwd = forward(Protocol::Udp, 5000, Some(5004));
        assert_eq!(fwd.span(), 4);
        assert_eq!(fwd.vm_range(), (80, 84));
        assert_eq!(fwd.to_string(), "udp/5000-5004 -> 192.168.122.10:80-84");
    }

    #[test]
    fn test_dnat_rule_single_port() {
        let args = dnat_rule_args(RuleAction::Append, "abc", &forward(Protocol::Tcp, 8080, None));
        let line = args.join(" ");
        assert_eq!(
            line,
            "-t nat -A PREROUTING -p tcp --dport 8080 -m comment --comment virtpanel:abc \
             -j DNAT --to-destination 192.168.122.10:80"
        );
    }

    #[test]
    fn test_dnat_rule_range() {
        let args = dnat_rule_args(RuleAction::Delete, "r1", &forward(Protocol::Udp, 6000, Some(6002)));
        let line = args.join(" ");
        assert!(line.contains("-D PREROUTING"));
        assert!(line.contains("--dport 6000:6002"));
        assert!(line.contains("--to-destination 192.168.122.10:80-82"));
    }

    #[test]
    fn test_accept_rule_targets_guest_ports() {
        let args = accept_rule_args(RuleAction::Append, "r1", &forward(Protocol::Tcp, 6000, Some(6002)));
        let line = args.join(" ");
        assert!(line.starts_with("-A FORWARD -p tcp -d 192.168.122.10 --dport 80:82"));
        assert!(line.ends_with("--comment virtpanel:r1 -j ACCEPT"));
    }

    #[test]
    fn test_dnat_rule_ipv6_destination() {
        let mut fwd = forward(Protocol::Tcp, 2222, None);
        fwd.vm_ip = "fd00::10".parse().unwrap();
        let line = dnat_rule_args(RuleAction::Append, "v6", &fwd).join(" ");
        assert!(line.contains("--to-destination [fd00::10]:80"));
    }

    #[test]
    fn test_protocol_from_name() {
        assert_eq!(Protocol::from_name("TCP"), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_name("udp"), Some(Protocol::Udp));
        assert_eq!(Protocol::from_name("icmp"), None);
    }
}
