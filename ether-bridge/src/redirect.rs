//! Host-port forwarding rules for the user-mode NAT transport.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Guest address a rule targets when it leaves the address field empty.
pub const DEFAULT_GUEST_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);

/// A forwarding rule string was rejected. The offending rule is carried in
/// the message so the caller can log it and move on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RedirectParseError {
    #[error("Invalid host forwarding rule '{0}'")]
    Syntax(String),

    #[error("Invalid transport protocol in forwarding rule '{0}'")]
    BadProtocol(String),

    #[error("Port out of range in forwarding rule '{0}'")]
    BadPort(String),

    #[error("Invalid guest address in forwarding rule '{0}'")]
    BadAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectProto {
    Tcp,
    Udp,
}

/// A static host-port to guest-address/port forwarding mapping. Parsed from
/// configuration at init and applied to the NAT engine before it accepts
/// traffic; never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub proto: RedirectProto,
    pub host_port: u16,
    pub guest_addr: Ipv4Addr,
    pub guest_port: u16,
}

impl RedirectRule {
    /// Parse `[tcp|udp]:hostport:guestaddr:guestport`. The protocol field
    /// defaults to tcp when empty, the guest address to
    /// [`DEFAULT_GUEST_ADDR`]. Ports must be plain decimal in 1–65535.
    pub fn parse(rule: &str) -> Result<Self, RedirectParseError> {
        let fields: Vec<&str> = rule.split(':').collect();
        let &[proto, host_port, guest_addr, guest_port] = fields.as_slice() else {
            return Err(RedirectParseError::Syntax(rule.to_string()));
        };

        let proto = match proto {
            "" | "tcp" => RedirectProto::Tcp,
            "udp" => RedirectProto::Udp,
            _ => return Err(RedirectParseError::BadProtocol(rule.to_string())),
        };

        let host_port = parse_port(host_port)
            .ok_or_else(|| RedirectParseError::BadPort(rule.to_string()))?;
        let guest_port = parse_port(guest_port)
            .ok_or_else(|| RedirectParseError::BadPort(rule.to_string()))?;

        let guest_addr = if guest_addr.is_empty() {
            DEFAULT_GUEST_ADDR
        } else {
            guest_addr
                .parse()
                .map_err(|_| RedirectParseError::BadAddress(rule.to_string()))?
        };

        Ok(Self {
            proto,
            host_port,
            guest_addr,
            guest_port,
        })
    }
}

fn parse_port(field: &str) -> Option<u16> {
    match field.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Parse every configured rule. A malformed rule is logged and skipped; it
/// never aborts startup or affects the remaining rules.
pub fn parse_redirects(rules: &[String]) -> Vec<RedirectRule> {
    let mut parsed = Vec::with_capacity(rules.len());
    for rule in rules {
        match RedirectRule::parse(rule) {
            Ok(r) => parsed.push(r),
            Err(e) => warn!(rule = %rule, error = %e, "Skipping malformed host forwarding rule"),
        }
    }
    parsed
}
