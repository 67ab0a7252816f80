//! Bridge configuration, handed over by the embedder.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// Reserved transport name selecting the user-mode NAT variant.
pub const NAT_TRANSPORT_NAME: &str = "slirp";

/// Settings the bridge consumes at `init`. The embedder owns loading and
/// persistence; this crate only reads the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Selected transport. Absent or empty disables the bridge entirely;
    /// `"slirp"` selects the user-mode NAT; any other value names a raw
    /// host network device.
    #[serde(default)]
    pub transport: Option<String>,

    /// Host forwarding rules, `[tcp|udp]:hostport:guestaddr:guestport`.
    /// Only meaningful for the user-mode NAT transport.
    #[serde(default)]
    pub redirects: Vec<String>,
}

impl BridgeConfig {
    /// Transport variant this configuration selects, `None` when disabled.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        match self.transport.as_deref() {
            None | Some("") => None,
            Some(name) if name == NAT_TRANSPORT_NAME => Some(TransportKind::UserModeNat),
            Some(_) => Some(TransportKind::RawDevice),
        }
    }

    /// Device node a raw transport opens: absolute values are taken as-is,
    /// bare names resolve under `/dev`.
    pub fn device_path(&self) -> Option<PathBuf> {
        match self.transport.as_deref() {
            None | Some("") => None,
            Some(name) if name == NAT_TRANSPORT_NAME => None,
            Some(name) if name.starts_with('/') => Some(PathBuf::from(name)),
            Some(name) => Some(PathBuf::from(format!("/dev/{name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_selection() {
        let disabled = BridgeConfig::default();
        assert_eq!(disabled.transport_kind(), None);

        let empty = BridgeConfig {
            transport: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(empty.transport_kind(), None);

        let nat = BridgeConfig {
            transport: Some("slirp".to_string()),
            ..Default::default()
        };
        assert_eq!(nat.transport_kind(), Some(TransportKind::UserModeNat));
        assert_eq!(nat.device_path(), None);

        let raw = BridgeConfig {
            transport: Some("ethertap0".to_string()),
            ..Default::default()
        };
        assert_eq!(raw.transport_kind(), Some(TransportKind::RawDevice));
        assert_eq!(raw.device_path(), Some(PathBuf::from("/dev/ethertap0")));
    }

    #[test]
    fn test_absolute_device_path() {
        let cfg = BridgeConfig {
            transport: Some("/dev/net/tap3".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.device_path(), Some(PathBuf::from("/dev/net/tap3")));
    }
}
