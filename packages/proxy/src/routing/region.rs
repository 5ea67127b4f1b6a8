// packages/proxy/src/routing/region.rs
//! Region profiles and resolved server targets
//!
//! A region profile is loaded once from configuration and never changes for
//! the lifetime of the process. It names the hostnames the game client looks
//! up, the local address those names are redirected to, and one local
//! listener port per logical server id.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Live endpoint of one game server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerTarget {
    pub ip: String,
    pub port: u16,
}

impl ServerTarget {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Logical server id → resolved target
pub type TargetMap = BTreeMap<String, ServerTarget>;

/// Local listener definition for one logical server id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Local port the proxy listens on
    pub port: u16,

    /// Local bind address (defaults to 127.0.0.1)
    #[serde(default)]
    pub ip: Option<String>,

    /// Static upstream, required in direct mode
    #[serde(default)]
    pub remote: Option<ServerTarget>,
}

impl ServerSpec {
    pub const DEFAULT_BIND_IP: &'static str = "127.0.0.1";

    /// Address the listener binds to
    pub fn bind_addr(&self) -> String {
        format!(
            "{}:{}",
            self.ip.as_deref().unwrap_or(Self::DEFAULT_BIND_IP),
            self.port
        )
    }
}

/// Immutable per-region routing profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionProfile {
    /// Address the redirected hostnames resolve to
    pub listen_hostname: String,

    /// Primary hostname of the server list
    pub hostname: String,

    /// Additional hostnames that must be redirected as well
    #[serde(default)]
    pub alt_hostnames: Vec<String>,

    /// Direct/console mode: static targets, no host redirection
    #[serde(default)]
    pub console: bool,

    /// Classic game client
    #[serde(default)]
    pub classic: bool,

    /// Server list URL used in normal mode
    #[serde(default)]
    pub directory_url: Option<String>,

    /// Port the rewritten server list is served on
    #[serde(default = "default_directory_port")]
    pub directory_port: u16,

    /// Logical server id → local listener
    #[serde(default)]
    pub custom_servers: BTreeMap<String, ServerSpec>,
}

fn default_directory_port() -> u16 {
    80
}

impl RegionProfile {
    /// Direct mode skips the directory lookup and host redirection entirely
    pub fn is_direct(&self) -> bool {
        self.console
    }

    /// All hostnames that get redirected, primary first
    pub fn hostnames(&self) -> Vec<String> {
        std::iter::once(self.hostname.clone())
            .chain(self.alt_hostnames.iter().cloned())
            .collect()
    }

    /// Targets configured statically for direct mode
    pub fn static_targets(&self) -> TargetMap {
        self.custom_servers
            .iter()
            .filter_map(|(id, spec)| spec.remote.clone().map(|target| (id.clone(), target)))
            .collect()
    }
}

/// Short region code passed to protocol engine and startup modules
pub fn region_short_code(region: &str) -> String {
    region
        .to_lowercase()
        .split('-')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> RegionProfile {
        let mut custom_servers = BTreeMap::new();
        custom_servers.insert(
            "1".to_string(),
            ServerSpec {
                port: 9250,
                ip: None,
                remote: Some(ServerTarget::new("10.0.0.1", 7801)),
            },
        );
        custom_servers.insert(
            "2".to_string(),
            ServerSpec {
                port: 9251,
                ip: Some("127.0.0.2".to_string()),
                remote: None,
            },
        );

        RegionProfile {
            listen_hostname: "127.0.0.2".to_string(),
            hostname: "sls.example.com".to_string(),
            alt_hostnames: vec!["sls2.example.com".to_string()],
            console: false,
            classic: false,
            directory_url: None,
            directory_port: 80,
            custom_servers,
        }
    }

    #[test]
    fn test_region_short_code() {
        assert_eq!(region_short_code("EU"), "eu");
        assert_eq!(region_short_code("NA-CLASSIC"), "na");
        assert_eq!(region_short_code(""), "");
    }

    #[test]
    fn test_hostnames_primary_first() {
        assert_eq!(
            profile().hostnames(),
            vec!["sls.example.com".to_string(), "sls2.example.com".to_string()]
        );
    }

    #[test]
    fn test_bind_addr_defaults_to_loopback() {
        let p = profile();
        assert_eq!(p.custom_servers["1"].bind_addr(), "127.0.0.1:9250");
        assert_eq!(p.custom_servers["2"].bind_addr(), "127.0.0.2:9251");
    }

    #[test]
    fn test_static_targets_skip_missing_remote() {
        let targets = profile().static_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets["1"], ServerTarget::new("10.0.0.1", 7801));
    }

    #[test]
    fn test_deserialize_profile() {
        let json = serde_json::json!({
            "listen_hostname": "127.0.0.2",
            "hostname": "sls.example.com",
            "custom_servers": { "5": { "port": 9300 } }
        });
        let p: RegionProfile = serde_json::from_value(json).unwrap();
        assert!(!p.is_direct());
        assert_eq!(p.directory_port, 80);
        assert_eq!(p.custom_servers["5"].port, 9300);
    }
}
