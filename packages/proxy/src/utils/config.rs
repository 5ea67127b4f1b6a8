// packages/proxy/src/utils/config.rs
//! Proxy configuration
//!
//! Configuration is layered with the `config` crate: an optional file
//! (`proxy.toml` or the path in `PROXY_CONFIG`) overridden by `PROXY__*`
//! environment variables, e.g. `PROXY__REGION=EU`.

use crate::routing::region::{region_short_code, RegionProfile};
use crate::utils::errors::{ProxyError, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Selected region key in `regions`
    pub region: String,

    /// Log every scanned module at info level
    #[serde(default)]
    pub update_log: bool,

    /// Resolvers used for the server list lookup
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,

    /// Executable name of the game client
    #[serde(default = "default_process_name")]
    pub process_name: String,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Prometheus exporter address (disabled when unset)
    #[serde(default)]
    pub metrics_addr: Option<String>,

    /// Region name → routing profile
    #[serde(default)]
    pub regions: BTreeMap<String, RegionProfile>,
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
}

fn default_process_name() -> String {
    "TERA.exe".to_string()
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory containing one sub-directory per module
    #[serde(default = "default_module_dir")]
    pub module_dir: PathBuf,

    /// Hosts file override (OS default when unset)
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,
}

fn default_module_dir() -> PathBuf {
    PathBuf::from("mods")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            module_dir: default_module_dir(),
            hosts_file: None,
        }
    }
}

/// Timer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bound on the whole server list lookup
    #[serde(default = "default_directory_secs")]
    pub directory_secs: u64,

    /// Redirection reverts after this long without a new detection
    #[serde(default = "default_auto_revert_secs")]
    pub auto_revert_secs: u64,

    /// Forced exit after this long once draining started
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Process monitor poll interval
    #[serde(default = "default_process_poll_ms")]
    pub process_poll_ms: u64,

    /// Upstream connect attempt bound
    #[serde(default = "default_upstream_connect_secs")]
    pub upstream_connect_secs: u64,
}

fn default_directory_secs() -> u64 {
    5
}

fn default_auto_revert_secs() -> u64 {
    120
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_process_poll_ms() -> u64 {
    5000
}

fn default_upstream_connect_secs() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            directory_secs: default_directory_secs(),
            auto_revert_secs: default_auto_revert_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            process_poll_ms: default_process_poll_ms(),
            upstream_connect_secs: default_upstream_connect_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn directory(&self) -> Duration {
        Duration::from_secs(self.directory_secs)
    }

    pub fn auto_revert(&self) -> Duration {
        Duration::from_secs(self.auto_revert_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn process_poll(&self) -> Duration {
        Duration::from_millis(self.process_poll_ms)
    }

    pub fn upstream_connect(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_secs)
    }
}

/// The selected region, resolved once at startup
#[derive(Debug, Clone)]
pub struct RegionContext {
    pub name: String,
    pub short_code: String,
    pub profile: RegionProfile,
}

impl ProxyConfig {
    /// Load configuration from `PROXY_CONFIG` (or `proxy.toml`) and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("PROXY_CONFIG").unwrap_or_else(|_| "proxy".to_string());
        Self::load_from(&path)
    }

    /// Load configuration from a specific file, layered with the environment
    pub fn load_from(path: &str) -> Result<Self> {
        debug!("Loading configuration from {}", path);

        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("PROXY").separator("__"))
            .build()?;

        let config: ProxyConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;

        let config: ProxyConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the selected region
    pub fn validate(&self) -> Result<()> {
        let region = self.region()?;

        if region.profile.custom_servers.is_empty() {
            return Err(ProxyError::ConfigError(format!(
                "Region {} has no custom servers configured",
                region.name
            )));
        }

        if region.profile.is_direct() {
            for (id, spec) in &region.profile.custom_servers {
                if spec.remote.is_none() {
                    return Err(ProxyError::ConfigError(format!(
                        "Server {} of direct region {} has no remote target",
                        id, region.name
                    )));
                }
            }
        } else if region.profile.directory_url.is_none() {
            return Err(ProxyError::ConfigError(format!(
                "Region {} needs a directory_url outside direct mode",
                region.name
            )));
        }

        Ok(())
    }

    /// Resolve the selected region profile
    ///
    /// Map keys may have been lower-cased by the loader, so the lookup is
    /// case-insensitive.
    pub fn region(&self) -> Result<RegionContext> {
        let profile = self
            .regions
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.region))
            .map(|(_, profile)| profile.clone())
            .ok_or_else(|| ProxyError::InvalidRegion(self.region.clone()))?;

        Ok(RegionContext {
            name: self.region.clone(),
            short_code: region_short_code(&self.region),
            profile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
region = "EU"

[timeouts]
auto_revert_secs = 60

[regions.EU]
listen_hostname = "127.0.0.2"
hostname = "sls.eu.example.com"
directory_url = "http://sls.eu.example.com/servers/list.json"

[regions.EU.custom_servers.27]
port = 9250

[regions.KR-PTS]
listen_hostname = "127.0.0.3"
hostname = "sls.kr.example.com"
console = true

[regions.KR-PTS.custom_servers.1]
port = 9300
remote = { ip = "10.1.1.1", port = 7801 }
"#;

    #[test]
    fn test_parse_sample() {
        let config = ProxyConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.timeouts.auto_revert(), Duration::from_secs(60));
        assert_eq!(config.timeouts.directory(), Duration::from_secs(5));
        assert_eq!(config.dns_servers, vec!["8.8.8.8", "8.8.4.4"]);
        assert_eq!(config.process_name, "TERA.exe");

        let region = config.region().unwrap();
        assert_eq!(region.short_code, "eu");
        assert_eq!(region.profile.custom_servers["27"].port, 9250);
    }

    #[test]
    fn test_unknown_region() {
        let text = SAMPLE.replace("region = \"EU\"", "region = \"XX\"");
        let err = ProxyConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRegion(name) if name == "XX"));
    }

    #[test]
    fn test_direct_region() {
        let text = SAMPLE.replace("region = \"EU\"", "region = \"KR-PTS\"");
        let config = ProxyConfig::from_toml_str(&text).unwrap();
        let region = config.region().unwrap();
        assert!(region.profile.is_direct());
        assert_eq!(region.short_code, "kr");
    }

    #[test]
    fn test_direct_region_requires_remote() {
        let text = SAMPLE
            .replace("region = \"EU\"", "region = \"KR-PTS\"")
            .replace("remote = { ip = \"10.1.1.1\", port = 7801 }", "");
        let err = ProxyConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ProxyError::ConfigError(_)));
    }
}
