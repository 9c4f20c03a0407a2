//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use arbor_core::{Identity, NodeLocation};
use arbor_net::{LeafConfig, StemConfig};
use serde::Deserialize;
use tracing::warn;

/// Node configuration. File: ~/.config/arbor/config.toml or /etc/arbor/config.toml.
/// Env overrides: ARBOR_STEM_ADDRESS, ARBOR_STEM_PORT, ARBOR_LISTEN_ADDRESS, ARBOR_LOCAL_PORT.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Role run when no mode is given on the command line: "sensor_endpoint" or
    /// "mobile_user". Unset runs the stem.
    #[serde(default)]
    pub role: Option<Identity>,
    /// Where leaves register (default 127.0.0.1).
    #[serde(default = "default_stem_address")]
    pub stem_address: IpAddr,
    /// Stem registration port (default 3010).
    #[serde(default = "default_stem_port")]
    pub stem_port: u16,
    /// Interface the stem listens on (default 0.0.0.0).
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,
    /// Leaf local port, 0 for ephemeral (default 0).
    #[serde(default)]
    pub local_port: u16,
    #[serde(default = "default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,
    #[serde(default = "default_registration_attempts")]
    pub registration_attempts: u32,
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
    #[serde(default = "default_prune_threshold_ms")]
    pub prune_threshold_ms: u64,
    /// Period of the endpoint list broadcast to mobile users; 0 disables it.
    #[serde(default = "default_available_endpoints_interval_ms")]
    pub available_endpoints_interval_ms: u64,
}

fn default_stem_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_stem_port() -> u16 {
    3010
}
fn default_registration_timeout_ms() -> u64 {
    3000
}
fn default_registration_attempts() -> u32 {
    3
}
fn default_prune_interval_ms() -> u64 {
    2500
}
fn default_prune_threshold_ms() -> u64 {
    5000
}
fn default_available_endpoints_interval_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: None,
            stem_address: default_stem_address(),
            stem_port: default_stem_port(),
            listen_address: default_listen_address(),
            local_port: 0,
            registration_timeout_ms: default_registration_timeout_ms(),
            registration_attempts: default_registration_attempts(),
            prune_interval_ms: default_prune_interval_ms(),
            prune_threshold_ms: default_prune_threshold_ms(),
            available_endpoints_interval_ms: default_available_endpoints_interval_ms(),
        }
    }
}

impl Config {
    pub fn stem_location(&self) -> NodeLocation {
        NodeLocation::new(self.stem_address, self.stem_port)
    }

    pub fn leaf_config(&self) -> LeafConfig {
        LeafConfig {
            local_port: self.local_port,
            registration_timeout: Duration::from_millis(self.registration_timeout_ms),
            registration_attempts: self.registration_attempts,
            ..LeafConfig::new(self.stem_location())
        }
    }

    pub fn stem_config(&self) -> StemConfig {
        StemConfig {
            prune_interval: Duration::from_millis(self.prune_interval_ms),
            prune_threshold: Duration::from_millis(self.prune_threshold_ms),
            endpoints_interval: match self.available_endpoints_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            ..StemConfig::new(SocketAddr::new(self.listen_address, self.stem_port))
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("ARBOR_STEM_ADDRESS") {
        match s.parse() {
            Ok(a) => c.stem_address = a,
            Err(e) => warn!("ignoring ARBOR_STEM_ADDRESS={:?}: {}", s, e),
        }
    }
    if let Some(s) = var("ARBOR_STEM_PORT") {
        match s.parse() {
            Ok(p) => c.stem_port = p,
            Err(e) => warn!("ignoring ARBOR_STEM_PORT={:?}: {}", s, e),
        }
    }
    if let Some(s) = var("ARBOR_LISTEN_ADDRESS") {
        match s.parse() {
            Ok(a) => c.listen_address = a,
            Err(e) => warn!("ignoring ARBOR_LISTEN_ADDRESS={:?}: {}", s, e),
        }
    }
    if let Some(s) = var("ARBOR_LOCAL_PORT") {
        match s.parse() {
            Ok(p) => c.local_port = p,
            Err(e) => warn!("ignoring ARBOR_LOCAL_PORT={:?}: {}", s, e),
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/arbor/config.toml"));
    }
    out.push(PathBuf::from("/etc/arbor/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            warn!("cannot read {}: {}", path.display(), e);
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("ignoring {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_fields_override_defaults() {
        let c: Config = toml::from_str(
            r#"
            stem_address = "10.0.0.2"
            stem_port = 4000
            available_endpoints_interval_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(c.stem_location(), NodeLocation::new("10.0.0.2".parse().unwrap(), 4000));
        assert_eq!(c.registration_attempts, 3);
        assert_eq!(c.stem_config().endpoints_interval, None);
        assert_eq!(c.stem_config().listen, "0.0.0.0:4000".parse().unwrap());
        assert_eq!(c.role, None);
    }

    #[test]
    fn stem_listens_on_all_interfaces_by_default() {
        let c = Config::default();
        let listen = c.stem_config().listen;
        assert!(listen.ip().is_unspecified(), "stem bound to {}", listen);
        assert!(c.stem_location().address().is_loopback());

        let c: Config = toml::from_str(r#"listen_address = "192.168.1.20""#).unwrap();
        assert_eq!(c.stem_config().listen, "192.168.1.20:3010".parse().unwrap());
    }

    #[test]
    fn role_selects_leaf_identity() {
        let c: Config = toml::from_str(r#"role = "mobile_user""#).unwrap();
        assert_eq!(c.role, Some(Identity::MobileUser));
        let c: Config = toml::from_str(r#"role = "sensor_endpoint""#).unwrap();
        assert_eq!(c.role, Some(Identity::SensorEndpoint));
        assert!(toml::from_str::<Config>(r#"role = "stem""#).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("ARBOR_STEM_ADDRESS", "192.168.1.20"),
            ("ARBOR_STEM_PORT", "not-a-port"),
            ("ARBOR_LISTEN_ADDRESS", "10.1.1.1"),
            ("ARBOR_LOCAL_PORT", "4555"),
        ]
        .into_iter()
        .collect();
        let c = apply_env(Config::default(), |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.stem_address, "192.168.1.20".parse::<IpAddr>().unwrap());
        assert_eq!(c.stem_port, 3010);
        assert_eq!(c.local_port, 4555);
        assert_eq!(c.stem_config().listen, "10.1.1.1:3010".parse().unwrap());
    }

    #[test]
    fn leaf_config_follows_file() {
        let c = Config {
            registration_timeout_ms: 750,
            registration_attempts: 5,
            ..Config::default()
        };
        let leaf = c.leaf_config();
        assert_eq!(leaf.stem, c.stem_location());
        assert_eq!(leaf.registration_timeout, Duration::from_millis(750));
        assert_eq!(leaf.registration_attempts, 5);
    }
}
