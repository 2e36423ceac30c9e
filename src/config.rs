//! YAML configuration structures.
//!
//! This module defines the on-disk configuration schema (`config.yaml`).
//! All structures are `serde`-compatible and are loaded once at startup.
//! A missing or malformed file is not fatal: the server runs with
//! [`Config::default`] (no users, no rule groups) so the operator can fix
//! the config without the resolver disappearing.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
};

use serde::{Deserialize, Serialize};

/// Full application configuration (parsed from YAML).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Listener and upstream addresses.
    #[serde(default)]
    pub server: ServerConfig,
    /// Known network clients, matched by IP/CIDR or MAC.
    #[serde(default)]
    pub users: Vec<User>,
    /// Named policy lists binding rule groups to optional schedules.
    #[serde(default)]
    pub user_groups: Vec<UserGroup>,
    /// Named rule bundles, each fed by one or more sources.
    #[serde(default)]
    pub rule_groups: Vec<RuleGroup>,
    /// Named weekly time windows that suppress policies while active.
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    /// Fallback behavior for unmatched clients.
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Refresh interval for URL sources, in seconds. Values below 24 h
    /// are raised to 24 h by the updater.
    #[serde(default)]
    pub url_interval: Option<u64>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&raw)?;
        Ok(cfg)
    }
}

/// Listener and upstream settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address, e.g. `:53` or `0.0.0.0:53`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Upstream resolver, e.g. `8.8.8.8:53`.
    #[serde(default = "default_upstream")]
    pub upstream: String,
}

impl ServerConfig {
    /// Parse `listen_addr`, accepting the `:53` shorthand for all interfaces.
    pub fn listen_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let s = if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        };
        Ok(s.parse()?)
    }

    /// Parse the upstream resolver address.
    pub fn upstream_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.upstream.parse()?)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream: default_upstream(),
        }
    }
}

fn default_listen_addr() -> String {
    ":53".to_string()
}

fn default_upstream() -> String {
    "8.8.8.8:53".to_string()
}

/// A network client using the service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub name: String,
    /// Individual IPs or CIDRs.
    #[serde(default)]
    pub ips: Vec<String>,
    /// MAC addresses, `aa:bb:cc:dd:ee:ff` form.
    #[serde(default)]
    pub macs: Vec<String>,
    /// The user group this client belongs to.
    pub user_group: String,
}

/// A named list of policies.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserGroup {
    pub name: String,
    pub policies: Vec<Policy>,
}

/// Binds a rule group to an optional schedule.
///
/// While the schedule is in-window the policy is suppressed; an absent
/// schedule means the policy always applies.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Policy {
    pub rule_group: String,
    #[serde(default)]
    pub schedule: Option<String>,
}

/// A set of filtering rules fed by one or more sources.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleGroup {
    pub name: String,
    pub sources: Vec<Source>,
}

/// A single origin of rule lines: exactly one of `url` or `path`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Source {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// A named weekly window definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Schedule {
    pub name: String,
    pub items: Vec<ScheduleItem>,
}

/// One window: minute ranges applied to the listed weekdays.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleItem {
    /// Weekday names (`Mon` or `Monday`, case-insensitive).
    /// Empty means every day.
    #[serde(default)]
    pub days: Vec<String>,
    /// Time ranges in `HH:MM-HH:MM` form, endpoints inclusive.
    pub ranges: Vec<String>,
}

/// Fallback behavior for clients that match no configured user.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DefaultsConfig {
    /// User group applied when no user matches.
    #[serde(default)]
    pub user_group: String,
}

/// Parse a configured client address as either a CIDR prefix or a single IP.
pub fn parse_ip_or_cidr(s: &str) -> Option<IpOrCidr> {
    if let Ok(net) = s.parse::<ipnet::IpNet>() {
        return Some(IpOrCidr::Cidr(net));
    }
    if let Ok(addr) = s.parse::<IpAddr>() {
        return Some(IpOrCidr::Ip(addr));
    }
    None
}

/// A configured client address: either a single IP or a CIDR prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpOrCidr {
    Ip(IpAddr),
    Cidr(ipnet::IpNet),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_parses_with_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.server.listen_addr, ":53");
        assert_eq!(cfg.server.upstream, "8.8.8.8:53");
        assert!(cfg.users.is_empty());
        assert!(cfg.url_interval.is_none());
    }

    #[test]
    fn listen_addr_shorthand_binds_all_interfaces() {
        let server = ServerConfig::default();
        let addr = server.listen_socket_addr().unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:53");
    }

    #[test]
    fn full_schema_roundtrip() {
        let raw = r#"
server:
  listen_addr: "127.0.0.1:5353"
  upstream: "1.1.1.1:53"
users:
  - name: alice
    ips: ["10.0.0.5", "10.0.1.0/24"]
    macs: ["aa:bb:cc:dd:ee:ff"]
    user_group: family
user_groups:
  - name: family
    policies:
      - rule_group: ads
        schedule: evening
      - rule_group: trackers
rule_groups:
  - name: ads
    sources:
      - name: local
        path: /etc/dnsgate/ads.txt
  - name: trackers
    sources:
      - name: remote
        url: https://example.com/trackers.txt
schedules:
  - name: evening
    items:
      - days: [Mon, tuesday]
        ranges: ["18:00-23:00"]
defaults:
  user_group: family
url_interval: 86400
"#;
        let cfg: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(cfg.users[0].ips.len(), 2);
        assert_eq!(cfg.user_groups[0].policies[1].schedule, None);
        assert_eq!(cfg.rule_groups[1].sources[0].path, None);
        assert_eq!(cfg.url_interval, Some(86_400));
    }

    #[test]
    fn ip_or_cidr_classification() {
        assert!(matches!(parse_ip_or_cidr("10.0.0.1"), Some(IpOrCidr::Ip(_))));
        assert!(matches!(
            parse_ip_or_cidr("10.0.0.0/24"),
            Some(IpOrCidr::Cidr(_))
        ));
        assert!(parse_ip_or_cidr("not-an-ip").is_none());
    }
}
