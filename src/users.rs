//! Client identity matching.
//!
//! Maps an incoming query's source IP and (when resolvable) MAC address to
//! a configured [`User`]. MAC beats IP: on home networks DHCP reshuffles
//! addresses but hardware stays put. Exact IPs beat CIDR prefixes.

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use ipnet::IpNet;

use crate::config::{Config, IpOrCidr, User};

/// Indexes built once from the configuration snapshot.
#[derive(Debug)]
pub struct UserMatcher {
    by_ip: HashMap<IpAddr, Arc<User>>,
    by_mac: HashMap<String, Arc<User>>,
    cidrs: Vec<(IpNet, Arc<User>)>,
}

impl UserMatcher {
    /// Build the matcher. An IP entry that parses as neither an address
    /// nor a CIDR is fatal.
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut by_ip = HashMap::new();
        let mut by_mac = HashMap::new();
        let mut cidrs = Vec::new();

        for user in &cfg.users {
            let user = Arc::new(user.clone());

            for ip_str in &user.ips {
                match crate::config::parse_ip_or_cidr(ip_str) {
                    Some(IpOrCidr::Cidr(net)) => cidrs.push((net, user.clone())),
                    Some(IpOrCidr::Ip(addr)) => {
                        by_ip.insert(addr, user.clone());
                    }
                    None => anyhow::bail!(
                        "invalid IP/CIDR '{}' for user '{}'",
                        ip_str,
                        user.name
                    ),
                }
            }

            for mac in &user.macs {
                by_mac.insert(mac.to_ascii_lowercase(), user.clone());
            }
        }

        Ok(Self {
            by_ip,
            by_mac,
            cidrs,
        })
    }

    /// Identify the client. Returns `None` when no user matches; the
    /// caller falls back to the default user group.
    pub fn match_client(&self, ip: IpAddr, mac: Option<&str>) -> Option<Arc<User>> {
        if let Some(mac) = mac {
            if !mac.is_empty() {
                if let Some(u) = self.by_mac.get(&mac.to_ascii_lowercase()) {
                    return Some(u.clone());
                }
            }
        }

        if let Some(u) = self.by_ip.get(&ip) {
            return Some(u.clone());
        }

        for (net, user) in &self.cidrs {
            if net.contains(&ip) {
                return Some(user.clone());
            }
        }

        None
    }
}
