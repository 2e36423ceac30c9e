//! Client MAC resolution.
//!
//! User matching prefers MAC over IP, which requires asking the kernel
//! ARP table who owns an address. The table read is injectable so the
//! server is testable without a real network, and results (including
//! misses) are cached for a few minutes under their own lock.

use std::{collections::HashMap, net::IpAddr, sync::RwLock};

use time::{Duration, OffsetDateTime};

/// Where MAC answers come from. The default reads `/proc/net/arp`.
pub type ArpSource = Box<dyn Fn(IpAddr) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone)]
struct CachedMac {
    mac: Option<String>,
    expires_at: OffsetDateTime,
}

/// IP → MAC resolver with a TTL cache in front of the ARP source.
pub struct MacResolver {
    cache: RwLock<HashMap<IpAddr, CachedMac>>,
    ttl: Duration,
    source: ArpSource,
}

impl MacResolver {
    /// Resolver backed by the platform ARP table.
    pub fn new(ttl: Duration) -> Self {
        Self::with_source(ttl, Box::new(read_arp_table))
    }

    /// Resolver with an injected ARP source.
    pub fn with_source(ttl: Duration, source: ArpSource) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
            source,
        }
    }

    /// Look up the MAC for `ip`. Loopback has no meaningful MAC.
    /// Misses are cached as well so an absent neighbor is not re-queried
    /// on every packet.
    pub fn resolve(&self, ip: IpAddr) -> Option<String> {
        if ip.is_loopback() {
            return None;
        }

        {
            let cache = self.cache.read().unwrap();
            if let Some(entry) = cache.get(&ip) {
                if entry.expires_at > OffsetDateTime::now_utc() {
                    return entry.mac.clone();
                }
            }
        }

        let mac = (self.source)(ip);
        self.cache.write().unwrap().insert(
            ip,
            CachedMac {
                mac: mac.clone(),
                expires_at: OffsetDateTime::now_utc() + self.ttl,
            },
        );
        mac
    }
}

impl std::fmt::Debug for MacResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacResolver").field("ttl", &self.ttl).finish()
    }
}

/// Scan `/proc/net/arp` for the address.
///
/// Format: `IP address  HW type  Flags  HW address  Mask  Device`.
#[cfg(target_os = "linux")]
fn read_arp_table(ip: IpAddr) -> Option<String> {
    let raw = std::fs::read_to_string("/proc/net/arp").ok()?;
    let target = ip.to_string();
    for line in raw.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 && fields[0] == target {
            return Some(fields[3].to_string());
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_arp_table(_ip: IpAddr) -> Option<String> {
    None
}
