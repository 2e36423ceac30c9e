//! Periodic rule refresh.
//!
//! Only meaningful when at least one source is a URL; local files are
//! re-read on demand through the engine's rule-file cache. The interval
//! comes from `url_interval` with a 24-hour floor so misconfigured
//! deployments never hammer public list mirrors.

use std::{sync::Arc, time::Duration};

use tracing::info;

use crate::{config::Config, engine::Engine, loader::Loader, shutdown::Shutdown};

const INTERVAL_FLOOR: Duration = Duration::from_secs(24 * 60 * 60);

/// Spawn the refresh loop, if the config has any remote sources.
pub fn spawn_refresh(
    cfg: &Config,
    engine: Arc<Engine>,
    loader: Arc<Loader>,
    shutdown: Shutdown,
) {
    let has_remote = cfg
        .rule_groups
        .iter()
        .any(|rg| rg.sources.iter().any(|s| s.url.is_some()));
    if !has_remote {
        info!("no remote sources to refresh");
        return;
    }

    let interval = refresh_interval(cfg.url_interval);
    info!(interval_secs = interval.as_secs(), "rule refresh scheduled");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(interval) => {
                    info!("refreshing rules");
                    engine.reload(&loader).await;
                }
            }
        }
    });
}

fn refresh_interval(configured: Option<u64>) -> Duration {
    match configured {
        Some(secs) => Duration::from_secs(secs).max(INTERVAL_FLOOR),
        None => INTERVAL_FLOOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_floors_at_24_hours() {
        assert_eq!(refresh_interval(None), INTERVAL_FLOOR);
        assert_eq!(refresh_interval(Some(60)), INTERVAL_FLOOR);
        assert_eq!(
            refresh_interval(Some(48 * 60 * 60)),
            Duration::from_secs(48 * 60 * 60)
        );
    }
}
