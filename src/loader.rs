//! Rule source loading.
//!
//! Local paths are read line-by-line; unparseable lines are skipped so one
//! bad rule never sinks a source. URL sources are fetched over HTTP and
//! cached on disk under the data directory, cache-first: once a list has
//! been downloaded the on-disk copy is used until it is removed, so a
//! forced refetch means deleting the data directory.
//!
//! Cache layout, per URL:
//! - `<hash>.rules.txt`  — the raw fetched list
//! - `<hash>.meta.json`  — fetch timestamp and the content file name
//!
//! where `<hash>` is the hex of the first 8 bytes of SHA-256 over the URL.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::rules::{parse_rule, Rule};

/// Metadata stored next to a cached URL download.
#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    fetched_at: String,
    rules_file: String,
}

/// Fetches and parses rule sources.
#[derive(Debug)]
pub struct Loader {
    client: reqwest::Client,
    data_dir: PathBuf,
}

impl Loader {
    /// Create a loader caching URL downloads under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            data_dir: data_dir.into(),
        }
    }

    /// Read rules from a local file. Lines that fail to parse are skipped.
    pub fn load_from_path(&self, path: &Path) -> anyhow::Result<Vec<Rule>> {
        let raw = fs::read_to_string(path)?;
        Ok(parse_lines(&raw, &path.to_string_lossy()))
    }

    /// Load rules for a URL, serving the on-disk copy when present.
    pub async fn load_from_url(&self, url: &str) -> anyhow::Result<Vec<Rule>> {
        let key = url_cache_key(url);
        let rules_path = self.data_dir.join(format!("{key}.rules.txt"));
        let meta_path = self.data_dir.join(format!("{key}.meta.json"));

        if rules_path.exists() {
            match self.load_from_path(&rules_path) {
                Ok(rules) => {
                    info!(url, "using cached rules");
                    return Ok(rules);
                }
                Err(e) => warn!(url, error = %e, "cached rules unreadable, refetching"),
            }
        }

        info!(url, "fetching rules");
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("bad status {} for '{}'", resp.status(), url);
        }
        let body = resp.text().await?;

        fs::create_dir_all(&self.data_dir)?;
        fs::write(&rules_path, &body)?;

        let meta = CacheMeta {
            fetched_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            rules_file: format!("{key}.rules.txt"),
        };
        if let Err(e) = fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?) {
            warn!(url, error = %e, "failed to write cache metadata");
        }

        let rules = parse_lines(&body, url);
        info!(url, count = rules.len(), "cached rules");
        Ok(rules)
    }
}

fn parse_lines(raw: &str, source: &str) -> Vec<Rule> {
    let mut rules = Vec::new();
    let mut skipped = 0usize;
    for line in raw.lines() {
        match parse_rule(line) {
            Ok(Some(rule)) => rules.push(rule),
            Ok(None) => {}
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(source, skipped, "skipped unparseable rule lines");
    }
    rules
}

/// Hex of the first 8 bytes of SHA-256 over the URL.
fn url_cache_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_16_hex_chars_and_stable() {
        let a = url_cache_key("https://example.com/list.txt");
        let b = url_cache_key("https://example.com/list.txt");
        let c = url_cache_key("https://example.com/other.txt");
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn path_load_skips_comments_and_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("list.txt");
        fs::write(
            &file,
            "! header\n||ads.example^\n\n||bad.example^$important,\n0.0.0.0 tracker.example\n",
        )
        .unwrap();

        let loader = Loader::new(dir.path());
        let rules = loader.load_from_path(&file).unwrap();
        let patterns: Vec<&str> = rules.iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["ads.example", "tracker.example"]);
    }

    #[tokio::test]
    async fn url_load_is_cache_first() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://lists.invalid/ads.txt";
        let key = url_cache_key(url);
        fs::write(
            dir.path().join(format!("{key}.rules.txt")),
            "||cached.example^\n",
        )
        .unwrap();

        // The host does not resolve; a cache hit must avoid the network.
        let loader = Loader::new(dir.path());
        let rules = loader.load_from_url(url).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pattern, "cached.example");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Loader::new(dir.path());
        assert!(loader.load_from_path(&dir.path().join("nope.txt")).is_err());
    }
}
