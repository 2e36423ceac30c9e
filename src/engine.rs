//! Filtering decision engine.
//!
//! Holds the reloadable rule index (domain trie + regex bucket) behind a
//! reader-writer lock, and combines user identity, schedule-gated policy
//! ordering, modifier filtering and whitelist/block priority tiers into a
//! per-query decision.
//!
//! Reload builds a fresh index off to the side and swaps it in under a
//! brief write lock; queries running against the prior index finish on it
//! and the old index is dropped with its last reference.

use std::{
    collections::HashMap,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use hickory_proto::rr::RecordType;
use ipnet::IpNet;
use regex::Regex;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{
    config::{Config, User},
    loader::Loader,
    rules::{normalize_name, Rule, RuleKind},
    schedule::{local_now, ScheduleMatcher},
    trie::DomainTrie,
    users::UserMatcher,
};

/// A regex rule compiled at load time.
#[derive(Debug)]
pub struct RegexRule {
    pub regex: Regex,
    pub rule: Rule,
}

/// The atomically-swappable lookup artifact.
#[derive(Debug, Default)]
pub struct RuleIndex {
    pub trie: DomainTrie,
    pub regex_rules: Vec<RegexRule>,
}

/// State guarded by the engine's index lock: the current index and the
/// per-path rule cache reused across reloads.
#[derive(Debug, Default)]
struct Shared {
    index: Arc<RuleIndex>,
    file_rules: HashMap<PathBuf, Arc<Vec<Rule>>>,
}

/// The decision for one query.
#[derive(Debug, Clone)]
pub struct ResolveResult {
    pub blocked: bool,
    pub reason: &'static str,
    /// The decisive rule, when one matched.
    pub rule: Option<Rule>,
    pub user: Option<Arc<User>>,
    /// Rewrite destination (IP literal or CNAME target) for rewrites.
    pub rewrite: Option<String>,
}

impl ResolveResult {
    fn allowed(reason: &'static str, rule: Option<Rule>, user: Option<Arc<User>>) -> Self {
        Self {
            blocked: false,
            reason,
            rule,
            user,
            rewrite: None,
        }
    }

    fn blocked(rule: &Rule, user: Option<Arc<User>>, important: bool) -> Self {
        let (reason, rewrite) = match &rule.modifiers.dns_rewrite {
            Some(dest) => ("rewrite", Some(dest.clone())),
            None if important => ("important blocked", None),
            None => ("blocked", None),
        };
        Self {
            blocked: true,
            reason,
            rule: Some(rule.clone()),
            user,
            rewrite,
        }
    }
}

/// The filtering engine. Pure over its configuration snapshot and the
/// current index; the caches around it belong to the server.
#[derive(Debug)]
pub struct Engine {
    cfg: Config,
    users: UserMatcher,
    schedules: ScheduleMatcher,
    shared: RwLock<Shared>,
    /// Rule-group name → id, assigned once from config order (1-based) so
    /// ids stay stable across reloads.
    group_ids: HashMap<String, u32>,
    default_user_group: String,
}

impl Engine {
    /// Build the engine from a configuration snapshot. Invalid user
    /// addresses or schedule definitions are fatal here, before the
    /// server ever binds.
    pub fn new(cfg: Config) -> anyhow::Result<Self> {
        let users = UserMatcher::new(&cfg)?;
        let schedules = ScheduleMatcher::new(&cfg)?;

        let group_ids = cfg
            .rule_groups
            .iter()
            .enumerate()
            .map(|(i, rg)| (rg.name.clone(), i as u32 + 1))
            .collect();

        Ok(Self {
            default_user_group: cfg.defaults.user_group.clone(),
            users,
            schedules,
            shared: RwLock::new(Shared::default()),
            group_ids,
            cfg,
        })
    }

    /// Identify the client for diagnostics and cache keying.
    pub fn identify(&self, ip: IpAddr, mac: Option<&str>) -> Option<Arc<User>> {
        self.users.match_client(ip, mac)
    }

    /// Reload every configured source and swap the fresh index in.
    ///
    /// Sources load concurrently; a failed source is logged and skipped,
    /// so the swap proceeds with whatever loaded. The prior index keeps
    /// serving until the swap. Local files hit the rule-file cache first;
    /// fresh reads repopulate it.
    pub async fn reload(&self, loader: &Arc<Loader>) {
        info!(groups = self.cfg.rule_groups.len(), "reloading rules");

        type SourceResult = (String, u32, Option<PathBuf>, anyhow::Result<Vec<Rule>>);
        let mut tasks: JoinSet<SourceResult> = JoinSet::new();
        let mut batches = Vec::new();

        for rg in &self.cfg.rule_groups {
            let gid = self.group_ids[&rg.name];
            for source in &rg.sources {
                match (&source.path, &source.url) {
                    (Some(path), _) => {
                        let path = PathBuf::from(path);
                        if let Some(cached) = self.cached_file_rules(&path) {
                            batches.push((gid, cached));
                            continue;
                        }
                        let loader = loader.clone();
                        let name = source.name.clone();
                        tasks.spawn(async move {
                            let rules = loader.load_from_path(&path);
                            (name, gid, Some(path), rules)
                        });
                    }
                    (None, Some(url)) => {
                        let loader = loader.clone();
                        let url = url.clone();
                        let name = source.name.clone();
                        tasks.spawn(async move {
                            let rules = loader.load_from_url(&url).await;
                            (name, gid, None, rules)
                        });
                    }
                    (None, None) => {
                        warn!(source = %source.name, "source has neither url nor path");
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((name, gid, path, result)) = joined else {
                continue;
            };
            match result {
                Ok(rules) => {
                    info!(source = %name, count = rules.len(), "loaded rules");
                    if let Some(path) = path {
                        self.shared
                            .write()
                            .unwrap()
                            .file_rules
                            .insert(path, Arc::new(rules.clone()));
                    }
                    batches.push((gid, rules));
                }
                Err(e) => warn!(source = %name, error = %e, "failed to load source"),
            }
        }

        self.install_rules(batches);
        info!("rule index swapped");
    }

    fn cached_file_rules(&self, path: &Path) -> Option<Vec<Rule>> {
        let shared = self.shared.read().unwrap();
        shared.file_rules.get(path).map(|r| r.as_ref().clone())
    }

    /// Build a fresh index from per-group rule batches and publish it.
    fn install_rules(&self, batches: Vec<(u32, Vec<Rule>)>) {
        let mut trie = DomainTrie::new();
        let mut regex_rules = Vec::new();

        for (gid, rules) in batches {
            for mut rule in rules {
                rule.group_id = gid;
                match rule.kind {
                    RuleKind::Exact | RuleKind::Subdomain => trie.insert(rule),
                    RuleKind::Regex => match Regex::new(&rule.pattern) {
                        Ok(regex) => regex_rules.push(RegexRule { regex, rule }),
                        Err(e) => {
                            warn!(rule = %rule.text, error = %e, "dropping rule with invalid regex");
                        }
                    },
                }
            }
        }

        let index = Arc::new(RuleIndex { trie, regex_rules });
        self.shared.write().unwrap().index = index;
    }

    /// Decide what to do with one query.
    pub fn resolve(
        &self,
        qname: &str,
        qtype: RecordType,
        client_ip: IpAddr,
        client_mac: Option<&str>,
    ) -> ResolveResult {
        self.resolve_at(qname, qtype, client_ip, client_mac, local_now())
    }

    fn resolve_at(
        &self,
        qname: &str,
        qtype: RecordType,
        client_ip: IpAddr,
        client_mac: Option<&str>,
        now: OffsetDateTime,
    ) -> ResolveResult {
        let user = self.users.match_client(client_ip, client_mac);
        let group_name = user
            .as_ref()
            .map(|u| u.user_group.as_str())
            .unwrap_or(&self.default_user_group);

        let active_groups = self.active_group_ids(group_name, now);
        if active_groups.is_empty() {
            return ResolveResult::allowed("no active rules", None, user);
        }

        // Snapshot the current index; a concurrent reload swaps the
        // pointer without disturbing this lookup.
        let index = self.shared.read().unwrap().index.clone();

        let qname = normalize_name(qname);
        let mut candidates = index.trie.search_trace(&qname);
        for rr in &index.regex_rules {
            if rr.regex.is_match(&qname) {
                candidates.push(&rr.rule);
            }
        }

        for gid in active_groups {
            let mut important_whitelist: Option<&Rule> = None;
            let mut important_block: Option<&Rule> = None;
            let mut whitelist: Option<&Rule> = None;
            let mut block: Option<&Rule> = None;

            for &rule in &candidates {
                if rule.group_id != gid {
                    continue;
                }
                if rule.kind == RuleKind::Exact && rule.pattern != qname {
                    continue;
                }
                if !check_modifiers(rule, user.as_deref(), qtype, client_ip, &qname) {
                    continue;
                }

                // First candidate wins each slot; SearchTrace order means
                // more-general anchors are seen first.
                let slot = match (rule.is_whitelist, rule.modifiers.important) {
                    (true, true) => &mut important_whitelist,
                    (false, true) => &mut important_block,
                    (true, false) => &mut whitelist,
                    (false, false) => &mut block,
                };
                if slot.is_none() {
                    *slot = Some(rule);
                }
            }

            if let Some(rule) = important_whitelist {
                return ResolveResult::allowed("important whitelisted", Some(rule.clone()), user);
            }
            if let Some(rule) = important_block {
                return ResolveResult::blocked(rule, user, true);
            }
            if let Some(rule) = whitelist {
                return ResolveResult::allowed("whitelisted", Some(rule.clone()), user);
            }
            if let Some(rule) = block {
                return ResolveResult::blocked(rule, user, false);
            }
            // Nothing decisive in this group, on to the next.
        }

        ResolveResult::allowed("not found", None, user)
    }

    /// Ordered ids of rule groups whose policy is not suppressed at `now`.
    ///
    /// A schedule that is in-window SUPPRESSES its policy; duplicates
    /// collapse to the first occurrence.
    fn active_group_ids(&self, group_name: &str, now: OffsetDateTime) -> Vec<u32> {
        let Some(ug) = self.cfg.user_groups.iter().find(|g| g.name == group_name) else {
            return Vec::new();
        };

        let mut ids = Vec::new();
        for policy in &ug.policies {
            let schedule = policy.schedule.as_deref().unwrap_or("");
            if self.schedules.is_active(schedule, now) {
                continue;
            }
            if let Some(&gid) = self.group_ids.get(&policy.rule_group) {
                if !ids.contains(&gid) {
                    ids.push(gid);
                }
            }
        }
        ids
    }
}

/// Evaluate a rule's modifiers against the query. Any rejection
/// disqualifies the rule for this query only.
fn check_modifiers(
    rule: &Rule,
    user: Option<&User>,
    qtype: RecordType,
    client_ip: IpAddr,
    qname: &str,
) -> bool {
    let m = &rule.modifiers;

    if m.bad_filter {
        return false;
    }

    // $client: all-inclusion (A|B) or all-exclusion (~A|~B), decided by
    // the first token.
    if !m.clients.is_empty() {
        let targets: Vec<&str> = m
            .clients
            .iter()
            .flat_map(|raw| raw.split('|'))
            .map(str::trim)
            .collect();
        let exclusion = targets.first().is_some_and(|t| t.starts_with('~'));
        let matched = targets.iter().any(|t| {
            let target = t.strip_prefix('~').unwrap_or(t);
            client_token_matches(target, user, client_ip)
        });
        if matched == exclusion {
            return false;
        }
    }

    // $dnstype: same convention, names compared case-insensitively.
    if !m.dns_types.is_empty() {
        let type_name = qtype.to_string();
        let targets: Vec<&str> = m
            .dns_types
            .iter()
            .flat_map(|raw| raw.split('|'))
            .map(str::trim)
            .collect();
        let exclusion = targets.first().is_some_and(|t| t.starts_with('~'));
        let matched = targets.iter().any(|t| {
            t.strip_prefix('~')
                .unwrap_or(t)
                .eq_ignore_ascii_case(&type_name)
        });
        if matched == exclusion {
            return false;
        }
    }

    // $denyallow: an exact query-name hit suppresses the rule. Strict
    // subdomains of a denyallow domain do not escape.
    if !m.deny_allow.is_empty() {
        let excluded = m
            .deny_allow
            .iter()
            .flat_map(|raw| raw.split('|'))
            .map(str::trim)
            .any(|da| da == qname);
        if excluded {
            return false;
        }
    }

    true
}

/// One `$client` token against the query's client, first parse wins:
/// username, exact IP, CIDR containment, then textual IP form.
fn client_token_matches(token: &str, user: Option<&User>, client_ip: IpAddr) -> bool {
    if let Some(u) = user {
        if token == u.name {
            return true;
        }
    }
    if let Ok(addr) = token.parse::<IpAddr>() {
        return addr == client_ip;
    }
    if let Ok(net) = token.parse::<IpNet>() {
        return net.contains(&client_ip);
    }
    token == client_ip.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::parse_rule;
    use time::macros::datetime;

    // 2026-01-05 is a Monday.
    const MONDAY_MORNING: OffsetDateTime = datetime!(2026-01-05 10:00 UTC);
    const MONDAY_EVENING: OffsetDateTime = datetime!(2026-01-05 20:00 UTC);

    const BASE_CONFIG: &str = r#"
users:
  - name: alice
    ips: ["10.0.0.5"]
    user_group: adults
  - name: kid
    ips: ["10.0.1.0/24"]
    user_group: kids
user_groups:
  - name: adults
    policies:
      - rule_group: ads
  - name: kids
    policies:
      - rule_group: ads
      - rule_group: strict
  - name: scheduled
    policies:
      - rule_group: ads
        schedule: evening
rule_groups:
  - name: ads
    sources: []
  - name: strict
    sources: []
schedules:
  - name: evening
    items:
      - days: [Mon]
        ranges: ["18:00-23:00"]
defaults:
  user_group: adults
"#;

    fn engine_with(groups: &[(&str, &[&str])]) -> Arc<Engine> {
        let cfg: Config = serde_yaml::from_str(BASE_CONFIG).unwrap();
        let engine = Engine::new(cfg).unwrap();
        let batches = groups
            .iter()
            .map(|(name, lines)| {
                let gid = engine.group_ids[*name];
                let rules = lines
                    .iter()
                    .map(|l| parse_rule(l).unwrap().unwrap())
                    .collect();
                (gid, rules)
            })
            .collect();
        engine.install_rules(batches);
        Arc::new(engine)
    }

    fn resolve(engine: &Engine, qname: &str, qtype: RecordType, ip: &str) -> ResolveResult {
        engine.resolve_at(qname, qtype, ip.parse().unwrap(), None, MONDAY_MORNING)
    }

    #[test]
    fn subdomain_rule_blocks_domain_and_children() {
        let e = engine_with(&[("ads", &["||doubleclick.net^"])]);
        assert!(resolve(&e, "doubleclick.net", RecordType::A, "10.0.0.5").blocked);
        assert!(resolve(&e, "ads.doubleclick.net.", RecordType::A, "10.0.0.5").blocked);
        assert!(!resolve(&e, "notdoubleclick.net", RecordType::A, "10.0.0.5").blocked);
    }

    #[test]
    fn exact_rule_does_not_match_subdomains() {
        let e = engine_with(&[("ads", &["0.0.0.0 tracker.example"])]);
        assert!(resolve(&e, "tracker.example", RecordType::A, "10.0.0.5").blocked);
        let sub = resolve(&e, "sub.tracker.example", RecordType::A, "10.0.0.5");
        assert!(!sub.blocked);
        assert_eq!(sub.reason, "not found");
    }

    #[test]
    fn whitelist_wins_within_tier() {
        let e = engine_with(&[("ads", &["||doubleclick.net^", "@@||safe.doubleclick.net^"])]);
        assert!(resolve(&e, "ads.doubleclick.net", RecordType::A, "10.0.0.5").blocked);
        let res = resolve(&e, "safe.doubleclick.net", RecordType::A, "10.0.0.5");
        assert!(!res.blocked);
        assert_eq!(res.reason, "whitelisted");
    }

    #[test]
    fn important_whitelist_beats_plain_block() {
        let e = engine_with(&[("ads", &["||ads.example^", "@@||ads.example^$important"])]);
        let res = resolve(&e, "ads.example", RecordType::A, "10.0.0.5");
        assert!(!res.blocked);
        assert_eq!(res.reason, "important whitelisted");
    }

    #[test]
    fn important_block_beats_plain_whitelist() {
        let e = engine_with(&[("ads", &["@@||ads.example^", "||ads.example^$important"])]);
        let res = resolve(&e, "ads.example", RecordType::A, "10.0.0.5");
        assert!(res.blocked);
        assert_eq!(res.reason, "important blocked");
    }

    #[test]
    fn hosts_rewrite_produces_rewrite_not_block() {
        let e = engine_with(&[("ads", &["1.2.3.4 redir.example"])]);
        let res = resolve(&e, "redir.example", RecordType::A, "10.0.0.5");
        assert!(res.blocked);
        assert_eq!(res.reason, "rewrite");
        assert_eq!(res.rewrite.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn earlier_group_decides_before_later() {
        // "ads" whitelists what "strict" blocks; kids get both, ads first.
        let e = engine_with(&[
            ("ads", &["@@||games.example^"]),
            ("strict", &["||games.example^"]),
        ]);
        let res = resolve(&e, "games.example", RecordType::A, "10.0.1.9");
        assert!(!res.blocked);
        assert_eq!(res.reason, "whitelisted");

        // The strict group still decides names the ads group is silent on.
        let e = engine_with(&[("strict", &["||videos.example^"])]);
        assert!(resolve(&e, "videos.example", RecordType::A, "10.0.1.9").blocked);
    }

    #[test]
    fn schedule_window_suppresses_policy() {
        let mut cfg: Config = serde_yaml::from_str(BASE_CONFIG).unwrap();
        cfg.defaults.user_group = "scheduled".to_string();
        let engine = Engine::new(cfg).unwrap();
        let gid = engine.group_ids["ads"];
        engine.install_rules(vec![(
            gid,
            vec![parse_rule("||ads.example^").unwrap().unwrap()],
        )]);

        // Unmatched client falls into the scheduled default group.
        let ip: IpAddr = "192.168.9.9".parse().unwrap();
        let blocked = engine.resolve_at("ads.example", RecordType::A, ip, None, MONDAY_MORNING);
        assert!(blocked.blocked);

        let evening = engine.resolve_at("ads.example", RecordType::A, ip, None, MONDAY_EVENING);
        assert!(!evening.blocked);
        assert_eq!(evening.reason, "no active rules");
    }

    #[test]
    fn client_cidr_modifier_scopes_rule() {
        let e = engine_with(&[("ads", &["||track.example^$client=10.0.0.0/24"])]);
        assert!(resolve(&e, "track.example", RecordType::A, "10.0.0.5").blocked);
        assert!(!resolve(&e, "track.example", RecordType::A, "192.168.1.5").blocked);
    }

    #[test]
    fn client_exclusion_mode_inverts() {
        let e = engine_with(&[("ads", &["||track.example^$client=~alice"])]);
        assert!(!resolve(&e, "track.example", RecordType::A, "10.0.0.5").blocked);
        assert!(resolve(&e, "track.example", RecordType::A, "10.0.1.9").blocked);
    }

    #[test]
    fn client_username_token_matches() {
        let e = engine_with(&[("ads", &["||track.example^$client=alice"])]);
        assert!(resolve(&e, "track.example", RecordType::A, "10.0.0.5").blocked);
        assert!(!resolve(&e, "track.example", RecordType::A, "10.0.1.9").blocked);
    }

    #[test]
    fn dnstype_modifier_scopes_rule() {
        let e = engine_with(&[("ads", &["||v6only.example^$dnstype=AAAA"])]);
        assert!(!resolve(&e, "v6only.example", RecordType::A, "10.0.0.5").blocked);
        assert!(resolve(&e, "v6only.example", RecordType::AAAA, "10.0.0.5").blocked);
    }

    #[test]
    fn dnstype_exclusion_mode() {
        let e = engine_with(&[("ads", &["||noaaaa.example^$dnstype=~AAAA"])]);
        assert!(resolve(&e, "noaaaa.example", RecordType::A, "10.0.0.5").blocked);
        assert!(!resolve(&e, "noaaaa.example", RecordType::AAAA, "10.0.0.5").blocked);
    }

    #[test]
    fn denyallow_exempts_exact_name_only() {
        let e = engine_with(&[("ads", &["||example.org^$denyallow=good.example.org"])]);
        assert!(!resolve(&e, "good.example.org", RecordType::A, "10.0.0.5").blocked);
        assert!(resolve(&e, "bad.example.org", RecordType::A, "10.0.0.5").blocked);
        // Subdomains of a denyallow domain do not escape.
        assert!(resolve(&e, "sub.good.example.org", RecordType::A, "10.0.0.5").blocked);
    }

    #[test]
    fn badfilter_rule_is_inert() {
        let e = engine_with(&[("ads", &["||dead.example^$badfilter"])]);
        assert!(!resolve(&e, "dead.example", RecordType::A, "10.0.0.5").blocked);
    }

    #[test]
    fn regex_rule_matches() {
        let e = engine_with(&[("ads", &["/^ads[0-9]+\\./"])]);
        assert!(resolve(&e, "ads123.example.com", RecordType::A, "10.0.0.5").blocked);
        assert!(!resolve(&e, "ads.example.com", RecordType::A, "10.0.0.5").blocked);
    }

    #[test]
    fn wildcard_subdomain_rule_matches_via_regex() {
        let e = engine_with(&[("ads", &["||ad*.metrics.example^"])]);
        assert!(resolve(&e, "ads1.metrics.example", RecordType::A, "10.0.0.5").blocked);
        assert!(resolve(&e, "x.adserver.metrics.example", RecordType::A, "10.0.0.5").blocked);
        assert!(!resolve(&e, "metrics.example", RecordType::A, "10.0.0.5").blocked);
    }

    #[test]
    fn dnsrewrite_modifier_sets_destination() {
        let e = engine_with(&[("ads", &["||cdn.example^$dnsrewrite=10.1.1.1"])]);
        let res = resolve(&e, "cdn.example", RecordType::A, "10.0.0.5");
        assert!(res.blocked);
        assert_eq!(res.reason, "rewrite");
        assert_eq!(res.rewrite.as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn unknown_user_group_means_no_active_rules() {
        let mut cfg: Config = serde_yaml::from_str(BASE_CONFIG).unwrap();
        cfg.defaults.user_group = "missing".to_string();
        let engine = Engine::new(cfg).unwrap();
        let gid = engine.group_ids["ads"];
        engine.install_rules(vec![(
            gid,
            vec![parse_rule("||ads.example^").unwrap().unwrap()],
        )]);

        let ip: IpAddr = "192.168.9.9".parse().unwrap();
        let res = engine.resolve_at("ads.example", RecordType::A, ip, None, MONDAY_MORNING);
        assert!(!res.blocked);
        assert_eq!(res.reason, "no active rules");
    }

    #[test]
    fn reload_replaces_index_wholesale() {
        let e = engine_with(&[("ads", &["||old.example^"])]);
        assert!(resolve(&e, "old.example", RecordType::A, "10.0.0.5").blocked);

        let gid = e.group_ids["ads"];
        e.install_rules(vec![(
            gid,
            vec![parse_rule("||new.example^").unwrap().unwrap()],
        )]);
        assert!(!resolve(&e, "old.example", RecordType::A, "10.0.0.5").blocked);
        assert!(resolve(&e, "new.example", RecordType::A, "10.0.0.5").blocked);
    }

    #[test]
    fn decision_reports_matched_user() {
        let e = engine_with(&[("ads", &["||ads.example^"])]);
        let res = resolve(&e, "ads.example", RecordType::A, "10.0.0.5");
        assert_eq!(res.user.as_ref().unwrap().name, "alice");
        assert_eq!(res.rule.as_ref().unwrap().pattern, "ads.example");
    }
}
