//! Filter rule model and line parser.
//!
//! Rules come from AdGuard-style filter lists and classic hosts files.
//! Each line parses into a typed [`Rule`] carrying the matching strategy,
//! the whitelist flag, modifiers, and (after load) the owning rule group.

use std::net::IpAddr;

use thiserror::Error;

/// Error raised for a rule line whose modifier segment cannot be parsed.
///
/// Callers skip the offending line; the rest of the source still loads.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed modifier segment in rule '{0}'")]
    Modifier(String),
}

/// How a rule matches a query name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Exact FQDN match: `example.com` or a hosts-file entry.
    Exact,
    /// Domain plus all subdomains: `||example.com^`.
    Subdomain,
    /// Regex match: `/…/`, or a wildcard pattern converted at parse time.
    Regex,
}

/// Parsed `$…` modifiers attached to a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modifiers {
    /// `$client=` tokens: usernames, IPs or CIDRs, all-inclusion or
    /// all-exclusion (decided by the `~` prefix on the first token).
    pub clients: Vec<String>,
    /// `$denyallow=` domains that suppress the rule when matched exactly.
    pub deny_allow: Vec<String>,
    /// `$dnstype=` type names, same inclusion/exclusion convention as clients.
    pub dns_types: Vec<String>,
    /// `$dnsrewrite=` destination (IP literal or CNAME target).
    pub dns_rewrite: Option<String>,
    /// `$important`: elevated priority tier.
    pub important: bool,
    /// `$badfilter`: the rule is ignored entirely.
    pub bad_filter: bool,
}

/// A single filtering rule, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Original line, kept for diagnostics.
    pub text: String,
    pub kind: RuleKind,
    /// Bare domain for Exact/Subdomain; regex source for Regex.
    pub pattern: String,
    /// True when the line began with `@@`.
    pub is_whitelist: bool,
    /// Set for hosts-file lines with a non-loopback, non-unspecified IP.
    pub rewrite_ip: Option<IpAddr>,
    pub modifiers: Modifiers,
    /// Owning rule group, stamped at load time. Non-zero in the index.
    pub group_id: u32,
}

/// Parse a single filter line.
///
/// Returns `Ok(None)` for empty lines and comments (`!`, `#`).
pub fn parse_rule(line: &str) -> Result<Option<Rule>, ParseError> {
    let mut text = line.trim();
    if text.is_empty() || text.starts_with('!') || text.starts_with('#') {
        return Ok(None);
    }

    let original = text.to_string();

    let is_whitelist = if let Some(rest) = text.strip_prefix("@@") {
        text = rest;
        true
    } else {
        false
    };

    // Modifiers sit after the last `$`.
    let mut modifiers = Modifiers::default();
    if let Some(idx) = text.rfind('$') {
        parse_modifiers(&text[idx + 1..], &mut modifiers)
            .map_err(|_| ParseError::Modifier(original.clone()))?;
        text = &text[..idx];
    }

    let mut rewrite_ip = None;
    let (kind, mut pattern) = if text.len() >= 2 && text.starts_with('/') && text.ends_with('/') {
        (RuleKind::Regex, text[1..text.len() - 1].to_string())
    } else if let Some(rest) = text.strip_prefix("||") {
        (RuleKind::Subdomain, rest.to_string())
    } else {
        let fields: Vec<&str> = text.split_whitespace().collect();
        match fields.first().and_then(|f| f.parse::<IpAddr>().ok()) {
            Some(ip) if fields.len() >= 2 => {
                // Hosts-file form. Loopback/unspecified addresses mean "block";
                // anything else is a rewrite destination.
                if !ip.is_loopback() && !ip.is_unspecified() {
                    rewrite_ip = Some(ip);
                    modifiers.dns_rewrite = Some(ip.to_string());
                }
                (RuleKind::Exact, fields[1].to_string())
            }
            _ => (RuleKind::Exact, text.to_string()),
        }
    };

    if let Some(stripped) = pattern.strip_suffix('^') {
        pattern = stripped.to_string();
    }

    // Wildcard patterns become anchored regexes.
    let kind = if kind != RuleKind::Regex && pattern.contains('*') {
        let escaped = regex::escape(&pattern).replace("\\*", ".*");
        pattern = match kind {
            RuleKind::Subdomain => format!("(^|\\.){escaped}$"),
            _ => format!("^{escaped}$"),
        };
        RuleKind::Regex
    } else {
        kind
    };

    Ok(Some(Rule {
        text: original,
        kind,
        pattern,
        is_whitelist,
        rewrite_ip,
        modifiers,
        group_id: 0,
    }))
}

fn parse_modifiers(raw: &str, m: &mut Modifiers) -> Result<(), ()> {
    for part in raw.split(',') {
        let (key, value) = match part.split_once('=') {
            Some((k, v)) => (k.trim(), v),
            None => (part.trim(), ""),
        };
        match key {
            "client" => m.clients.push(value.to_string()),
            "denyallow" => m.deny_allow.push(value.to_string()),
            "dnstype" => m.dns_types.push(value.to_string()),
            "dnsrewrite" => m.dns_rewrite = Some(value.to_string()),
            "important" => m.important = true,
            "badfilter" => m.bad_filter = true,
            // Cosmetic and network-layer modifiers with no DNS meaning.
            "image" | "script" | "third-party" | "xmlhttprequest" | "popup" | "generichide" => {}
            "" => return Err(()),
            // Unknown keys are tolerated so newer list syntax does not
            // invalidate whole sources.
            _ => {}
        }
    }
    Ok(())
}

/// Normalize a DNS name for matching and cache keys: trim whitespace,
/// lowercase ASCII, strip the trailing dot.
pub fn normalize_name(name: &str) -> String {
    let s = name.trim().to_ascii_lowercase();
    s.strip_suffix('.').map(str::to_string).unwrap_or(s)
}
