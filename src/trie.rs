//! Reverse-label domain trie.
//!
//! Rules are anchored at the node reached by walking the pattern's labels
//! from the TLD inward (`||example.com^` lives at com → example). Lookup
//! collects rules at every node along the query's suffix path, so it is a
//! superset oracle: Subdomain rules match at or below their anchor, Exact
//! rules still need an equality check in the decision loop.

use std::collections::HashMap;

use crate::rules::Rule;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// Rules anchored exactly at this node. Append-only within one index.
    rules: Vec<Rule>,
}

/// Suffix index over rule patterns. Built during reload, then read-only
/// under the engine's index lock.
#[derive(Debug, Default)]
pub struct DomainTrie {
    root: TrieNode,
}

impl DomainTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule at the node named by its pattern labels.
    pub fn insert(&mut self, rule: Rule) {
        let mut node = &mut self.root;
        for label in rule.pattern.split('.').rev() {
            node = node.children.entry(label.to_string()).or_default();
        }
        node.rules.push(rule);
    }

    /// Collect all rules anchored at any suffix of `domain`, in
    /// TLD-to-leaf order. `domain` may carry a trailing dot.
    pub fn search_trace(&self, domain: &str) -> Vec<&Rule> {
        let domain = domain.strip_suffix('.').unwrap_or(domain);
        let mut matched = Vec::new();

        let mut node = &self.root;
        for label in domain.split('.').rev() {
            match node.children.get(label) {
                Some(child) => {
                    node = child;
                    matched.extend(node.rules.iter());
                }
                None => break,
            }
        }

        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::parse_rule;

    fn rule(line: &str) -> Rule {
        parse_rule(line).unwrap().unwrap()
    }

    fn trie(lines: &[&str]) -> DomainTrie {
        let mut t = DomainTrie::new();
        for l in lines {
            t.insert(rule(l));
        }
        t
    }

    #[test]
    fn collects_rules_along_suffix_path() {
        let t = trie(&["||example.com^", "||ads.example.com^"]);

        let hits = t.search_trace("tracker.ads.example.com");
        let patterns: Vec<&str> = hits.iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["example.com", "ads.example.com"]);
    }

    #[test]
    fn general_anchor_seen_before_specific() {
        let t = trie(&["||example.com^", "||deep.sub.example.com^"]);
        let hits = t.search_trace("deep.sub.example.com");
        assert_eq!(hits[0].pattern, "example.com");
        assert_eq!(hits[1].pattern, "deep.sub.example.com");
    }

    #[test]
    fn stops_at_first_missing_edge() {
        let t = trie(&["||ads.example.com^"]);
        assert!(t.search_trace("other.com").is_empty());
        assert!(t.search_trace("example.com").is_empty());
    }

    #[test]
    fn exact_rules_surface_as_candidates() {
        // Equality enforcement happens in the engine, not here: an Exact
        // rule is still returned for strict subdomains of its pattern.
        let t = trie(&["tracker.example"]);
        assert_eq!(t.search_trace("tracker.example").len(), 1);
        assert_eq!(t.search_trace("sub.tracker.example").len(), 1);
    }

    #[test]
    fn trailing_dot_is_ignored() {
        let t = trie(&["||doubleclick.net^"]);
        assert_eq!(t.search_trace("ads.doubleclick.net.").len(), 1);
    }
}
