//! Domain blocklist seam.
//!
//! The proxy only needs a yes/no predicate per domain; where the verdict
//! comes from is pluggable. The built-in implementation matches a
//! compile-time seed list (exact domain or subdomain) plus a handful of
//! substring keywords via an Aho-Corasick automaton.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use std::collections::HashSet;

/// Seed domains blocked out of the box. Exact and subdomain matches.
const SEED_DOMAINS: &[&str] = &[
    "pornhub.com",
    "xvideos.com",
    "xnxx.com",
    "xhamster.com",
    "redtube.com",
    "youporn.com",
    "spankbang.com",
    "chaturbate.com",
    "stripchat.com",
    "livejasmin.com",
    "onlyfans.com",
    "adultfriendfinder.com",
    "rule34.xxx",
    "e621.net",
    "nhentai.net",
];

/// Substring keywords matched anywhere in the queried name.
const SEED_KEYWORDS: &[&str] = &["porn", "hentai", "xvideos", "nsfw"];

/// Predicate deciding whether a queried domain is blocked.
pub trait DomainBlocklist: Send + Sync {
    fn is_blocked(&self, domain: &str) -> bool;
}

/// Blocklist built from the compile-time seed list.
pub struct SeedBlocklist {
    domains: HashSet<String>,
    keywords: AhoCorasick,
}

impl SeedBlocklist {
    pub fn new() -> Self {
        Self::with_entries(
            SEED_DOMAINS.iter().copied(),
            SEED_KEYWORDS.iter().copied(),
        )
    }

    /// Builds a blocklist from explicit entries.
    pub fn with_entries<'a>(
        domains: impl IntoIterator<Item = &'a str>,
        keywords: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let domains = domains
            .into_iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        let keywords = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(keywords)
            .expect("seed keyword automaton");
        Self { domains, keywords }
    }
}

impl Default for SeedBlocklist {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainBlocklist for SeedBlocklist {
    fn is_blocked(&self, domain: &str) -> bool {
        let normalized = domain.trim_end_matches('.').to_ascii_lowercase();

        if self.keywords.is_match(&normalized) {
            return true;
        }

        // Walk parent domains so a.b.example.com matches example.com.
        let mut rest = normalized.as_str();
        loop {
            if self.domains.contains(rest) {
                return true;
            }
            match rest.split_once('.') {
                Some((_, tail)) => rest = tail,
                None => return false,
            }
        }
    }
}

/// Blocklist that never matches. Useful for tests and forward-only setups.
pub struct NoBlocklist;

impl DomainBlocklist for NoBlocklist {
    fn is_blocked(&self, _domain: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_subdomain_match() {
        let list = SeedBlocklist::new();

        assert!(list.is_blocked("pornhub.com"));
        assert!(list.is_blocked("www.pornhub.com"));
        assert!(list.is_blocked("cdn.eu.xhamster.com"));
        assert!(!list.is_blocked("example.com"));
    }

    #[test]
    fn test_keyword_match() {
        let list = SeedBlocklist::new();

        assert!(list.is_blocked("free-porn.example.com"));
        assert!(list.is_blocked("HENTAI.example.net"));
        assert!(!list.is_blocked("popcorn-recipes.example.com"));
    }

    #[test]
    fn test_case_and_trailing_dot() {
        let list = SeedBlocklist::new();
        assert!(list.is_blocked("PornHub.COM."));
    }

    #[test]
    fn test_suffix_is_not_substring() {
        let list = SeedBlocklist::with_entries(["tube.com"], []);

        assert!(list.is_blocked("tube.com"));
        assert!(list.is_blocked("www.tube.com"));
        // "redtube.com" ends with the characters but is a different domain.
        assert!(!list.is_blocked("redtube.com"));
    }

    #[test]
    fn test_no_blocklist() {
        assert!(!NoBlocklist.is_blocked("pornhub.com"));
    }
}
