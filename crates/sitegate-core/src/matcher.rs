//! Rule matching.
//!
//! Patterns are compiled once into a [`CompiledPattern`] when a rule enters
//! the engine; evaluation then only borrows. The free function [`matches`]
//! compiles on every call and is meant for one-off checks.

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::error::{Result, RuleError};
use crate::normalize::{is_same_or_subdomain, normalize};
use crate::rules::{BlockRule, MatchType};

/// Upper bound on compiled regex size for user-supplied patterns.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// A request target prepared for matching against many rules.
#[derive(Debug, Clone)]
pub struct MatchInput<'a> {
    raw: &'a str,
    raw_lower: String,
    host: String,
}

impl<'a> MatchInput<'a> {
    /// Prepares a URL or host.
    pub fn new(input: &'a str) -> Self {
        let raw = input.trim();
        Self {
            raw,
            raw_lower: raw.to_lowercase(),
            host: normalize(raw),
        }
    }

    /// The trimmed input.
    pub fn raw(&self) -> &str {
        self.raw
    }

    /// The normalized host.
    pub fn host(&self) -> &str {
        &self.host
    }
}

/// A rule pattern in its ready-to-evaluate form.
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    Exact { pattern: String, case_sensitive: bool },
    Domain { domain: String },
    Contains { needle: String, case_sensitive: bool },
    Regex(Regex),
    Wildcard(Regex),
}

impl CompiledPattern {
    /// Compiles the pattern of `rule`.
    ///
    /// Fails with a `pattern` field error when a regex or wildcard pattern
    /// does not compile.
    pub fn compile(rule: &BlockRule) -> Result<Self> {
        let pattern = rule.pattern.trim();
        let case_sensitive = rule.case_sensitive;

        let compiled = match rule.match_type {
            MatchType::Exact => CompiledPattern::Exact {
                pattern: fold(pattern, case_sensitive),
                case_sensitive,
            },
            MatchType::Domain => CompiledPattern::Domain {
                domain: normalize(pattern),
            },
            MatchType::Contains => CompiledPattern::Contains {
                needle: fold(pattern, case_sensitive),
                case_sensitive,
            },
            MatchType::Regex => CompiledPattern::Regex(build_regex(pattern, case_sensitive)?),
            MatchType::Wildcard => {
                CompiledPattern::Wildcard(build_regex(&wildcard_to_regex(pattern), case_sensitive)?)
            }
        };

        Ok(compiled)
    }

    /// Evaluates the pattern against a prepared input.
    pub fn is_match(&self, input: &MatchInput<'_>) -> bool {
        match self {
            CompiledPattern::Exact {
                pattern,
                case_sensitive,
            } => {
                let raw = if *case_sensitive {
                    input.raw
                } else {
                    input.raw_lower.as_str()
                };
                raw == pattern
            }
            CompiledPattern::Domain { domain } => is_same_or_subdomain(&input.host, domain),
            CompiledPattern::Contains {
                needle,
                case_sensitive,
            } => {
                if *case_sensitive {
                    input.raw.contains(needle.as_str())
                } else {
                    input.raw_lower.contains(needle.as_str())
                }
            }
            CompiledPattern::Regex(re) => re.is_match(input.raw),
            CompiledPattern::Wildcard(re) => re.is_match(&input.host) || re.is_match(input.raw),
        }
    }
}

/// A rule together with its compiled pattern.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: BlockRule,
    pattern: CompiledPattern,
}

impl CompiledRule {
    /// Compiles a rule.
    pub fn new(rule: BlockRule) -> Result<Self> {
        let pattern = CompiledPattern::compile(&rule)?;
        Ok(Self { rule, pattern })
    }

    /// The underlying rule.
    pub fn rule(&self) -> &BlockRule {
        &self.rule
    }

    /// Evaluates the rule's pattern. Ignores `enabled`, groups and schedule.
    pub fn is_match(&self, input: &MatchInput<'_>) -> bool {
        self.pattern.is_match(input)
    }
}

/// Checks whether `domain_or_url` matches `rule`'s pattern.
///
/// Compiles the pattern on each call. An uncompilable pattern is logged and
/// treated as no match.
pub fn matches(domain_or_url: &str, rule: &BlockRule) -> bool {
    match CompiledPattern::compile(rule) {
        Ok(pattern) => pattern.is_match(&MatchInput::new(domain_or_url)),
        Err(e) => {
            warn!(rule_id = %rule.id, error = %e, "Rule pattern does not compile, treating as no match");
            false
        }
    }
}

fn fold(pattern: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        pattern.to_string()
    } else {
        pattern.to_lowercase()
    }
}

fn build_regex(pattern: &str, case_sensitive: bool) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| RuleError::invalid("pattern", e.to_string()))
}

/// Translates `*` and `?` into an anchored regex, escaping everything else.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            _ => out.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleAction;

    fn rule(pattern: &str, match_type: MatchType) -> BlockRule {
        BlockRule::new("r", pattern, match_type, RuleAction::Block)
    }

    #[test]
    fn domain_matches_subdomains_only_on_label_boundary() {
        let r = rule("example.com", MatchType::Domain);
        assert!(matches("example.com", &r));
        assert!(matches("sub.example.com", &r));
        assert!(matches("https://a.b.example.com:443/x", &r));
        assert!(!matches("notexample.com", &r));
        assert!(!matches("example.com.evil.test", &r));
    }

    #[test]
    fn domain_is_case_insensitive_even_when_flagged() {
        let r = rule("Example.COM", MatchType::Domain).case_sensitive();
        assert!(matches("EXAMPLE.com", &r));
    }

    #[test]
    fn domain_pattern_is_normalized() {
        let r = rule("https://www.social.example/", MatchType::Domain);
        assert!(matches("http://sub.social.example/feed", &r));
        assert!(!matches("http://news.example", &r));
    }

    #[test]
    fn exact_matches_whole_input_only() {
        let r = rule("example.com", MatchType::Exact);
        assert!(matches("example.com", &r));
        assert!(matches("  Example.com ", &r));
        assert!(!matches("https://www.example.com/any/path", &r));
        assert!(!matches("http://example.com", &r));
        assert!(!matches("sub.example.com", &r));

        let url = rule("http://example.com/a", MatchType::Exact);
        assert!(matches("http://example.com/a", &url));
        assert!(!matches("http://example.com/b", &url));
    }

    #[test]
    fn exact_respects_case_flag() {
        let r = rule("http://Example.com/A", MatchType::Exact).case_sensitive();
        assert!(matches("http://Example.com/A", &r));
        assert!(!matches("http://example.com/a", &r));

        let r = rule("http://Example.com/A", MatchType::Exact);
        assert!(matches("http://example.com/a", &r));
    }

    #[test]
    fn contains_checks_raw_input() {
        let r = rule("casino", MatchType::Contains);
        assert!(matches("https://best-CASINO.test/play", &r));
        assert!(matches("http://x.test/?q=casino", &r));
        assert!(!matches("https://news.test", &r));

        let r = rule("casino", MatchType::Contains).case_sensitive();
        assert!(!matches("https://best-CASINO.test/play", &r));
    }

    #[test]
    fn regex_matches_raw_input() {
        let r = rule(r"^https?://(www\.)?reddit\.com/r/", MatchType::Regex);
        assert!(matches("https://reddit.com/r/rust", &r));
        assert!(matches("HTTP://WWW.REDDIT.COM/r/rust", &r));
        assert!(!matches("https://reddit.com/u/someone", &r));

        let r = rule("^ABC", MatchType::Regex).case_sensitive();
        assert!(!matches("abc.test", &r));
    }

    #[test]
    fn invalid_regex_fails_safe() {
        let r = rule("(unclosed", MatchType::Regex);
        assert!(!matches("(unclosed", &r));
        let err = CompiledRule::new(r).unwrap_err();
        assert_eq!(err.field(), Some("pattern"));
    }

    #[test]
    fn wildcard_is_anchored() {
        let r = rule("*.example.com", MatchType::Wildcard);
        assert!(matches("api.example.com", &r));
        assert!(matches("https://a.b.example.com/x", &r));
        assert!(!matches("example.com", &r));
        assert!(!matches("example.com.evil.test", &r));

        let r = rule("ads?.test", MatchType::Wildcard);
        assert!(matches("ads1.test", &r));
        assert!(!matches("ads12.test", &r));
    }

    #[test]
    fn wildcard_escapes_regex_metacharacters() {
        assert_eq!(wildcard_to_regex("a.b*"), r"^a\.b.*$");
        let r = rule("a+b.test", MatchType::Wildcard);
        assert!(matches("a+b.test", &r));
        assert!(!matches("aab.test", &r));
    }

    #[test]
    fn wildcard_can_match_raw_url() {
        let r = rule("*/watch?v=*", MatchType::Wildcard);
        assert!(matches("https://video.test/watch?v=123", &r));
    }

    #[test]
    fn compiled_rule_ignores_enabled_flag() {
        let compiled = CompiledRule::new(rule("x.test", MatchType::Domain).disabled()).unwrap();
        assert!(compiled.is_match(&MatchInput::new("x.test")));
        assert!(!compiled.rule().enabled);
    }

    #[test]
    fn match_input_exposes_host() {
        let input = MatchInput::new("  https://WWW.Example.com:8080/a ");
        assert_eq!(input.host(), "example.com");
        assert_eq!(input.raw(), "https://WWW.Example.com:8080/a");
    }
}
