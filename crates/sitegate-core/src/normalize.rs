//! Domain normalization.
//!
//! Reduces an arbitrary URL or host string to the canonical hostname used
//! for rule comparison: lowercase, no scheme, no credentials, no port, no
//! path/query/fragment, no leading `www.` and no trailing dot.

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches a URL scheme prefix such as `http://` or `chrome-extension://`.
static SCHEME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9+.\-]*://").expect("scheme regex is valid")
});

/// Normalizes a URL or host into a canonical hostname.
///
/// Never fails. When stripping would leave nothing (e.g. `"http://"`), the
/// trimmed lowercase input is returned instead, so the result is only empty
/// for empty input.
///
/// # Examples
///
/// ```
/// use sitegate_core::normalize::normalize;
///
/// assert_eq!(normalize("https://WWW.Example.com:8443/a?b=c"), "example.com");
/// assert_eq!(normalize("sub.example.com"), "sub.example.com");
/// assert_eq!(normalize("user:pw@host.test:80/x"), "host.test");
/// ```
pub fn normalize(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    if lowered.is_empty() {
        return lowered;
    }

    let host = extract_host(&lowered);
    if host.is_empty() {
        lowered
    } else {
        host.to_string()
    }
}

/// Strips everything around the host portion of an already-lowercased input.
fn extract_host(lowered: &str) -> &str {
    let mut rest = match SCHEME_RE.find(lowered) {
        Some(m) => &lowered[m.end()..],
        None => lowered,
    };

    // Path, query and fragment.
    if let Some(end) = rest.find(['/', '?', '#']) {
        rest = &rest[..end];
    }

    // Credentials.
    if let Some(at) = rest.rfind('@') {
        rest = &rest[at + 1..];
    }

    rest = strip_port(rest);
    rest = rest.trim_end_matches('.');

    while let Some(stripped) = rest.strip_prefix("www.") {
        rest = stripped;
    }

    rest
}

/// Removes a trailing `:port`, leaving IPv6 literals intact.
fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        // [::1]:8080 keeps the bracketed literal.
        return match authority.find(']') {
            Some(close) => &authority[..=close],
            None => authority,
        };
    }

    match authority.matches(':').count() {
        1 => authority.split(':').next().unwrap_or(authority),
        // Zero colons, or a bare IPv6 literal.
        _ => authority,
    }
}

/// Returns true if `host` equals `domain` or is a subdomain of it.
///
/// Both arguments are expected to be normalized already.
pub fn is_same_or_subdomain(host: &str, domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}
