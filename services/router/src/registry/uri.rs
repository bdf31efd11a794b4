//! Route URI keys and lookup candidate generation.
//!
//! A route key is a lowercased hostname with an optional context path:
//! `demo.example.test` or `demo.example.test/api/v1`. Trailing slashes,
//! query strings and ports never take part in matching.

use std::fmt;

/// Normalized URI key of a route pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteUri(String);

impl RouteUri {
    /// Parse a URI as published in a registration message.
    ///
    /// Returns `None` when no usable host remains after normalization.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let without_scheme = trimmed
            .strip_prefix("http://")
            .or_else(|| trimmed.strip_prefix("https://"))
            .unwrap_or(trimmed);

        let (authority, path) = match without_scheme.find('/') {
            Some(idx) => without_scheme.split_at(idx),
            None => (without_scheme, ""),
        };

        let host = if authority.starts_with("*.") {
            let rest = normalize_host(&authority[2..])?;
            format!("*.{rest}")
        } else {
            normalize_host(authority)?
        };

        Some(Self::from_parts(&host, path))
    }

    /// Build a key from an already-normalized host and a raw path.
    pub fn from_parts(host: &str, path: &str) -> Self {
        let path = normalize_path(path);
        if path.is_empty() {
            Self(host.to_string())
        } else {
            Self(format!("{host}{path}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> &str {
        match self.0.find('/') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Context path including its leading slash, or `""`.
    pub fn path(&self) -> &str {
        match self.0.find('/') {
            Some(idx) => &self.0[idx..],
            None => "",
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with("*.")
    }

    /// Keys to try for a request, most specific first.
    ///
    /// Exact host with the full path, then shorter path prefixes of the
    /// same host, then the same walk with the leftmost host label replaced
    /// by `*`.
    pub fn lookup_candidates(host: &str, path: &str) -> Vec<RouteUri> {
        let path = normalize_path(path);
        let prefixes = path_prefixes(&path);

        let mut candidates: Vec<RouteUri> = prefixes
            .iter()
            .map(|p| RouteUri::from_parts(host, p))
            .collect();

        if let Some(wildcard) = wildcard_host(host) {
            candidates.extend(prefixes.iter().map(|p| RouteUri::from_parts(&wildcard, p)));
        }

        candidates
    }
}

impl fmt::Display for RouteUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a hostname (or `Host` header value) for matching.
///
/// - Strip any port
/// - Convert to lowercase
/// - Trim trailing dot
///
/// Returns `None` for empty or syntactically invalid hosts.
pub fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let host = if raw.starts_with('[') {
        // IPv6 literal, optionally followed by :port
        let end = raw.find(']')?;
        let rest = &raw[end + 1..];
        if !rest.is_empty() && !valid_port_suffix(rest) {
            return None;
        }
        &raw[..=end]
    } else {
        match raw.rsplit_once(':') {
            Some((h, port)) if valid_port_suffix(&format!(":{port}")) => h,
            Some(_) => return None,
            None => raw,
        }
    };

    let host = host.to_lowercase();
    let host = host.trim_end_matches('.');
    if host.is_empty() {
        return None;
    }

    let valid = if host.starts_with('[') {
        let literal = &host[1..host.len() - 1];
        !literal.is_empty()
            && literal
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
    } else {
        host.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
            && !host.starts_with('.')
            && !host.contains("..")
    };

    valid.then(|| host.to_string())
}

fn valid_port_suffix(s: &str) -> bool {
    match s.strip_prefix(':') {
        Some(port) => !port.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Strip query/fragment and trailing slashes; lowercase.
fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        return String::new();
    }
    let path = path.to_lowercase();
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

/// `"/a/b/c"` -> `["/a/b/c", "/a/b", "/a", ""]`.
fn path_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = path.to_string();
    loop {
        prefixes.push(current.clone());
        if current.is_empty() {
            break;
        }
        match current.rfind('/') {
            Some(idx) => current.truncate(idx),
            None => current.clear(),
        }
    }
    prefixes
}

fn wildcard_host(host: &str) -> Option<String> {
    if host.starts_with('[') || host.starts_with("*.") {
        return None;
    }
    let (_, rest) = host.split_once('.')?;
    if rest.is_empty() {
        return None;
    }
    Some(format!("*.{rest}"))
}
