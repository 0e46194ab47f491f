//! Glob matching for permission patterns.
//!
//! Permission sets use shell-style globs over vault-relative paths:
//! `*` matches within one path segment, `**` crosses segments, `?` matches
//! a single character. Patterns compile onto anchored regexes once per
//! matcher.

use regex::Regex;

/// A compiled set of glob patterns.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    patterns: Vec<(String, Regex)>,
    match_any: bool,
}

impl PathMatcher {
    pub fn new(patterns: &[String]) -> Self {
        let match_any = patterns
            .iter()
            .any(|p| p == "*" || p == "**" || p.eq_ignore_ascii_case("any"));

        let compiled = patterns
            .iter()
            .filter_map(|pattern| match Regex::new(&glob_to_regex(pattern)) {
                Ok(re) => Some((pattern.clone(), re)),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, "invalid permission glob: {}", e);
                    None
                }
            })
            .collect();

        Self {
            patterns: compiled,
            match_any,
        }
    }

    /// True when the pattern set is the unrestricted wildcard.
    pub fn allows_any(&self) -> bool {
        self.match_any
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.match_any {
            return true;
        }
        let normalized = path.trim_start_matches("./");
        self.patterns.iter().any(|(_, re)| re.is_match(normalized))
    }

    /// The source patterns, for diagnostic display.
    pub fn sources(&self) -> Vec<String> {
        self.patterns.iter().map(|(p, _)| p.clone()).collect()
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` may also match nothing, so `**/foo` covers `foo`.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    out
}
