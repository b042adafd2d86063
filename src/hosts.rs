//! Source host allow-list
//!
//! Patterns are shell-style globs over the whole hostname: `*` matches any
//! run of characters (dots included) and `?` matches exactly one. Matching
//! is case-insensitive. An empty list allows nothing.

/// Compiled form of one allow-list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMatcher {
    /// `*`
    Any,
    /// No wildcards
    Exact(String),
    /// Anything else
    Glob(Vec<GlobToken>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobToken {
    Literal(char),
    /// `?`
    One,
    /// `*`
    Many,
}

impl HostMatcher {
    pub fn compile(pattern: &str) -> Self {
        let pattern = pattern.trim().to_ascii_lowercase();

        if !pattern.is_empty() && pattern.chars().all(|c| c == '*') {
            return Self::Any;
        }
        if !pattern.contains(['*', '?']) {
            return Self::Exact(pattern);
        }

        let mut tokens = Vec::with_capacity(pattern.len());
        for c in pattern.chars() {
            let token = match c {
                '*' => GlobToken::Many,
                '?' => GlobToken::One,
                other => GlobToken::Literal(other),
            };
            // Consecutive stars are one star
            if token == GlobToken::Many && tokens.last() == Some(&GlobToken::Many) {
                continue;
            }
            tokens.push(token);
        }
        Self::Glob(tokens)
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => !expected.is_empty() && expected == &host.to_ascii_lowercase(),
            Self::Glob(tokens) => {
                let host: Vec<char> = host.to_ascii_lowercase().chars().collect();
                glob_match(tokens, &host)
            }
        }
    }
}

/// Iterative wildcard match with single-star backtracking
fn glob_match(tokens: &[GlobToken], text: &[char]) -> bool {
    let (mut t, mut s) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while s < text.len() {
        match tokens.get(t) {
            Some(GlobToken::Literal(c)) if *c == text[s] => {
                t += 1;
                s += 1;
            }
            Some(GlobToken::One) => {
                t += 1;
                s += 1;
            }
            Some(GlobToken::Many) => {
                star = Some((t, s));
                t += 1;
            }
            _ => match star {
                Some((star_t, star_s)) => {
                    t = star_t + 1;
                    s = star_s + 1;
                    star = Some((star_t, star_s + 1));
                }
                None => return false,
            },
        }
    }

    tokens[t..].iter().all(|token| *token == GlobToken::Many)
}

/// Hostnames images may be fetched from
#[derive(Debug, Clone, Default)]
pub struct HostPolicy {
    matchers: Vec<HostMatcher>,
}

impl HostPolicy {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            matchers: patterns
                .into_iter()
                .map(|p| HostMatcher::compile(p.as_ref()))
                .collect(),
        }
    }

    /// Whether `hostname` matches any allow-list entry
    ///
    /// An empty hostname is never allowed.
    pub fn allowed(&self, hostname: &str) -> bool {
        if hostname.is_empty() {
            return false;
        }
        self.matchers.iter().any(|m| m.matches(hostname))
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}
