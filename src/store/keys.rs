//! Namespaced key construction.
//!
//! Keys are `:`-joined segments under a root namespace, e.g.
//! `ttn:v3:ns:uid:app.dev`.

/// Key segment separator.
pub const SEPARATOR: char = ':';

/// Join key segments with the separator.
pub fn join<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            key.push(SEPARATOR);
        }
        key.push_str(part.as_ref());
    }
    key
}

/// A key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    root: String,
}

impl Namespace {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Key for `parts` under this namespace.
    pub fn key(&self, parts: &[&str]) -> String {
        join(std::iter::once(self.root.as_str()).chain(parts.iter().copied()))
    }

    /// Child namespace.
    pub fn sub(&self, segment: &str) -> Namespace {
        Namespace::new(self.key(&[segment]))
    }

    /// Glob matching every key under this namespace.
    pub fn pattern(&self, suffix: &str) -> String {
        format!("{}{}{}", escape_glob(&self.root), SEPARATOR, suffix)
    }

    /// Strip `<root>:` from `key`.
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.root.as_str())?
            .strip_prefix(SEPARATOR)
    }
}

/// The two sibling keys backing a mutex or deduplication window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    /// Holds the current owner (or an empty marker).
    pub lock: String,
    /// Handoff list or accumulated values.
    pub list: String,
}

impl LockKeys {
    pub fn for_key(key: &str) -> Self {
        Self {
            lock: join([key, "lock"]),
            list: join([key, "list"]),
        }
    }
}

/// Escape glob metacharacters so `s` matches literally in SCAN patterns.
pub fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Match `s` against a Redis-style glob (`*`, `?`, `[...]`, `\` escapes).
pub fn glob_match(pattern: &str, s: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = s.chars().collect();
    glob_match_at(&p, &s)
}

fn glob_match_at(p: &[char], s: &[char]) -> bool {
    match p.first() {
        None => s.is_empty(),
        Some('*') => {
            let rest = &p[1..];
            (0..=s.len()).any(|i| glob_match_at(rest, &s[i..]))
        }
        Some('?') => !s.is_empty() && glob_match_at(&p[1..], &s[1..]),
        Some('[') => {
            let Some(&c) = s.first() else {
                return false;
            };
            let Some(end) = p.iter().skip(1).position(|&x| x == ']') else {
                return c == '[' && glob_match_at(&p[1..], &s[1..]);
            };
            let class = &p[1..=end];
            let (negate, class) = match class.first() {
                Some('^') => (true, &class[1..]),
                _ => (false, class),
            };
            let mut hit = false;
            let mut i = 0;
            while i < class.len() {
                if i + 2 < class.len() && class[i + 1] == '-' {
                    hit |= class[i] <= c && c <= class[i + 2];
                    i += 3;
                } else {
                    hit |= class[i] == c;
                    i += 1;
                }
            }
            hit != negate && glob_match_at(&p[end + 2..], &s[1..])
        }
        Some('\\') if p.len() > 1 => {
            s.first() == Some(&p[1]) && glob_match_at(&p[2..], &s[1..])
        }
        Some(&c) => s.first() == Some(&c) && glob_match_at(&p[1..], &s[1..]),
    }
}
