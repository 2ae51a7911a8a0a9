//! File name wildcards and directory ordering

use std::cmp::Ordering;

/// A `*`/`?` wildcard pattern matched against single name components
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    text: String,
    chars: Vec<char>,
    case_sensitive: bool,
}

impl Pattern {
    #[must_use]
    pub fn new(text: &str, case_sensitive: bool) -> Self {
        let chars = text.chars().map(|c| fold(c, case_sensitive)).collect();
        Self {
            text: text.to_string(),
            chars,
            case_sensitive,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn has_wildcards(&self) -> bool {
        self.chars.iter().any(|c| matches!(c, '*' | '?'))
    }

    /// `*` and `*.*` select every name
    #[must_use]
    pub fn matches_all(&self) -> bool {
        matches!(self.text.as_str(), "*" | "*.*")
    }

    #[must_use]
    pub fn is_match(&self, name: &str) -> bool {
        if self.matches_all() {
            return true;
        }
        let name: Vec<char> = name.chars().map(|c| fold(c, self.case_sensitive)).collect();
        let pat = &self.chars;

        // greedy match with a single backtrack point for the last `*`
        let (mut p, mut n) = (0, 0);
        let mut star: Option<(usize, usize)> = None;
        while n < name.len() {
            if p < pat.len() && (pat[p] == '?' || pat[p] == name[n]) {
                p += 1;
                n += 1;
            } else if p < pat.len() && pat[p] == '*' {
                star = Some((p, n));
                p += 1;
            } else if let Some((sp, sn)) = star {
                p = sp + 1;
                n = sn + 1;
                star = Some((sp, sn + 1));
            } else {
                return false;
            }
        }
        pat[p..].iter().all(|c| *c == '*')
    }
}

fn fold(c: char, case_sensitive: bool) -> char {
    if case_sensitive {
        return c;
    }
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => u,
        _ => c,
    }
}

/// Order of names within a directory listing.
///
/// `.` and `..` come first, then names compare by code point (after case
/// folding unless `case_sensitive`).
#[must_use]
pub fn dir_order(a: &str, b: &str, case_sensitive: bool) -> Ordering {
    let rank = |s: &str| match s {
        "." => 0,
        ".." => 1,
        _ => 2,
    };
    rank(a).cmp(&rank(b)).then_with(|| {
        a.chars()
            .map(|c| fold(c, case_sensitive))
            .cmp(b.chars().map(|c| fold(c, case_sensitive)))
    })
}
