//! Subject tokens and filter matching
//!
//! Subjects are dot-separated token lists. Filters may use `*` (exactly one
//! token) and `>` (one or more trailing tokens). Consumers with multiple
//! filters must not overlap, so overlap detection lives here too.

pub const TOKEN_SEPARATOR: char = '.';
pub const WILDCARD_ONE: &str = "*";
pub const WILDCARD_TAIL: &str = ">";

/// A subject is valid when it has at least one token and no empty tokens.
pub fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty() && subject.split(TOKEN_SEPARATOR).all(|t| !t.is_empty())
}

/// Valid subject where `>` only appears as the final token.
pub fn is_valid_filter(filter: &str) -> bool {
    if !is_valid_subject(filter) {
        return false;
    }
    let tokens: Vec<&str> = filter.split(TOKEN_SEPARATOR).collect();
    tokens
        .iter()
        .enumerate()
        .all(|(i, t)| *t != WILDCARD_TAIL || i == tokens.len() - 1)
}

pub fn has_wildcards(subject: &str) -> bool {
    subject
        .split(TOKEN_SEPARATOR)
        .any(|t| t == WILDCARD_ONE || t == WILDCARD_TAIL)
}

/// Literal subject: valid and wildcard-free. Delivery targets must be literal.
pub fn is_literal_subject(subject: &str) -> bool {
    is_valid_subject(subject) && !has_wildcards(subject)
}

/// Token-wise match of a literal subject against a filter.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut ft = filter.split(TOKEN_SEPARATOR);
    let mut st = subject.split(TOKEN_SEPARATOR);
    loop {
        match (ft.next(), st.next()) {
            (Some(WILDCARD_TAIL), Some(_)) => return true,
            (Some(f), Some(s)) => {
                if f != WILDCARD_ONE && f != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether two filters can both match some subject.
///
/// Token-wise: positions agree when equal or either side is `*`; a `>` on
/// either side swallows the rest as long as the other side still has tokens.
pub fn subjects_overlap(a: &str, b: &str) -> bool {
    let at: Vec<&str> = a.split(TOKEN_SEPARATOR).collect();
    let bt: Vec<&str> = b.split(TOKEN_SEPARATOR).collect();
    let mut i = 0;
    loop {
        match (at.get(i), bt.get(i)) {
            (Some(&WILDCARD_TAIL), Some(_)) | (Some(_), Some(&WILDCARD_TAIL)) => return true,
            (Some(&x), Some(&y)) => {
                if x != y && x != WILDCARD_ONE && y != WILDCARD_ONE {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
        i += 1;
    }
}
