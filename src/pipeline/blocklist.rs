//! Sender blocklist matching.
//!
//! A pattern may carry one leading and/or one trailing `*`:
//! - `*@evil.com` matches addresses ending with `@evil.com`
//! - `bad@*` matches addresses starting with `bad@`
//! - `*evil*` matches addresses containing `evil`
//! - anything else must match exactly
//!
//! Comparison is case-sensitive.

/// Check one address against one pattern.
pub fn pattern_matches(pattern: &str, address: &str) -> bool {
    let pattern = pattern.trim();
    let address = address.trim();

    let leading = pattern.starts_with('*');
    let rest = if leading { &pattern[1..] } else { pattern };
    let trailing = rest.ends_with('*');
    let literal = if trailing { &rest[..rest.len() - 1] } else { rest };

    match (leading, trailing) {
        (true, true) => address.contains(literal),
        (true, false) => address.ends_with(literal),
        (false, true) => address.starts_with(literal),
        (false, false) => address == literal,
    }
}

/// First pattern matching any of `addresses`.
pub fn first_match<'a>(patterns: &'a [String], addresses: &[String]) -> Option<&'a str> {
    addresses.iter().find_map(|addr| {
        patterns
            .iter()
            .find(|p| pattern_matches(p, addr))
            .map(String::as_str)
    })
}

/// Whether `pattern` is acceptable as a blocklist entry.
pub fn is_valid_pattern(pattern: &str) -> bool {
    let pattern = pattern.trim();
    pattern.len() >= 6 && pattern.contains('@') && pattern.contains('.')
}
