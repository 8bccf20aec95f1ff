//! Backslash escaping for names embedded in segment keys.
//!
//! Measurements, tag keys, tag values, field names and predicate operands
//! are written into a key with every structural character preceded by `\`.
//! Splitting a key then only has to look at unescaped delimiters, so any
//! name survives a render/parse cycle.

use std::borrow::Cow;

/// Characters that delimit something in a segment key.
pub const KEY_SPECIALS: &[char] = &['\\', '.', ',', '=', '(', ')', '{', '}', '#', ' '];

/// Escape every character of `s` found in [`KEY_SPECIALS`].
pub fn escape(s: &str) -> Cow<'_, str> {
    if !s.contains(KEY_SPECIALS) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 4);
    for c in s.chars() {
        if KEY_SPECIALS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    Cow::Owned(out)
}

/// Reverse [`escape`]. Returns `None` for a dangling backslash or a special
/// character that was left unescaped.
pub fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            c if KEY_SPECIALS.contains(&c) => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

/// Byte offset of the first unescaped occurrence of `pat` in `s`.
pub fn find_unescaped(s: &str, pat: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i..].starts_with(pat.as_bytes()) {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Split `s` at every unescaped occurrence of `pat`.
pub fn split_unescaped<'a>(s: &'a str, pat: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(idx) = find_unescaped(rest, pat) {
        parts.push(&rest[..idx]);
        rest = &rest[idx + pat.len()..];
    }
    parts.push(rest);
    parts
}

/// Split `s` at the first unescaped occurrence of `pat`.
pub fn split_once_unescaped<'a>(s: &'a str, pat: &str) -> Option<(&'a str, &'a str)> {
    let idx = find_unescaped(s, pat)?;
    Some((&s[..idx], &s[idx + pat.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_are_borrowed() {
        assert!(matches!(escape("usage_user"), Cow::Borrowed("usage_user")));
    }

    #[test]
    fn escape_then_unescape() {
        for name in ["system.cpu", "/a,b", "a=b", "x)(y", "{}#", "web server", "back\\slash"] {
            let escaped = escape(name);
            assert_eq!(unescape(&escaped).as_deref(), Some(name), "{escaped}");
        }
    }

    #[test]
    fn raw_specials_are_rejected() {
        assert_eq!(unescape("a.b"), None);
        assert_eq!(unescape("dangling\\"), None);
    }

    #[test]
    fn splitting_skips_escaped_delimiters() {
        assert_eq!(split_unescaped(r"a\,b,c", ","), vec![r"a\,b", "c"]);
        assert_eq!(split_unescaped(r"a\\,b", ","), vec![r"a\\", "b"]);
        assert_eq!(split_once_unescaped(r"sys\.cpu.host=a", "."), Some((r"sys\.cpu", "host=a")));
        assert_eq!(find_unescaped(r"\)(", ")("), None);
    }
}
