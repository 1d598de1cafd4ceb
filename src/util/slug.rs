use std::borrow::Cow;

use percent_encoding::percent_decode_str;

/// Longest path segment produced by [`slugify`].
pub const MAX_SLUG_LENGTH: usize = 64;

/// Decodes an AtomPub `Slug` header value.
///
/// The header is percent-encoded UTF-8 (RFC 5023 §9.7). Invalid sequences are
/// replaced lossily and control characters are dropped.
pub fn decode_slug(raw: &str) -> String {
    let decoded = percent_decode_str(raw.trim()).decode_utf8_lossy();
    strip_control_chars(&decoded).trim().to_string()
}

/// Removes C0 control characters and DEL. Borrows when nothing needs removing.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(char::is_control) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|c| !c.is_control()).collect())
}

/// Reduces free text to a lowercase ASCII path segment: alphanumerics kept,
/// every other run collapsed to a single `-`, trimmed and length-capped.
///
/// Returns `None` when nothing usable remains.
///
/// ```
/// use abdera::util::slugify;
///
/// assert_eq!(slugify("Hello, World!").as_deref(), Some("hello-world"));
/// assert_eq!(slugify("  ***  "), None);
/// ```
pub fn slugify(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len().min(MAX_SLUG_LENGTH));
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
            if out.len() >= MAX_SLUG_LENGTH {
                break;
            }
        } else {
            pending_dash = true;
        }
    }
    let out = out.trim_end_matches('-');
    (!out.is_empty()).then(|| out.to_string())
}
