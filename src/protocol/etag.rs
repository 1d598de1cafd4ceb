//! Entity tags: parsing, formatting, generation and the RFC 7232 match relation.
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;

/// An entity tag, or the `*` wildcard used in `If-Match` / `If-None-Match`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityTag {
    Tag { value: String, weak: bool },
    Any,
}

impl EntityTag {
    pub fn strong(value: impl Into<String>) -> Self {
        Self::Tag {
            value: value.into(),
            weak: false,
        }
    }

    pub fn weak(value: impl Into<String>) -> Self {
        Self::Tag {
            value: value.into(),
            weak: true,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Any)
    }

    pub fn is_weak(&self) -> bool {
        matches!(self, Self::Tag { weak: true, .. })
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Tag { value, .. } => value,
            Self::Any => "*",
        }
    }

    /// Deterministic strong tag over an ordered list of components.
    ///
    /// Components are length-prefixed before hashing so `["ab", "c"]` and
    /// `["a", "bc"]` never collide.
    pub fn generate<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hasher = Sha256::new();
        for part in components {
            let part = part.as_ref();
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Self::strong(format!("{:x}", hasher.finalize()))
    }

    /// Tag for an entry derived from its id and last update.
    pub fn for_entry(id: &str, updated: &DateTime<Utc>) -> Self {
        let stamp = updated.to_rfc3339();
        Self::generate([id, stamp.as_str()])
    }

    /// Parses a single tag: `"abc"`, `W/"abc"` or `*`.
    ///
    /// Unquoted values are tolerated and treated as strong tags, since some
    /// clients omit the quotes.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if input == "*" {
            return Some(Self::Any);
        }
        let (weak, rest) = match input.strip_prefix("W/").or_else(|| input.strip_prefix("w/")) {
            Some(rest) => (true, rest),
            None => (false, input),
        };
        let value = match rest.strip_prefix('"') {
            Some(inner) => inner.strip_suffix('"')?,
            None => rest,
        };
        if value.contains('"') {
            return None;
        }
        Some(Self::Tag {
            value: value.to_string(),
            weak,
        })
    }

    /// Parses a comma-separated header value. Commas inside quotes do not
    /// split; malformed members are skipped.
    pub fn parse_list(input: &str) -> Vec<Self> {
        let mut tags = Vec::new();
        let mut start = 0;
        let mut quoted = false;
        for (i, c) in input.char_indices() {
            match c {
                '"' => quoted = !quoted,
                ',' if !quoted => {
                    tags.extend(Self::parse(&input[start..i]));
                    start = i + 1;
                }
                _ => {}
            }
        }
        tags.extend(Self::parse(&input[start..]));
        tags
    }

    /// Strong comparison: both tags strong and equal. `*` matches anything.
    pub fn strong_match(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Any, _) | (_, Self::Any) => true,
            (
                Self::Tag { value: a, weak: false },
                Self::Tag { value: b, weak: false },
            ) => a == b,
            _ => false,
        }
    }

    /// Weak comparison: values equal regardless of weakness. `*` matches anything.
    pub fn weak_match(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Tag { value: a, .. }, Self::Tag { value: b, .. }) => a == b,
        }
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Tag { value, weak: true } => write!(f, "W/\"{value}\""),
            Self::Tag { value, weak: false } => write!(f, "\"{value}\""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_forms() {
        assert_eq!(EntityTag::parse("\"abc\""), Some(EntityTag::strong("abc")));
        assert_eq!(EntityTag::parse("W/\"abc\""), Some(EntityTag::weak("abc")));
        assert_eq!(EntityTag::parse(" * "), Some(EntityTag::Any));
        assert_eq!(EntityTag::parse("abc"), Some(EntityTag::strong("abc")));
        assert_eq!(EntityTag::parse(""), None);
        assert_eq!(EntityTag::parse("\"unterminated"), None);
    }

    #[test]
    fn test_parse_list_respects_quotes() {
        let tags = EntityTag::parse_list("\"a,b\", W/\"c\" ,\"d\"");
        assert_eq!(
            tags,
            vec![
                EntityTag::strong("a,b"),
                EntityTag::weak("c"),
                EntityTag::strong("d"),
            ]
        );
        assert!(EntityTag::parse_list("").is_empty());
    }

    #[test]
    fn test_display_round_trip_forms() {
        assert_eq!(EntityTag::strong("x").to_string(), "\"x\"");
        assert_eq!(EntityTag::weak("x").to_string(), "W/\"x\"");
        assert_eq!(EntityTag::Any.to_string(), "*");
    }

    #[test]
    fn test_match_relation() {
        let s = EntityTag::strong("v1");
        let w = EntityTag::weak("v1");
        let other = EntityTag::strong("v2");

        assert!(s.strong_match(&s));
        assert!(!s.strong_match(&w));
        assert!(!w.strong_match(&w));
        assert!(s.weak_match(&w));
        assert!(w.weak_match(&s));
        assert!(!s.weak_match(&other));
        assert!(EntityTag::Any.strong_match(&w));
        assert!(w.weak_match(&EntityTag::Any));
    }

    #[test]
    fn test_generate_is_deterministic_and_unambiguous() {
        let a = EntityTag::generate(["ab", "c"]);
        let b = EntityTag::generate(["ab", "c"]);
        let c = EntityTag::generate(["a", "bc"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_weak());
        assert_eq!(a.value().len(), 64);
    }

    #[test]
    fn test_for_entry_changes_with_update() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        assert_eq!(
            EntityTag::for_entry("urn:x", &t1),
            EntityTag::for_entry("urn:x", &t1)
        );
        assert_ne!(
            EntityTag::for_entry("urn:x", &t1),
            EntityTag::for_entry("urn:x", &t2)
        );
    }
}
