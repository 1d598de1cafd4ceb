use std::fmt;

/// `Cache-Control` directives applied to outgoing responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub private: bool,
    pub public: bool,
    pub must_revalidate: bool,
    pub no_transform: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
}

impl CacheControl {
    /// Revalidate on every use; pairs with entity tags for cheap 304s.
    pub fn revalidate() -> Self {
        Self {
            no_cache: true,
            ..Self::default()
        }
    }

    pub fn max_age(seconds: u64) -> Self {
        Self {
            max_age: Some(seconds),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Parses a header value. Unknown directives are ignored.
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            let (name, arg) = match directive.split_once('=') {
                Some((n, a)) => (n.trim().to_string(), Some(a.trim().trim_matches('"').to_string())),
                None => (directive.clone(), None),
            };
            let seconds = arg.as_deref().and_then(|a| a.parse::<u64>().ok());
            match name.as_str() {
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "private" => cc.private = true,
                "public" => cc.public = true,
                "must-revalidate" => cc.must_revalidate = true,
                "no-transform" => cc.no_transform = true,
                "max-age" => cc.max_age = seconds,
                "s-maxage" => cc.s_maxage = seconds,
                _ => {}
            }
        }
        cc
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if self.public {
            parts.push("public".into());
        }
        if self.private {
            parts.push("private".into());
        }
        if self.no_cache {
            parts.push("no-cache".into());
        }
        if self.no_store {
            parts.push("no-store".into());
        }
        if self.must_revalidate {
            parts.push("must-revalidate".into());
        }
        if self.no_transform {
            parts.push("no-transform".into());
        }
        if let Some(age) = self.max_age {
            parts.push(format!("max-age={age}"));
        }
        if let Some(age) = self.s_maxage {
            parts.push(format!("s-maxage={age}"));
        }
        f.write_str(&parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_orders_directives() {
        let cc = CacheControl {
            private: true,
            must_revalidate: true,
            max_age: Some(60),
            ..CacheControl::default()
        };
        assert_eq!(cc.to_string(), "private, must-revalidate, max-age=60");
        assert_eq!(CacheControl::revalidate().to_string(), "no-cache");
    }

    #[test]
    fn test_parse_mixed_case_and_unknown() {
        let cc = CacheControl::parse("No-Cache, max-age=\"30\", x-custom, s-maxage=bad");
        assert!(cc.no_cache);
        assert_eq!(cc.max_age, Some(30));
        assert_eq!(cc.s_maxage, None);
        assert!(!cc.no_store);
    }

    #[test]
    fn test_empty() {
        assert!(CacheControl::default().is_empty());
        assert!(!CacheControl::max_age(0).is_empty());
    }
}
