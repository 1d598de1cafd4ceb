use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The kind of resource a request path addresses.
///
/// The core AtomPub kinds are fixed variants; deployments may add their own
/// through [`ResourceType::Other`]. Equality is by name, so
/// `"entry".parse::<ResourceType>()` is always [`ResourceType::Entry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Service,
    Collection,
    Entry,
    EntryEdit,
    Media,
    MediaEdit,
    Categories,
    Unknown,
    Other(Arc<str>),
}

impl ResourceType {
    pub fn name(&self) -> &str {
        match self {
            Self::Service => "service",
            Self::Collection => "collection",
            Self::Entry => "entry",
            Self::EntryEdit => "entry-edit",
            Self::Media => "media",
            Self::MediaEdit => "media-edit",
            Self::Categories => "categories",
            Self::Unknown => "unknown",
            Self::Other(name) => name,
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, Self::Entry | Self::EntryEdit)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourceType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase().replace('_', "-");
        Ok(match lower.as_str() {
            "service" => Self::Service,
            "collection" => Self::Collection,
            "entry" => Self::Entry,
            "entry-edit" => Self::EntryEdit,
            "media" => Self::Media,
            "media-edit" => Self::MediaEdit,
            "categories" => Self::Categories,
            "unknown" => Self::Unknown,
            _ => Self::Other(Arc::from(lower)),
        })
    }
}

/// A resolved request target: what the path addresses plus the captured
/// path parameters, in capture order.
///
/// Built once by a resolver and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    resource_type: ResourceType,
    params: Vec<(String, String)>,
    pattern: Arc<str>,
}

impl Target {
    pub fn new(
        resource_type: ResourceType,
        params: Vec<(String, String)>,
        pattern: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            resource_type,
            params,
            pattern: pattern.into(),
        }
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    /// Source of the route that matched.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Captured values in capture order.
    pub fn param_values(&self) -> Vec<&str> {
        self.params.iter().map(|(_, v)| v.as_str()).collect()
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// The `collection` parameter, falling back to the first capture.
    pub fn collection(&self) -> Option<&str> {
        self.param("collection")
            .or_else(|| self.params.first().map(|(_, v)| v.as_str()))
    }

    /// The `entry` parameter, falling back to the second capture.
    pub fn entry(&self) -> Option<&str> {
        self.param("entry")
            .or_else(|| self.params.get(1).map(|(_, v)| v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_parse_known_names() {
        assert_eq!("ENTRY".parse::<ResourceType>().unwrap(), ResourceType::Entry);
        assert_eq!(
            "media_edit".parse::<ResourceType>().unwrap(),
            ResourceType::MediaEdit
        );
        assert_eq!(
            "opensearch".parse::<ResourceType>().unwrap(),
            ResourceType::Other(Arc::from("opensearch"))
        );
    }

    #[test]
    fn test_other_compares_by_name() {
        let a = ResourceType::Other(Arc::from("search"));
        let b: ResourceType = "search".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "search");
    }

    #[test]
    fn test_target_param_fallbacks() {
        let target = Target::new(
            ResourceType::Entry,
            vec![
                ("name".to_string(), "blog".to_string()),
                ("id".to_string(), "42".to_string()),
            ],
            "/feeds/:name/:id",
        );
        assert_eq!(target.collection(), Some("blog"));
        assert_eq!(target.entry(), Some("42"));
        assert_eq!(target.param_values(), vec!["blog", "42"]);

        let named = Target::new(
            ResourceType::Entry,
            vec![
                ("entry".to_string(), "7".to_string()),
                ("collection".to_string(), "news".to_string()),
            ],
            "custom",
        );
        assert_eq!(named.collection(), Some("news"));
        assert_eq!(named.entry(), Some("7"));
    }
}
