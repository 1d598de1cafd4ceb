use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

// ============================================================================
// Constructs
// ============================================================================

/// An Atom person construct (`<author>` / `<contributor>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl Person {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// An Atom `<link>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl Link {
    pub fn new(rel: &str, href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            rel: Some(rel.to_string()),
            ..Self::default()
        }
    }

    /// Link relation; Atom defaults a missing `rel` to `alternate`.
    pub fn rel(&self) -> &str {
        self.rel.as_deref().unwrap_or("alternate")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Category {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            ..Self::default()
        }
    }
}

/// Entry content: inline text, HTML or XHTML, or an out-of-line reference
/// to a media resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text { value: String },
    Html { value: String },
    Xhtml { value: String },
    #[serde(rename = "out-of-line")]
    OutOfLine { src: String, media_type: String },
}

impl Content {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text {
            value: value.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Text { .. } => "text",
            Self::Html { .. } => "html",
            Self::Xhtml { .. } => "xhtml",
            Self::OutOfLine { media_type, .. } => media_type,
        }
    }
}

// ============================================================================
// Entry
// ============================================================================

/// An Atom entry as carried by AtomPub requests and responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub authors: Vec<Person>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// `app:edited`, maintained by the server on every modification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<Category>,
}

impl Entry {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_author(mut self, name: impl Into<String>) -> Self {
        self.authors.push(Person::new(name));
        self
    }

    pub fn with_updated(mut self, updated: DateTime<Utc>) -> Self {
        self.updated = Some(updated);
        self
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_link(mut self, link: Link) -> Self {
        self.links.push(link);
        self
    }

    /// Last modification instant used for validators: `edited`, else `updated`.
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.edited.or(self.updated)
    }

    pub fn link(&self, rel: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.rel() == rel)
    }

    pub fn edit_link(&self) -> Option<&str> {
        self.link("edit").map(|l| l.href.as_str())
    }

    pub fn edit_media_link(&self) -> Option<&str> {
        self.link("edit-media").map(|l| l.href.as_str())
    }

    /// Replaces every link with the given relation by a single new one.
    pub fn set_link(&mut self, link: Link) {
        let rel = link.rel().to_string();
        self.links.retain(|l| l.rel() != rel);
        self.links.push(link);
    }

    /// Minimal validity for entries submitted by clients: an id, a title, at
    /// least one author, an updated date, and either content or an alternate
    /// link.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let mut missing = Vec::new();
        if self.id.trim().is_empty() {
            missing.push("id");
        }
        if self.title.trim().is_empty() {
            missing.push("title");
        }
        if !self.authors.iter().any(|a| !a.name.trim().is_empty()) {
            missing.push("author");
        }
        if self.updated.is_none() {
            missing.push("updated");
        }
        if self.content.is_none() && self.link("alternate").is_none() {
            missing.push("content or alternate link");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::bad_request(format!(
                "Invalid entry: missing {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minimal() -> Entry {
        Entry::new("urn:test:1", "Hello")
            .with_author("Ada")
            .with_updated(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
            .with_content(Content::text("body"))
    }

    #[test]
    fn test_minimal_entry_is_valid() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn test_alternate_link_replaces_content() {
        let mut entry = minimal();
        entry.content = None;
        assert!(entry.validate().is_err());
        entry.links.push(Link {
            href: "http://example.org/1".into(),
            ..Link::default()
        });
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn test_validate_lists_missing_fields() {
        let err = Entry::default().validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("id"));
        assert!(msg.contains("title"));
        assert!(msg.contains("author"));
        assert!(msg.contains("updated"));
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_set_link_replaces_same_rel() {
        let mut entry = minimal();
        entry.set_link(Link::new("edit", "/a"));
        entry.set_link(Link::new("edit", "/b"));
        assert_eq!(entry.edit_link(), Some("/b"));
        assert_eq!(entry.links.len(), 1);
    }

    #[test]
    fn test_modified_prefers_edited() {
        let mut entry = minimal();
        assert_eq!(entry.modified(), entry.updated);
        let edited = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        entry.edited = Some(edited);
        assert_eq!(entry.modified(), Some(edited));
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(minimal()).unwrap();
        assert_eq!(json["content"]["type"], "text");
        assert_eq!(json["authors"][0]["name"], "Ada");
        assert!(json.get("links").is_none());

        let back: Entry = serde_json::from_value(json).unwrap();
        assert_eq!(back, minimal());
    }
}
