use serde::{Deserialize, Serialize};

use super::entry::Category;

/// AtomPub service document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub workspaces: Vec<Workspace>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub title: String,
    pub collections: Vec<CollectionInfo>,
}

/// A collection as advertised in the service document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub title: String,
    pub href: String,
    /// Accepted media ranges; an empty list advertises nothing (read-only).
    pub accept: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories_href: Option<String>,
}

/// AtomPub category document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Categories {
    pub fixed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    pub categories: Vec<Category>,
}
