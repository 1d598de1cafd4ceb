use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{Entry, Link, Person};

/// Hard ceiling on the page size a client may request.
pub const MAX_PAGE_SIZE: usize = 500;

/// A 1-based page of a collection feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: usize,
    pub size: usize,
}

impl Page {
    pub fn new(number: usize, size: usize) -> Self {
        Self {
            number: number.max(1),
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> usize {
        (self.number - 1) * self.size
    }

    /// Reads `page` and `page_size` query parameters, falling back to the
    /// first page of `default_size` when absent or malformed.
    pub fn from_query(query: &[(String, String)], default_size: usize) -> Self {
        let get = |name: &str| {
            query
                .iter()
                .find(|(k, _)| k == name)
                .and_then(|(_, v)| v.parse::<usize>().ok())
        };
        Self::new(get("page").unwrap_or(1), get("page_size").unwrap_or(default_size))
    }
}

/// An Atom feed document: collection metadata plus one page of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: String,
    pub title: String,
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<Person>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Feed {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn link(&self, rel: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.rel() == rel)
    }

    /// Adds `self`, `first` and, where applicable, `previous` / `next` links
    /// for `page` of the collection at `href`.
    pub fn add_paging_links(&mut self, href: &str, page: Page, has_next: bool) {
        let page_href = |n: usize| {
            let sep = if href.contains('?') { '&' } else { '?' };
            format!("{href}{sep}page={n}&page_size={}", page.size)
        };
        self.links.retain(|l| !matches!(l.rel(), "first" | "previous" | "next"));
        if self.link("self").is_none() {
            self.links.push(Link::new("self", href));
        }
        self.links.push(Link::new("first", page_href(1)));
        if page.number > 1 {
            self.links.push(Link::new("previous", page_href(page.number - 1)));
        }
        if has_next {
            self.links.push(Link::new("next", page_href(page.number + 1)));
        }
    }

    /// Latest modification among the feed and its entries.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .filter_map(Entry::modified)
            .chain(self.updated)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_from_query() {
        let q = vec![
            ("page".to_string(), "3".to_string()),
            ("page_size".to_string(), "10".to_string()),
        ];
        let page = Page::from_query(&q, 25);
        assert_eq!(page, Page { number: 3, size: 10 });
        assert_eq!(page.offset(), 20);

        let junk = vec![("page".to_string(), "zero".to_string())];
        assert_eq!(Page::from_query(&junk, 25), Page { number: 1, size: 25 });
        assert_eq!(Page::new(0, 100_000), Page { number: 1, size: MAX_PAGE_SIZE });
    }

    #[test]
    fn test_paging_links() {
        let mut feed = Feed::new("urn:f", "F");
        feed.add_paging_links("/atom/blog", Page::new(2, 5), true);
        assert_eq!(feed.link("self").map(|l| l.href.as_str()), Some("/atom/blog"));
        assert_eq!(
            feed.link("previous").map(|l| l.href.as_str()),
            Some("/atom/blog?page=1&page_size=5")
        );
        assert_eq!(
            feed.link("next").map(|l| l.href.as_str()),
            Some("/atom/blog?page=3&page_size=5")
        );

        feed.add_paging_links("/atom/blog", Page::new(1, 5), false);
        assert!(feed.link("previous").is_none());
        assert!(feed.link("next").is_none());
        assert_eq!(feed.links.iter().filter(|l| l.rel() == "self").count(), 1);
    }
}
