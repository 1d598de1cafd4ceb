//! Atom and AtomPub XML codec.
//!
//! Documents are written with the quick-xml event writer. Incoming entries
//! are read with the streaming reader: element names are matched on their
//! local part so any namespace prefix is accepted, nesting depth is capped,
//! and DOCTYPE declarations are rejected outright. quick-xml (0.37) never
//! expands custom entities; only the five XML builtins are resolved.
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use thiserror::Error;

use super::entry::{Category, Content, Entry, Link, Person};
use super::feed::Feed;
use super::service::{Categories, Service};

pub const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
pub const APP_NS: &str = "http://www.w3.org/2007/app";

/// Maximum element nesting accepted in an incoming entry.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    Parse(String),

    #[error("Invalid Atom document: {0}")]
    Invalid(String),

    #[error("XML write error: {0}")]
    Write(String),
}

fn parse_err(err: impl std::fmt::Display) -> XmlError {
    XmlError::Parse(err.to_string())
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_date(element: &str, value: &str) -> Result<DateTime<Utc>, XmlError> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| XmlError::Invalid(format!("<{element}> is not an RFC 3339 date: {value}")))
}

// ============================================================================
// Writer
// ============================================================================

struct AtomWriter {
    inner: Writer<Cursor<Vec<u8>>>,
}

impl AtomWriter {
    fn new() -> Result<Self, XmlError> {
        let mut w = Self {
            inner: Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2),
        };
        w.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        Ok(w)
    }

    fn event(&mut self, event: Event<'_>) -> Result<(), XmlError> {
        self.inner
            .write_event(event)
            .map_err(|e| XmlError::Write(e.to_string()))
    }

    fn start(&mut self, element: BytesStart<'_>) -> Result<(), XmlError> {
        self.event(Event::Start(element))
    }

    fn end(&mut self, name: &str) -> Result<(), XmlError> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn empty(&mut self, element: BytesStart<'_>) -> Result<(), XmlError> {
        self.event(Event::Empty(element))
    }

    fn text_element(&mut self, name: &str, text: &str) -> Result<(), XmlError> {
        self.start(BytesStart::new(name))?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    fn finish(self) -> Result<String, XmlError> {
        String::from_utf8(self.inner.into_inner().into_inner())
            .map_err(|e| XmlError::Write(e.to_string()))
    }

    fn person(&mut self, element: &str, person: &Person) -> Result<(), XmlError> {
        self.start(BytesStart::new(element))?;
        self.text_element("name", &person.name)?;
        if let Some(email) = &person.email {
            self.text_element("email", email)?;
        }
        if let Some(uri) = &person.uri {
            self.text_element("uri", uri)?;
        }
        self.end(element)
    }

    fn link(&mut self, link: &Link) -> Result<(), XmlError> {
        let mut el = BytesStart::new("link");
        el.push_attribute(("href", link.href.as_str()));
        if let Some(rel) = &link.rel {
            el.push_attribute(("rel", rel.as_str()));
        }
        if let Some(media_type) = &link.media_type {
            el.push_attribute(("type", media_type.as_str()));
        }
        if let Some(title) = &link.title {
            el.push_attribute(("title", title.as_str()));
        }
        let length = link.length.map(|l| l.to_string());
        if let Some(length) = &length {
            el.push_attribute(("length", length.as_str()));
        }
        self.empty(el)
    }

    fn category(&mut self, name: &str, category: &Category) -> Result<(), XmlError> {
        let mut el = BytesStart::new(name);
        el.push_attribute(("term", category.term.as_str()));
        if let Some(scheme) = &category.scheme {
            el.push_attribute(("scheme", scheme.as_str()));
        }
        if let Some(label) = &category.label {
            el.push_attribute(("label", label.as_str()));
        }
        self.empty(el)
    }

    fn content(&mut self, content: &Content) -> Result<(), XmlError> {
        let mut el = BytesStart::new("content");
        match content {
            Content::Text { value } | Content::Html { value } => {
                el.push_attribute(("type", content.kind()));
                self.start(el)?;
                self.event(Event::Text(BytesText::new(value)))?;
                self.end("content")
            }
            Content::Xhtml { value } => {
                el.push_attribute(("type", "xhtml"));
                self.start(el)?;
                // Stored xhtml is already well-formed markup.
                self.event(Event::Text(BytesText::from_escaped(value.as_str())))?;
                self.end("content")
            }
            Content::OutOfLine { src, media_type } => {
                el.push_attribute(("type", media_type.as_str()));
                el.push_attribute(("src", src.as_str()));
                self.empty(el)
            }
        }
    }

    fn entry(&mut self, entry: &Entry, standalone: bool) -> Result<(), XmlError> {
        let mut root = BytesStart::new("entry");
        if standalone {
            root.push_attribute(("xmlns", ATOM_NS));
            root.push_attribute(("xmlns:app", APP_NS));
        }
        self.start(root)?;
        self.text_element("id", &entry.id)?;
        self.text_element("title", &entry.title)?;
        if let Some(updated) = &entry.updated {
            self.text_element("updated", &format_date(updated))?;
        }
        if let Some(published) = &entry.published {
            self.text_element("published", &format_date(published))?;
        }
        if let Some(edited) = &entry.edited {
            self.text_element("app:edited", &format_date(edited))?;
        }
        for author in &entry.authors {
            self.person("author", author)?;
        }
        if let Some(summary) = &entry.summary {
            self.text_element("summary", summary)?;
        }
        if let Some(content) = &entry.content {
            self.content(content)?;
        }
        for link in &entry.links {
            self.link(link)?;
        }
        for category in &entry.categories {
            self.category("category", category)?;
        }
        self.end("entry")
    }
}

pub fn write_entry(entry: &Entry) -> Result<String, XmlError> {
    let mut w = AtomWriter::new()?;
    w.entry(entry, true)?;
    w.finish()
}

pub fn write_feed(feed: &Feed) -> Result<String, XmlError> {
    let mut w = AtomWriter::new()?;
    let mut root = BytesStart::new("feed");
    root.push_attribute(("xmlns", ATOM_NS));
    root.push_attribute(("xmlns:app", APP_NS));
    w.start(root)?;
    w.text_element("id", &feed.id)?;
    w.text_element("title", &feed.title)?;
    if let Some(updated) = feed.updated.or_else(|| feed.last_modified()) {
        w.text_element("updated", &format_date(&updated))?;
    }
    for author in &feed.authors {
        w.person("author", author)?;
    }
    for link in &feed.links {
        w.link(link)?;
    }
    for entry in &feed.entries {
        w.entry(entry, false)?;
    }
    w.end("feed")?;
    w.finish()
}

pub fn write_service(service: &Service) -> Result<String, XmlError> {
    let mut w = AtomWriter::new()?;
    let mut root = BytesStart::new("service");
    root.push_attribute(("xmlns", APP_NS));
    root.push_attribute(("xmlns:atom", ATOM_NS));
    w.start(root)?;
    for workspace in &service.workspaces {
        w.start(BytesStart::new("workspace"))?;
        w.text_element("atom:title", &workspace.title)?;
        for collection in &workspace.collections {
            let mut el = BytesStart::new("collection");
            el.push_attribute(("href", collection.href.as_str()));
            w.start(el)?;
            w.text_element("atom:title", &collection.title)?;
            if collection.accept.is_empty() {
                w.empty(BytesStart::new("accept"))?;
            }
            for accept in &collection.accept {
                w.text_element("accept", accept)?;
            }
            if let Some(href) = &collection.categories_href {
                let mut cats = BytesStart::new("categories");
                cats.push_attribute(("href", href.as_str()));
                w.empty(cats)?;
            }
            w.end("collection")?;
        }
        w.end("workspace")?;
    }
    w.end("service")?;
    w.finish()
}

pub fn write_categories(categories: &Categories) -> Result<String, XmlError> {
    let mut w = AtomWriter::new()?;
    let mut root = BytesStart::new("app:categories");
    root.push_attribute(("xmlns:app", APP_NS));
    root.push_attribute(("xmlns:atom", ATOM_NS));
    root.push_attribute(("fixed", if categories.fixed { "yes" } else { "no" }));
    if let Some(scheme) = &categories.scheme {
        root.push_attribute(("scheme", scheme.as_str()));
    }
    w.start(root)?;
    for category in &categories.categories {
        w.category("atom:category", category)?;
    }
    w.end("app:categories")?;
    w.finish()
}

// ============================================================================
// Reader
// ============================================================================

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Decoded attributes keyed by local name. Malformed attributes are skipped.
fn attributes(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Vec<(String, String)>, XmlError> {
    let mut out = Vec::new();
    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed attribute");
                continue;
            }
        };
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(parse_err)?;
        out.push((key, value.into_owned()));
    }
    Ok(out)
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn link_from(attrs: &[(String, String)]) -> Link {
    Link {
        href: attr(attrs, "href").unwrap_or_default().to_string(),
        rel: attr(attrs, "rel").map(str::to_string),
        media_type: attr(attrs, "type").map(str::to_string),
        title: attr(attrs, "title").map(str::to_string),
        length: attr(attrs, "length").and_then(|l| l.parse().ok()),
    }
}

fn category_from(attrs: &[(String, String)]) -> Category {
    Category {
        term: attr(attrs, "term").unwrap_or_default().to_string(),
        scheme: attr(attrs, "scheme").map(str::to_string),
        label: attr(attrs, "label").map(str::to_string),
    }
}

fn content_from(kind: &str, src: Option<String>, value: String) -> Content {
    match (kind, src) {
        (kind, Some(src)) => Content::OutOfLine {
            src,
            media_type: kind.to_string(),
        },
        ("html", None) => Content::Html { value },
        ("xhtml", None) => Content::Xhtml { value },
        _ => Content::Text { value },
    }
}

/// Parses a standalone `<entry>` document.
pub fn parse_entry(input: &[u8]) -> Result<Entry, XmlError> {
    let source = std::str::from_utf8(input).map_err(parse_err)?;
    let mut reader = Reader::from_str(source);
    reader.config_mut().trim_text(true);

    let mut entry = Entry::default();
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut author: Option<Person> = None;
    // (type, src) of an open <content> element
    let mut content: Option<(String, Option<String>)> = None;
    let mut complete = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                if path.is_empty() && name != "entry" {
                    return Err(XmlError::Invalid(format!("expected <entry>, found <{name}>")));
                }
                path.push(name.clone());
                if path.len() > MAX_DEPTH {
                    return Err(XmlError::MaxDepthExceeded(MAX_DEPTH));
                }
                text.clear();
                if path.len() != 2 {
                    continue;
                }
                match name.as_str() {
                    "author" => author = Some(Person::default()),
                    "link" => entry.links.push(link_from(&attributes(&e, &reader)?)),
                    "category" => entry.categories.push(category_from(&attributes(&e, &reader)?)),
                    "content" => {
                        let attrs = attributes(&e, &reader)?;
                        let kind = attr(&attrs, "type").unwrap_or("text").to_string();
                        if kind == "xhtml" {
                            let raw = reader.read_text(e.name()).map_err(parse_err)?;
                            entry.content = Some(Content::Xhtml {
                                value: raw.trim().to_string(),
                            });
                            path.pop();
                        } else {
                            content = Some((kind, attr(&attrs, "src").map(str::to_string)));
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(&e);
                if path.is_empty() {
                    if name != "entry" {
                        return Err(XmlError::Invalid(format!("expected <entry>, found <{name}>")));
                    }
                    complete = true;
                    break;
                }
                if path.len() != 1 {
                    continue;
                }
                match name.as_str() {
                    "link" => entry.links.push(link_from(&attributes(&e, &reader)?)),
                    "category" => entry.categories.push(category_from(&attributes(&e, &reader)?)),
                    "content" => {
                        let attrs = attributes(&e, &reader)?;
                        let kind = attr(&attrs, "type").unwrap_or("text");
                        entry.content = Some(content_from(
                            kind,
                            attr(&attrs, "src").map(str::to_string),
                            String::new(),
                        ));
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => text.push_str(&e.unescape().map_err(parse_err)?),
            Ok(Event::CData(e)) => text.push_str(&String::from_utf8_lossy(&e)),
            Ok(Event::End(_)) => {
                let Some(name) = path.pop() else {
                    return Err(XmlError::Invalid("unbalanced end tag".to_string()));
                };
                let value = std::mem::take(&mut text).trim().to_string();
                match (path.len(), name.as_str()) {
                    (0, _) => {
                        complete = true;
                        break;
                    }
                    (1, "id") => entry.id = value,
                    (1, "title") => entry.title = value,
                    (1, "summary") => entry.summary = Some(value),
                    (1, "updated") => entry.updated = Some(parse_date(&name, &value)?),
                    (1, "published") => entry.published = Some(parse_date(&name, &value)?),
                    (1, "edited") => entry.edited = Some(parse_date(&name, &value)?),
                    (1, "author") => entry.authors.extend(author.take()),
                    (1, "content") => {
                        if let Some((kind, src)) = content.take() {
                            entry.content = Some(content_from(&kind, src, value));
                        }
                    }
                    (2, field) if path[1] == "author" => {
                        if let Some(person) = author.as_mut() {
                            match field {
                                "name" => person.name = value,
                                "email" => person.email = Some(value),
                                "uri" => person.uri = Some(value),
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::DocType(_)) => {
                return Err(XmlError::Invalid("DOCTYPE declarations are not allowed".to_string()));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(parse_err(e)),
            _ => {}
        }
    }

    if !complete {
        return Err(XmlError::Invalid("document has no complete <entry> element".to_string()));
    }
    Ok(entry)
}
