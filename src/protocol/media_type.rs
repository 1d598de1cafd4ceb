//! Media types, media ranges and the matching rules used for `Content-Type`
//! validation against a collection's accepted types.
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const ATOM: &str = "application/atom+xml";
pub const ATOM_ENTRY: &str = "application/atom+xml;type=entry";
pub const ATOM_FEED: &str = "application/atom+xml;type=feed";
pub const ATOM_SERVICE: &str = "application/atomsvc+xml";
pub const ATOM_CATEGORIES: &str = "application/atomcat+xml";
pub const JSON: &str = "application/json";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid media type: {0}")]
pub struct MediaTypeError(String);

/// A parsed media type or media range (`type/subtype; name=value`).
///
/// Type, subtype and parameter names are lower-cased; parameter values keep
/// their case with surrounding quotes removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    kind: String,
    subtype: String,
    params: Vec<(String, String)>,
}

impl MediaType {
    pub fn new(kind: &str, subtype: &str) -> Self {
        Self {
            kind: kind.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params
            .push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    pub fn essence(&self) -> String {
        format!("{}/{}", self.kind, self.subtype)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Does this concrete type fall inside `range`?
    ///
    /// `*/*` and `type/*` wildcards are honoured. Every parameter on the range
    /// (other than `q`) must be present with an equal value on `self`, so the
    /// range `application/atom+xml` accepts `application/atom+xml;type=entry`
    /// but not the other way around.
    pub fn matches(&self, range: &MediaType) -> bool {
        let kind_ok = range.kind == "*" || range.kind == self.kind;
        let subtype_ok = range.subtype == "*" || range.subtype == self.subtype;
        if !(kind_ok && subtype_ok) {
            return false;
        }
        range
            .params
            .iter()
            .filter(|(n, _)| n != "q")
            .all(|(n, v)| self.param(n).is_some_and(|mine| mine.eq_ignore_ascii_case(v)))
    }

    /// True for `application/atom+xml` unless it is explicitly a feed.
    pub fn is_atom_entry(&self) -> bool {
        self.kind == "application"
            && self.subtype == "atom+xml"
            && self.param("type").map_or(true, |t| t.eq_ignore_ascii_case("entry"))
    }

    pub fn is_json(&self) -> bool {
        self.kind == "application" && (self.subtype == "json" || self.subtype.ends_with("+json"))
    }

    /// Quality value for Accept header ranges; 1.0 when absent or invalid.
    pub fn quality(&self) -> f32 {
        self.param("q")
            .and_then(|q| q.parse::<f32>().ok())
            .map(|q| q.clamp(0.0, 1.0))
            .unwrap_or(1.0)
    }
}

impl FromStr for MediaType {
    type Err = MediaTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pieces = s.split(';');
        let essence = pieces.next().unwrap_or("").trim();
        let (kind, subtype) = essence
            .split_once('/')
            .ok_or_else(|| MediaTypeError(s.to_string()))?;
        let (kind, subtype) = (kind.trim(), subtype.trim());
        if kind.is_empty() || subtype.is_empty() || kind.contains(' ') || subtype.contains(' ') {
            return Err(MediaTypeError(s.to_string()));
        }
        let mut media = MediaType::new(kind, subtype);
        for piece in pieces {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let (name, value) = piece
                .split_once('=')
                .ok_or_else(|| MediaTypeError(s.to_string()))?;
            media = media.with_param(name.trim(), value.trim().trim_matches('"'));
        }
        Ok(media)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subtype)?;
        for (name, value) in &self.params {
            write!(f, ";{name}={value}")?;
        }
        Ok(())
    }
}

/// Parses a comma-separated list of media ranges, skipping invalid members.
pub fn parse_ranges(header: &str) -> Vec<MediaType> {
    header
        .split(',')
        .filter_map(|r| r.trim().parse().ok())
        .collect()
}

/// Decides whether a response should be JSON rather than Atom XML.
///
/// JSON wins only when the client ranks it strictly above every Atom range
/// it lists; Atom stays the default otherwise.
pub fn prefers_json(accept: Option<&str>) -> bool {
    let Some(accept) = accept else {
        return false;
    };
    let ranges = parse_ranges(accept);
    let best = |pred: &dyn Fn(&MediaType) -> bool| {
        ranges
            .iter()
            .filter(|r| pred(r))
            .map(MediaType::quality)
            .fold(None, |acc: Option<f32>, q| Some(acc.map_or(q, |a| a.max(q))))
    };
    let json = best(&|r: &MediaType| r.is_json());
    let atom = best(&|r: &MediaType| r.kind == "application" && r.subtype.starts_with("atom"));
    match (json, atom) {
        (Some(j), Some(a)) => j > a,
        (Some(j), None) => j > 0.0,
        _ => false,
    }
}
