//! Conditional request evaluation (If-Match, If-None-Match, If-Modified-Since,
//! If-Unmodified-Since).
//!
//! Rules are applied in a fixed order and the first decisive one wins:
//!
//! 1. `If-Match` with no strongly matching tag -> 412
//! 2. `If-Unmodified-Since` older than the resource -> 412
//! 3. `If-None-Match` with a weakly matching tag -> 304 for GET/HEAD, else 412
//! 4. `If-Modified-Since` (ignored when `If-None-Match` is present) not older
//!    than the resource -> 304 for GET/HEAD
//! 5. proceed
//!
//! HTTP dates only carry whole seconds, so last-modified timestamps are
//! truncated to the second before comparison.
use chrono::{DateTime, TimeZone, Utc};
use http::{HeaderMap, Method};
use std::time::SystemTime;

use super::etag::EntityTag;

/// Current validators of the target resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<EntityTag>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl Validators {
    pub fn new(etag: EntityTag, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            etag: Some(etag),
            last_modified,
        }
    }
}

/// Conditional headers carried by a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub if_match: Option<Vec<EntityTag>>,
    pub if_none_match: Option<Vec<EntityTag>>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

impl Preconditions {
    /// Reads the four conditional headers. Repeated header lines are merged;
    /// dates that fail to parse are ignored.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            if_match: tag_list(headers, http::header::IF_MATCH),
            if_none_match: tag_list(headers, http::header::IF_NONE_MATCH),
            if_modified_since: http_date(headers, http::header::IF_MODIFIED_SINCE),
            if_unmodified_since: http_date(headers, http::header::IF_UNMODIFIED_SINCE),
        }
    }
}

fn tag_list(headers: &HeaderMap, name: http::header::HeaderName) -> Option<Vec<EntityTag>> {
    let mut values = headers.get_all(name).iter().peekable();
    values.peek()?;
    Some(
        values
            .filter_map(|v| v.to_str().ok())
            .flat_map(EntityTag::parse_list)
            .collect(),
    )
}

fn http_date(headers: &HeaderMap, name: http::header::HeaderName) -> Option<DateTime<Utc>> {
    let raw = headers.get(&name)?.to_str().ok()?;
    match parse_http_date(raw) {
        Some(date) => Some(date),
        None => {
            tracing::debug!(header = %name, value = %raw, "Ignoring unparseable HTTP date");
            None
        }
    }
}

pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    httpdate::parse_http_date(raw.trim())
        .ok()
        .map(DateTime::<Utc>::from)
}

pub fn format_http_date(date: &DateTime<Utc>) -> String {
    httpdate::fmt_http_date(SystemTime::from(*date))
}

fn truncate_seconds(date: &DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(date.timestamp(), 0)
        .single()
        .unwrap_or(*date)
}

/// Result of evaluating preconditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Proceed,
    NotModified,
    PreconditionFailed,
}

fn is_safe(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// Evaluates `pre` against the resource's current validators.
///
/// `current` is `None` when the resource does not exist: any `If-Match`
/// (even `*`) then fails, and no `If-None-Match` matches.
pub fn evaluate(method: &Method, pre: &Preconditions, current: Option<&Validators>) -> Outcome {
    let etag = current.and_then(|v| v.etag.as_ref());
    let last_modified = current
        .and_then(|v| v.last_modified.as_ref())
        .map(truncate_seconds);

    if let Some(tags) = &pre.if_match {
        let matched = match (current, etag) {
            (None, _) => false,
            (Some(_), Some(etag)) => tags
                .iter()
                .any(|t| t.is_wildcard() || t.strong_match(etag)),
            (Some(_), None) => tags.iter().any(EntityTag::is_wildcard),
        };
        if !matched {
            return Outcome::PreconditionFailed;
        }
    }

    if let (Some(since), Some(modified)) = (&pre.if_unmodified_since, &last_modified) {
        if modified > since {
            return Outcome::PreconditionFailed;
        }
    }

    if let Some(tags) = &pre.if_none_match {
        let matched = match (current, etag) {
            (None, _) => false,
            (Some(_), Some(etag)) => tags.iter().any(|t| t.weak_match(etag)),
            (Some(_), None) => tags.iter().any(EntityTag::is_wildcard),
        };
        if matched {
            return if is_safe(method) {
                Outcome::NotModified
            } else {
                Outcome::PreconditionFailed
            };
        }
        return Outcome::Proceed;
    }

    if let (Some(since), Some(modified)) = (&pre.if_modified_since, &last_modified) {
        if is_safe(method) && modified <= since {
            return Outcome::NotModified;
        }
    }

    Outcome::Proceed
}
