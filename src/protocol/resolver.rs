//! Request path to [`Target`] resolution.
//!
//! A resolver walks an ordered table of routes and returns the first match.
//! Routes are never reordered by specificity: callers register the most
//! specific patterns first. Two route syntaxes are supported:
//!
//! - raw regular expressions, which must match the whole path
//! - templates such as `/feeds/:name/:id`, where `:name` captures one path
//!   segment (up to the next `/` or `;`) and `*rest` captures the remainder
//!
//! Before matching, a single trailing slash is stripped from any path other
//! than `/`, so `/feeds/blog/` and `/feeds/blog` resolve identically.
//!
//! # Example
//!
//! ```
//! use abdera::protocol::{RegexTargetResolver, ResourceType, TargetResolver};
//! use http::Method;
//!
//! let resolver = RegexTargetResolver::builder()
//!     .template(ResourceType::Entry, "/feeds/:name/:id")
//!     .unwrap()
//!     .template(ResourceType::Collection, "/feeds/:name")
//!     .unwrap()
//!     .build();
//!
//! let target = resolver.resolve(&Method::GET, "/feeds/blog/42", &[]).unwrap();
//! assert_eq!(target.resource_type(), &ResourceType::Entry);
//! assert_eq!(target.param_values(), vec!["blog", "42"]);
//! assert!(resolver.resolve(&Method::GET, "/other", &[]).is_none());
//! ```

use http::Method;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

use super::target::{ResourceType, Target};

/// Ordered query parameters, already decoded.
pub type QueryParams = [(String, String)];

/// Characters escaped when a parameter value is expanded into a path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b';')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Invalid route pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid route template '{0}': {1}")]
    InvalidTemplate(String, String),
}

/// Maps an incoming request to a [`Target`].
pub trait TargetResolver: Send + Sync {
    /// Returns `None` when nothing matches; callers answer 404.
    fn resolve(&self, method: &Method, path: &str, query: &QueryParams) -> Option<Target>;
}

/// Builds request paths for a resource type, the inverse of resolution.
pub trait TargetBuilder: Send + Sync {
    fn url_for(&self, resource_type: &ResourceType, params: &[(&str, &str)]) -> Option<String>;
}

// ============================================================================
// Templates
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    Literal(String),
    Param(String),
    Rest(String),
}

/// A path template like `/feeds/:collection/:entry`.
#[derive(Debug, Clone)]
pub struct RouteTemplate {
    source: String,
    parts: Vec<TemplatePart>,
}

impl RouteTemplate {
    pub fn parse(source: &str) -> Result<Self, ResolverError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            if c == ':' || c == '*' {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return Err(ResolverError::InvalidTemplate(
                        source.to_string(),
                        format!("'{c}' must be followed by a parameter name"),
                    ));
                }
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                if c == '*' {
                    if chars.peek().is_some() {
                        return Err(ResolverError::InvalidTemplate(
                            source.to_string(),
                            "wildcard must be the last element".to_string(),
                        ));
                    }
                    parts.push(TemplatePart::Rest(name));
                } else {
                    parts.push(TemplatePart::Param(name));
                }
            } else {
                literal.push(c);
            }
        }
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Parameter names in template order.
    pub fn param_names(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                TemplatePart::Param(n) | TemplatePart::Rest(n) => Some(n.as_str()),
                TemplatePart::Literal(_) => None,
            })
            .collect()
    }

    fn to_regex(&self) -> String {
        let mut re = String::from("^");
        for part in &self.parts {
            match part {
                TemplatePart::Literal(l) => re.push_str(&regex::escape(l)),
                TemplatePart::Param(n) => re.push_str(&format!("(?P<{n}>[^/;]+)")),
                TemplatePart::Rest(n) => re.push_str(&format!("(?P<{n}>.*)")),
            }
        }
        re.push('$');
        re
    }

    /// Expands the template. Returns `None` if a parameter is missing.
    pub fn expand(&self, params: &[(&str, &str)]) -> Option<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(l) => out.push_str(l),
                TemplatePart::Param(n) => {
                    let value = lookup(params, n)?;
                    out.extend(utf8_percent_encode(value, SEGMENT));
                }
                TemplatePart::Rest(n) => out.push_str(lookup(params, n)?),
            }
        }
        Some(out)
    }
}

fn lookup<'a>(params: &[(&str, &'a str)], name: &str) -> Option<&'a str> {
    params.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

// ============================================================================
// Regex resolver
// ============================================================================

struct Route {
    resource_type: ResourceType,
    regex: Regex,
    names: Vec<String>,
    source: Arc<str>,
    template: Option<RouteTemplate>,
}

impl Route {
    fn capture(&self, path: &str) -> Option<Target> {
        let caps = self.regex.captures(path)?;
        let params = self
            .names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                caps.get(i + 1)
                    .map(|m| (name.clone(), m.as_str().to_string()))
            })
            .collect();
        Some(Target::new(
            self.resource_type.clone(),
            params,
            Arc::clone(&self.source),
        ))
    }
}

/// First-match-wins resolver over an ordered route table.
///
/// The table is immutable once built; share it behind an `Arc` and swap the
/// whole resolver to change routes.
pub struct RegexTargetResolver {
    routes: Vec<Route>,
}

impl RegexTargetResolver {
    pub fn builder() -> RegexTargetResolverBuilder {
        RegexTargetResolverBuilder::default()
    }

    /// The standard AtomPub layout under `base`:
    ///
    /// | type | template |
    /// |------|----------|
    /// | Service | `{base}` |
    /// | Categories | `{base}/:collection;categories` |
    /// | MediaEdit | `{base}/:collection/:entry;media` |
    /// | EntryEdit | `{base}/:collection/:entry` |
    /// | Collection | `{base}/:collection` |
    pub fn atompub(base: &str) -> Result<Self, ResolverError> {
        let base = normalize_path(base).trim_end_matches('/').to_string();
        let service = if base.is_empty() { "/".to_string() } else { base.clone() };
        Ok(Self::builder()
            .template(ResourceType::Service, &service)?
            .template(
                ResourceType::Categories,
                &format!("{base}/:collection;categories"),
            )?
            .template(
                ResourceType::MediaEdit,
                &format!("{base}/:collection/:entry;media"),
            )?
            .template(ResourceType::EntryEdit, &format!("{base}/:collection/:entry"))?
            .template(ResourceType::Collection, &format!("{base}/:collection"))?
            .build())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl TargetResolver for RegexTargetResolver {
    fn resolve(&self, method: &Method, path: &str, _query: &QueryParams) -> Option<Target> {
        let path = normalize_path(path);
        let target = self.routes.iter().find_map(|r| r.capture(path));
        match &target {
            Some(t) => tracing::trace!(
                method = %method,
                path = %path,
                resource_type = %t.resource_type(),
                pattern = %t.pattern(),
                "Resolved request target"
            ),
            None => tracing::debug!(method = %method, path = %path, "No route matched"),
        }
        target
    }
}

impl TargetBuilder for RegexTargetResolver {
    /// Expands the first template registered for `resource_type` whose
    /// parameters are all supplied. Raw regex routes cannot be expanded.
    fn url_for(&self, resource_type: &ResourceType, params: &[(&str, &str)]) -> Option<String> {
        self.routes
            .iter()
            .filter(|r| &r.resource_type == resource_type)
            .filter_map(|r| r.template.as_ref())
            .find_map(|t| t.expand(params))
    }
}

#[derive(Default)]
pub struct RegexTargetResolverBuilder {
    routes: Vec<Route>,
}

impl RegexTargetResolverBuilder {
    /// Adds a regex route. The pattern must match the entire path; named
    /// groups keep their names, unnamed groups are named by position.
    pub fn route(mut self, resource_type: ResourceType, pattern: &str) -> Result<Self, ResolverError> {
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored).map_err(|source| ResolverError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        let names = regex
            .capture_names()
            .skip(1)
            .enumerate()
            .map(|(i, n)| n.map(str::to_string).unwrap_or_else(|| i.to_string()))
            .collect();
        self.routes.push(Route {
            resource_type,
            regex,
            names,
            source: Arc::from(pattern),
            template: None,
        });
        Ok(self)
    }

    /// Adds a template route such as `/feeds/:name/:id`.
    pub fn template(mut self, resource_type: ResourceType, template: &str) -> Result<Self, ResolverError> {
        let parsed = RouteTemplate::parse(template)?;
        let pattern = parsed.to_regex();
        let regex = Regex::new(&pattern).map_err(|source| ResolverError::InvalidPattern {
            pattern: template.to_string(),
            source,
        })?;
        let names = parsed.param_names().into_iter().map(str::to_string).collect();
        self.routes.push(Route {
            resource_type,
            regex,
            names,
            source: Arc::from(template),
            template: Some(parsed),
        });
        Ok(self)
    }

    pub fn build(self) -> RegexTargetResolver {
        RegexTargetResolver {
            routes: self.routes,
        }
    }
}

/// Strips one trailing slash, leaving the root path alone.
fn normalize_path(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

// ============================================================================
// Composite resolver
// ============================================================================

/// Consults several resolvers in registration order.
#[derive(Default)]
pub struct CompositeTargetResolver {
    resolvers: Vec<Arc<dyn TargetResolver>>,
}

impl CompositeTargetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }
}

impl TargetResolver for CompositeTargetResolver {
    fn resolve(&self, method: &Method, path: &str, query: &QueryParams) -> Option<Target> {
        self.resolvers
            .iter()
            .find_map(|r| r.resolve(method, path, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feeds_resolver() -> RegexTargetResolver {
        RegexTargetResolver::builder()
            .template(ResourceType::Entry, "/feeds/:name/:id")
            .unwrap()
            .template(ResourceType::Collection, "/feeds/:name")
            .unwrap()
            .build()
    }

    #[test]
    fn test_template_resolution() {
        let r = feeds_resolver();

        let entry = r.resolve(&Method::GET, "/feeds/blog/42", &[]).unwrap();
        assert_eq!(entry.resource_type(), &ResourceType::Entry);
        assert_eq!(entry.param_values(), vec!["blog", "42"]);

        let coll = r.resolve(&Method::GET, "/feeds/blog", &[]).unwrap();
        assert_eq!(coll.resource_type(), &ResourceType::Collection);
        assert_eq!(coll.param_values(), vec!["blog"]);

        assert!(r.resolve(&Method::GET, "/other", &[]).is_none());
    }

    #[test]
    fn test_first_match_wins_without_reordering() {
        // Less specific first: the collection route swallows nothing extra
        // because segments stop at '/', but a wildcard route does.
        let r = RegexTargetResolver::builder()
            .template(ResourceType::Unknown, "/feeds/*rest")
            .unwrap()
            .template(ResourceType::Entry, "/feeds/:name/:id")
            .unwrap()
            .build();
        let t = r.resolve(&Method::GET, "/feeds/blog/42", &[]).unwrap();
        assert_eq!(t.resource_type(), &ResourceType::Unknown);
        assert_eq!(t.param("rest"), Some("blog/42"));
    }

    #[test]
    fn test_trailing_slash_normalized() {
        let r = feeds_resolver();
        let t = r.resolve(&Method::GET, "/feeds/blog/", &[]).unwrap();
        assert_eq!(t.resource_type(), &ResourceType::Collection);
    }

    #[test]
    fn test_regex_route_requires_full_match() {
        let r = RegexTargetResolver::builder()
            .route(ResourceType::Entry, r"/e/(\d+)")
            .unwrap()
            .build();
        let t = r.resolve(&Method::GET, "/e/17", &[]).unwrap();
        assert_eq!(t.param("0"), Some("17"));
        assert!(r.resolve(&Method::GET, "/x/e/17", &[]).is_none());
        assert!(r.resolve(&Method::GET, "/e/17/more", &[]).is_none());
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        assert!(RegexTargetResolver::builder()
            .route(ResourceType::Entry, "(unclosed")
            .is_err());
        assert!(RouteTemplate::parse("/a/:").is_err());
        assert!(RouteTemplate::parse("/a/*rest/b").is_err());
    }

    #[test]
    fn test_atompub_layout() {
        let r = RegexTargetResolver::atompub("/atom").unwrap();
        let get = |p: &str| r.resolve(&Method::GET, p, &[]).map(|t| t.resource_type().clone());

        assert_eq!(get("/atom"), Some(ResourceType::Service));
        assert_eq!(get("/atom/blog"), Some(ResourceType::Collection));
        assert_eq!(get("/atom/blog;categories"), Some(ResourceType::Categories));
        assert_eq!(get("/atom/blog/1"), Some(ResourceType::EntryEdit));
        assert_eq!(get("/atom/blog/1;media"), Some(ResourceType::MediaEdit));
        assert_eq!(get("/elsewhere"), None);
    }

    #[test]
    fn test_atompub_root_base() {
        let r = RegexTargetResolver::atompub("/").unwrap();
        let t = r.resolve(&Method::GET, "/", &[]).unwrap();
        assert_eq!(t.resource_type(), &ResourceType::Service);
        let t = r.resolve(&Method::GET, "/blog", &[]).unwrap();
        assert_eq!(t.resource_type(), &ResourceType::Collection);
    }

    #[test]
    fn test_url_for_expands_and_escapes() {
        let r = RegexTargetResolver::atompub("/atom").unwrap();
        assert_eq!(
            r.url_for(&ResourceType::EntryEdit, &[("collection", "blog"), ("entry", "a b/c")]),
            Some("/atom/blog/a%20b%2Fc".to_string())
        );
        assert_eq!(
            r.url_for(&ResourceType::MediaEdit, &[("collection", "pics"), ("entry", "1")]),
            Some("/atom/pics/1;media".to_string())
        );
        assert_eq!(r.url_for(&ResourceType::EntryEdit, &[("collection", "blog")]), None);
    }

    #[test]
    fn test_composite_order() {
        let a: Arc<dyn TargetResolver> = Arc::new(
            RegexTargetResolver::builder()
                .template(ResourceType::Service, "/svc")
                .unwrap()
                .build(),
        );
        let b: Arc<dyn TargetResolver> = Arc::new(
            RegexTargetResolver::builder()
                .template(ResourceType::Categories, "/svc")
                .unwrap()
                .template(ResourceType::Collection, "/c/:collection")
                .unwrap()
                .build(),
        );
        let composite = CompositeTargetResolver::new().with(a).with(b);
        let t = composite.resolve(&Method::GET, "/svc", &[]).unwrap();
        assert_eq!(t.resource_type(), &ResourceType::Service);
        let t = composite.resolve(&Method::GET, "/c/x", &[]).unwrap();
        assert_eq!(t.resource_type(), &ResourceType::Collection);
    }
}
