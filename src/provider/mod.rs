//! The request dispatcher.
//!
//! A [`Provider`] turns a [`RequestContext`] into a [`ResponseContext`]:
//! the filter chain runs first, then the target is resolved, the processor
//! for its resource type checks the method and finally calls the collection
//! adapter. Every failure along the way becomes a structured error response;
//! `process` itself never fails.
use futures::FutureExt;
use http::{Method, StatusCode};
use secrecy::SecretString;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use crate::adapter::{AdapterFactories, AdapterRegistry};
use crate::config::Config;
use crate::model::{CollectionInfo, Service, Workspace};
use crate::protocol::{
    CacheControl, ProtocolError, RegexTargetResolver, RequestContext, ResolverError, ResourceType,
    ResponseContext, TargetBuilder, TargetResolver,
};

mod filter;
mod locks;
mod processor;

pub use filter::{
    AuthFilter, ConcurrencyLimitFilter, FilterChain, MethodOverrideFilter, RequestFilter, TracingFilter,
};
pub use locks::ResourceLocks;
pub use processor::{
    CategoriesProcessor, CollectionProcessor, Dispatch, EntryProcessor, MediaProcessor, RequestProcessor,
    ServiceProcessor,
};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Expose internal error detail in 500 bodies.
    pub debug: bool,
    /// Applied to successful reads and 304s.
    pub cache_control: CacheControl,
    /// Entries per page when the request names no `page_size`.
    pub page_size: usize,
    pub workspace_title: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            debug: false,
            cache_control: CacheControl::revalidate(),
            page_size: 25,
            workspace_title: "Abdera".to_string(),
        }
    }
}

impl ProviderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debug: config.debug,
            cache_control: match config.cache_max_age {
                0 => CacheControl::revalidate(),
                seconds => CacheControl::max_age(seconds),
            },
            page_size: config.page_size,
            workspace_title: config.workspace_title.clone(),
        }
    }
}

// ============================================================================
// Provider
// ============================================================================

pub struct Provider {
    resolver: RwLock<Arc<dyn TargetResolver>>,
    builder: Arc<dyn TargetBuilder>,
    adapters: AdapterRegistry,
    processors: HashMap<ResourceType, Arc<dyn RequestProcessor>>,
    filters: Vec<Arc<dyn RequestFilter>>,
    settings: ProviderSettings,
    locks: ResourceLocks,
}

impl Provider {
    /// A provider with the standard processors and no filters.
    pub fn new(
        resolver: Arc<dyn TargetResolver>,
        builder: Arc<dyn TargetBuilder>,
        adapters: AdapterRegistry,
        settings: ProviderSettings,
    ) -> Self {
        let entry: Arc<dyn RequestProcessor> = Arc::new(EntryProcessor::new());
        let media: Arc<dyn RequestProcessor> = Arc::new(MediaProcessor::new());
        let mut processors: HashMap<ResourceType, Arc<dyn RequestProcessor>> = HashMap::new();
        processors.insert(ResourceType::Service, Arc::new(ServiceProcessor::new()));
        processors.insert(ResourceType::Categories, Arc::new(CategoriesProcessor::new()));
        processors.insert(ResourceType::Collection, Arc::new(CollectionProcessor::new()));
        for resource_type in [
            ResourceType::Entry,
            ResourceType::EntryEdit,
            ResourceType::Media,
            ResourceType::MediaEdit,
        ] {
            let processor = if resource_type.is_entry() { &entry } else { &media };
            processors.insert(resource_type, Arc::clone(processor));
        }

        Self {
            resolver: RwLock::new(resolver),
            builder,
            adapters,
            processors,
            filters: Vec::new(),
            settings,
            locks: ResourceLocks::new(),
        }
    }

    /// The standard AtomPub layout rooted at `base_path`, with one table
    /// serving as both resolver and URL builder.
    pub fn atompub(
        base_path: &str,
        adapters: AdapterRegistry,
        settings: ProviderSettings,
    ) -> Result<Self, ResolverError> {
        let routes = Arc::new(RegexTargetResolver::atompub(base_path)?);
        Ok(Self::new(routes.clone(), routes, adapters, settings))
    }

    /// Builds every configured collection and installs the filters the
    /// configuration asks for.
    pub async fn from_config(config: &Config, factories: &AdapterFactories) -> anyhow::Result<Self> {
        let adapters = factories.build_registry(&config.collections).await?;
        let mut provider = Self::atompub(&config.base_path, adapters, ProviderSettings::from_config(config))?
            .with_filter(Arc::new(TracingFilter));
        if config.max_concurrent_requests > 0 {
            provider = provider.with_filter(Arc::new(ConcurrencyLimitFilter::new(
                config.max_concurrent_requests,
            )));
        }
        provider = provider.with_filter(Arc::new(MethodOverrideFilter::new()));
        if let Some(token) = &config.auth_token {
            provider = provider.with_filter(Arc::new(AuthFilter::new(SecretString::from(token.clone()))));
        }
        Ok(provider)
    }

    /// Replaces (or adds) the processor for a resource type.
    pub fn with_processor(mut self, resource_type: ResourceType, processor: Arc<dyn RequestProcessor>) -> Self {
        self.processors.insert(resource_type, processor);
        self
    }

    /// Appends a filter; filters run in the order they were added.
    pub fn with_filter(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Swaps the route table. Requests already resolving keep the old one.
    pub fn set_resolver(&self, resolver: Arc<dyn TargetResolver>) {
        let mut current = self.resolver.write().unwrap_or_else(|e| e.into_inner());
        *current = resolver;
        tracing::info!("Target resolver replaced");
    }

    pub fn resolver(&self) -> Arc<dyn TargetResolver> {
        Arc::clone(&self.resolver.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn builder(&self) -> &dyn TargetBuilder {
        self.builder.as_ref()
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    /// Runs the filter chain and then [`Provider::dispatch`].
    pub async fn process(&self, request: RequestContext) -> ResponseContext {
        FilterChain::new(&self.filters, self).proceed(request).await
    }

    /// Resolves and processes one request, bypassing the filters.
    pub async fn dispatch(&self, request: &RequestContext) -> ResponseContext {
        let method = request.method().clone();
        let Some(target) = self.resolver().resolve(&method, request.path(), request.query()) else {
            return self.error_response(&ProtocolError::not_found(format!(
                "no resource at {}",
                request.path()
            )));
        };

        let Some(processor) = self.processors.get(target.resource_type()).cloned() else {
            tracing::debug!(resource_type = %target.resource_type(), "No processor registered");
            return self.error_response(&ProtocolError::not_found(format!(
                "no resource at {}",
                request.path()
            )));
        };

        let allowed = processor.allowed_methods();
        if method == Method::OPTIONS {
            if let Some(name) = target.collection() {
                if self.adapters.get(name).is_none() {
                    return self.error_response(&ProtocolError::not_found(format!("collection '{name}'")));
                }
            }
            return ResponseContext::new(StatusCode::OK)
                .with_allow(allowed)
                .with_content_length(0);
        }
        if !allowed.contains(&method) {
            return self.error_response(&ProtocolError::MethodNotAllowed {
                method,
                allowed: allowed.to_vec(),
            });
        }

        let dispatch = Dispatch {
            request,
            target: &target,
            provider: self,
        };
        let outcome = match AssertUnwindSafe(processor.process(&dispatch)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(ProtocolError::internal(anyhow::anyhow!(
                "request processing panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };
        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                if err.status().is_server_error() {
                    tracing::error!(
                        method = %method,
                        path = %request.path(),
                        error = ?err,
                        "Request failed"
                    );
                } else {
                    tracing::debug!(
                        method = %method,
                        path = %request.path(),
                        status = err.status().as_u16(),
                        error = %err,
                        "Request rejected"
                    );
                }
                self.error_response(&err)
            }
        };

        if method == Method::HEAD {
            response.into_head()
        } else {
            response
        }
    }

    pub(crate) fn error_response(&self, err: &ProtocolError) -> ResponseContext {
        ResponseContext::error(err, self.settings.debug)
    }

    /// The service document: one workspace listing every collection.
    pub async fn service_document(&self, request: &RequestContext) -> Result<Service, ProtocolError> {
        let mut collections = Vec::with_capacity(self.adapters.len());
        for (name, adapter) in self.adapters.iter() {
            let params = [("collection", name)];
            let Some(href) = self.builder.url_for(&ResourceType::Collection, &params) else {
                tracing::warn!(collection = %name, "No route builds a collection URL, omitting");
                continue;
            };
            let categories_href = match adapter.categories(request).await? {
                Some(_) => self
                    .builder
                    .url_for(&ResourceType::Categories, &params)
                    .map(|p| request.absolute(&p)),
                None => None,
            };
            collections.push(CollectionInfo {
                title: adapter.title().to_string(),
                href: request.absolute(&href),
                accept: adapter.accepts().iter().map(ToString::to_string).collect(),
                categories_href,
            });
        }
        Ok(Service {
            workspaces: vec![Workspace {
                title: self.settings.workspace_title.clone(),
                collections,
            }],
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("adapters", &self.adapters)
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("filters", &self.filters.len())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::protocol::{HeaderAccess, Target};
    use pretty_assertions::assert_eq;

    fn provider() -> Provider {
        let adapters = AdapterRegistry::new().with("blog", Arc::new(MemoryAdapter::new("blog")));
        Provider::atompub("/atom", adapters, ProviderSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_unresolved_path_is_404() {
        let response = provider()
            .process(RequestContext::new(Method::GET, "/elsewhere"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_collection_is_404() {
        let response = provider()
            .process(RequestContext::new(Method::GET, "/atom/missing"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_options_lists_allowed_methods() {
        let response = provider()
            .process(RequestContext::new(Method::OPTIONS, "/atom/blog"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.header("allow"), Some("GET, POST, HEAD, OPTIONS"));
    }

    #[tokio::test]
    async fn test_wrong_method_is_405_with_allow() {
        let response = provider()
            .process(RequestContext::new(Method::DELETE, "/atom"))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.header("allow"), Some("GET, HEAD, OPTIONS"));
    }

    struct Fixed(ResourceType);

    impl TargetResolver for Fixed {
        fn resolve(&self, _: &Method, path: &str, _: &[(String, String)]) -> Option<Target> {
            Some(Target::new(self.0.clone(), Vec::new(), path.to_string()))
        }
    }

    #[tokio::test]
    async fn test_missing_processor_is_404() {
        let provider = provider();
        provider.set_resolver(Arc::new(Fixed(ResourceType::Other("search".into()))));
        let response = provider
            .process(RequestContext::new(Method::GET, "/anything"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resolver_swap_takes_effect() {
        let provider = provider();
        provider.set_resolver(Arc::new(Fixed(ResourceType::Service)));
        let response = provider
            .process(RequestContext::new(Method::GET, "/not/the/base"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            cache_max_age: 120,
            debug: true,
            ..Config::default()
        };
        let settings = ProviderSettings::from_config(&config);
        assert!(settings.debug);
        assert_eq!(settings.cache_control, CacheControl::max_age(120));
        assert_eq!(
            ProviderSettings::from_config(&Config::default()).cache_control,
            CacheControl::revalidate()
        );
    }
}
