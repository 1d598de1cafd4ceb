//! AtomPub protocol primitives: request targets and their resolution, entity
//! tags and conditional requests, media types, request/response contexts and
//! the error taxonomy.

pub mod cache_control;
pub mod conditional;
mod error;
pub mod etag;
pub mod media_type;
mod request;
mod resolver;
mod response;
mod target;

pub use cache_control::CacheControl;
pub use conditional::{evaluate, Outcome, Preconditions, Validators};
pub use error::{ErrorBody, ProtocolError};
pub use etag::EntityTag;
pub use media_type::MediaType;
pub use request::{BodyAccess, ConditionalHeaders, HeaderAccess, RequestContext};
pub use resolver::{
    CompositeTargetResolver, QueryParams, RegexTargetResolver, RegexTargetResolverBuilder,
    ResolverError, RouteTemplate, TargetBuilder, TargetResolver,
};
pub use response::{Entity, Format, ResponseContext, StatusText};
pub use target::{ResourceType, Target};
