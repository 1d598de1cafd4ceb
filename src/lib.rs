//! An AtomPub server framework.
//!
//! Requests are resolved to a [`protocol::Target`], dispatched by a
//! [`provider::Provider`] to the processor for the target's resource type,
//! and served from a [`adapter::CollectionAdapter`] per collection.

pub mod adapter;
pub mod config;
pub mod model;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod storage;
pub mod util;
