mod entry;
mod feed;
mod service;
pub mod xml;

pub use entry::{Category, Content, Entry, Link, Person};
pub use feed::{Feed, Page, MAX_PAGE_SIZE};
pub use service::{Categories, CollectionInfo, Service, Workspace};
