//! Small text helpers shared by the protocol layer and the adapters.

mod slug;

pub use slug::{decode_slug, slugify, strip_control_chars, MAX_SLUG_LENGTH};
