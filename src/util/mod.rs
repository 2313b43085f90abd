//! Shared helpers: dot-path navigation and deep merge over the envelope
//! [`Value`](crate::envelope::Value) model.
//!
//! Ported from the teacher's `serde_json::Value`-based
//! `get_by_path`/`set_by_path`/`deep_merge` trio onto PetalFlow's own typed
//! `Value` sum type.

pub mod dotpath;
pub mod merge;
pub mod template;

pub use dotpath::{get_nested, remove_nested, set_nested};
pub use merge::{deep_merge, MergeStrategy};
