//! Data models for cached records.
//!
//! - `Recipe`: the application payload persisted one-file-per-record on the
//!   remote store and addressed by a [`crate::Key`] derived from its name.

pub mod recipe;

pub use recipe::Recipe;
