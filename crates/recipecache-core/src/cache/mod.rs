//! In-memory caching for offline record access.
//!
//! This module provides the `CacheStore`, a key → entry map with per-entry
//! timestamps. Entries older than the configured timeout are invalid: they
//! are evicted lazily on read and never returned.

pub mod store;

pub use store::{format_age, CacheEntry, CacheEntryInfo, CacheMetadata, CacheStore};
