use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::time::Instant;
use tracing::trace;

use crate::key::Key;
use crate::models::Recipe;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Recipe,
    /// Monotonic insertion time, drives expiry
    pub inserted: Instant,
    /// Wall-clock insertion time, for diagnostics
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(data: Recipe, now: Instant) -> Self {
        Self {
            data,
            inserted: now,
            cached_at: Utc::now(),
        }
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted)
    }

    /// Valid while `now - inserted <= timeout`
    pub fn is_valid_at(&self, now: Instant, timeout: Duration) -> bool {
        self.age_at(now) <= timeout
    }
}

/// Render an age the way the status line shows it.
pub fn format_age(age: Duration) -> String {
    let minutes = (age.as_secs() / 60) as i64;
    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        let remaining_mins = minutes % 60;
        if remaining_mins >= 30 {
            // Round up: 1h 30m+ becomes 2h
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        let remaining_hours = (minutes % 1440) / 60;
        if remaining_hours >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryInfo {
    pub key: Key,
    pub age: Duration,
    pub age_display: String,
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheMetadata {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    pub timeout: Duration,
    pub entries: Vec<CacheEntryInfo>,
}

/// Key → recipe map with time-to-live.
///
/// Keys are kept in touch order: `set` on an existing key moves it to the
/// newest end, so `all` lists recently written recipes last.
#[derive(Debug)]
pub struct CacheStore {
    entries: IndexMap<Key, CacheEntry>,
    timeout: Duration,
}

impl CacheStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: IndexMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get(&mut self, key: &Key) -> Option<Recipe> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &Key, now: Instant) -> Option<Recipe> {
        let valid = self.entries.get(key)?.is_valid_at(now, self.timeout);
        if valid {
            self.entries.get(key).map(|entry| entry.data.clone())
        } else {
            trace!(key = %key, "Evicting expired cache entry");
            self.entries.shift_remove(key);
            None
        }
    }

    pub fn set(&mut self, key: Key, recipe: Recipe) {
        self.set_at(key, recipe, Instant::now());
    }

    pub fn set_at(&mut self, key: Key, recipe: Recipe, now: Instant) {
        self.entries.shift_remove(&key);
        self.entries.insert(key, CacheEntry::new(recipe, now));
    }

    pub fn remove(&mut self, key: &Key) -> Option<Recipe> {
        self.entries.shift_remove(key).map(|entry| entry.data)
    }

    /// Every valid recipe in touch order (oldest first)
    pub fn all(&mut self) -> Vec<Recipe> {
        self.all_at(Instant::now())
    }

    pub fn all_at(&mut self, now: Instant) -> Vec<Recipe> {
        self.evict_expired_at(now);
        self.entries.values().map(|entry| entry.data.clone()).collect()
    }

    /// Replace the whole cache with a freshly loaded collection
    pub fn replace_all(&mut self, recipes: impl IntoIterator<Item = (Key, Recipe)>) {
        let now = Instant::now();
        self.entries.clear();
        for (key, recipe) in recipes {
            self.set_at(key, recipe, now);
        }
    }

    pub fn valid_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .values()
            .filter(|entry| entry.is_valid_at(now, self.timeout))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn metadata(&self) -> CacheMetadata {
        self.metadata_at(Instant::now())
    }

    pub fn metadata_at(&self, now: Instant) -> CacheMetadata {
        let entries: Vec<CacheEntryInfo> = self
            .entries
            .iter()
            .map(|(key, entry)| {
                let age = entry.age_at(now);
                CacheEntryInfo {
                    key: key.clone(),
                    age,
                    age_display: format_age(age),
                    expired: !entry.is_valid_at(now, self.timeout),
                }
            })
            .collect();

        let expired = entries.iter().filter(|info| info.expired).count();
        CacheMetadata {
            total: entries.len(),
            valid: entries.len() - expired,
            expired,
            timeout: self.timeout,
            entries,
        }
    }

    fn evict_expired_at(&mut self, now: Instant) {
        let timeout = self.timeout;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_valid_at(now, timeout));
        let evicted = before - self.entries.len();
        if evicted > 0 {
            trace!(evicted, "Evicted expired cache entries");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(300);

    fn recipe(name: &str) -> (Key, Recipe) {
        let recipe = Recipe::new(name);
        (recipe.key(), recipe)
    }

    #[test]
    fn test_get_returns_valid_entry() {
        let mut cache = CacheStore::new(TIMEOUT);
        let (key, soup) = recipe("Soup");
        cache.set(key.clone(), soup.clone());
        assert_eq!(cache.get(&key), Some(soup));
    }

    #[test]
    fn test_entry_expires_strictly_after_timeout() {
        let mut cache = CacheStore::new(TIMEOUT);
        let (key, soup) = recipe("Soup");
        let start = Instant::now();
        cache.set_at(key.clone(), soup.clone(), start);

        assert_eq!(cache.get_at(&key, start + TIMEOUT), Some(soup));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.get_at(&key, start + TIMEOUT + Duration::from_millis(1)), None);
        // Evicted as a side effect of the read
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_all_skips_and_evicts_expired() {
        let mut cache = CacheStore::new(TIMEOUT);
        let start = Instant::now();
        let (old_key, old) = recipe("Old");
        let (new_key, new) = recipe("New");
        cache.set_at(old_key, old, start);
        cache.set_at(new_key, new.clone(), start + Duration::from_secs(200));

        let all = cache.all_at(start + Duration::from_secs(400));
        assert_eq!(all, vec![new]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_set_moves_key_to_newest() {
        let mut cache = CacheStore::new(TIMEOUT);
        let (a_key, a) = recipe("A");
        let (b_key, b) = recipe("B");
        cache.set(a_key.clone(), a.clone());
        cache.set(b_key, b.clone());
        cache.set(a_key, a.clone());

        let names: Vec<String> = cache.all().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut cache = CacheStore::new(TIMEOUT);
        assert_eq!(cache.remove(&Key::from_name("missing")), None);
    }

    #[test]
    fn test_metadata_counts() {
        let mut cache = CacheStore::new(TIMEOUT);
        let start = Instant::now();
        let (a_key, a) = recipe("A");
        let (b_key, b) = recipe("B");
        cache.set_at(a_key, a, start);
        cache.set_at(b_key.clone(), b, start + Duration::from_secs(290));

        let meta = cache.metadata_at(start + Duration::from_secs(301));
        assert_eq!(meta.total, 2);
        assert_eq!(meta.valid, 1);
        assert_eq!(meta.expired, 1);
        assert_eq!(meta.timeout, TIMEOUT);
        let b_info = meta.entries.iter().find(|info| info.key == b_key).unwrap();
        assert_eq!(b_info.age, Duration::from_secs(11));
        assert_eq!(b_info.age_display, "just now");
        // Metadata is read-only
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clear() {
        let mut cache = CacheStore::new(TIMEOUT);
        let (key, soup) = recipe("Soup");
        cache.set(key, soup);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(Duration::from_secs(30)), "just now");
        assert_eq!(format_age(Duration::from_secs(5 * 60)), "5m ago");
        assert_eq!(format_age(Duration::from_secs(89 * 60)), "1h ago");
        assert_eq!(format_age(Duration::from_secs(90 * 60)), "2h ago");
        assert_eq!(format_age(Duration::from_secs(36 * 3600)), "2d ago");
        assert_eq!(format_age(Duration::from_secs(30 * 3600)), "1d ago");
    }
}
