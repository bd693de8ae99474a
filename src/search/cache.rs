//! Search result cache keyed by query + parameters.
//!
//! Expiry and write discipline (last write wins) belong to the cache
//! implementation; the pipeline only reads before searching and writes
//! non-empty responses after.

use std::time::Duration;

use moka::sync::Cache;

use crate::models::{OwnerScope, Query, SearchOptions, SearchResponse, SearchType};

const CACHE_KEY_SCHEMA_VERSION: u32 = 1;

pub trait ResultCache: Send + Sync {
    fn get(&self, key: &str) -> Option<SearchResponse>;
    fn put(&self, key: &str, response: SearchResponse);
    /// Drop every entry. Called when the indexed corpus changes.
    fn invalidate_all(&self);
}

/// Stable key over everything that can change the response.
pub fn cache_key(
    query: &Query,
    owner: &OwnerScope,
    search_type: SearchType,
    options: &SearchOptions,
) -> Option<String> {
    let payload = serde_json::json!({
        "schema_version": CACHE_KEY_SCHEMA_VERSION,
        "owner": owner,
        "search_type": search_type,
        "query": query,
        "options": options,
    });
    match serde_json::to_vec(&payload) {
        Ok(raw) => Some(blake3::hash(&raw).to_hex().to_string()),
        Err(e) => {
            tracing::warn!("Failed to encode cache key payload: {e}");
            None
        }
    }
}

/// In-process TTL cache.
pub struct MemoryResultCache {
    cache: Cache<String, SearchResponse>,
}

impl MemoryResultCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl ResultCache for MemoryResultCache {
    fn get(&self, key: &str) -> Option<SearchResponse> {
        self.cache.get(key)
    }

    fn put(&self, key: &str, response: SearchResponse) {
        self.cache.insert(key.to_string(), response);
    }

    fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
