use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use common::storage::vector_store::SearchFilters;
use sha2::{Digest, Sha256};
use tokio::{sync::Mutex, time::Instant};
use unicode_normalization::UnicodeNormalization;

use crate::answer::AnswerResult;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    seq: u64,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    // insertion sequence -> key, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.seq);
        }
    }
}

/// Bounded map with optional TTL and oldest-insertion-first eviction.
///
/// Insert and evict happen under one lock, so readers never observe a
/// half-applied update.
pub struct BoundedTtlCache<V> {
    ttl: Option<Duration>,
    max_entries: usize,
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> BoundedTtlCache<V> {
    pub fn new(max_entries: usize, ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    fn is_expired(&self, inserted_at: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| inserted_at.elapsed() >= ttl)
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock().await;
        let expired = match state.entries.get(key) {
            Some(entry) if !self.is_expired(entry.inserted_at) => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.remove(key);
        }
        None
    }

    pub async fn insert(&self, key: String, value: V) {
        let mut state = self.state.lock().await;
        state.remove(&key);

        let seq = state.next_seq;
        state.next_seq = state.next_seq.wrapping_add(1);
        state.order.insert(seq, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                seq,
            },
        );

        while state.entries.len() > self.max_entries {
            let Some((_, oldest)) = state.order.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Recent answers keyed by request fingerprint.
pub type ResponseCache = BoundedTtlCache<AnswerResult>;

/// Query embeddings keyed by exact query text; no expiry.
pub type EmbeddingCache = BoundedTtlCache<Arc<Vec<f32>>>;

pub fn response_cache(max_entries: usize, ttl: Duration) -> ResponseCache {
    BoundedTtlCache::new(max_entries, Some(ttl))
}

pub fn embedding_cache(max_entries: usize) -> EmbeddingCache {
    BoundedTtlCache::new(max_entries, None)
}

/// NFKC, lowercase, whitespace collapsed and trimmed.
pub fn normalize_query(query: &str) -> String {
    let folded: String = query.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 hex over the normalized query and the sorted filter set.
pub fn fingerprint(query: &str, filters: &SearchFilters) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update([0u8]);
    // BTreeMap serializes in key order.
    hasher.update(serde_json::to_string(filters).unwrap_or_default().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
