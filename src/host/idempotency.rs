// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-session idempotency cache for mutating requests.
//!
//! For each `(session_id, key)` the first request becomes the owner: it
//! dispatches once, snapshots its response, and serves cached copies to
//! every concurrent or later duplicate. Reusing a key with different
//! request contents is an error. The cache is a bounded LRU; eviction
//! skips entries whose owner is still in flight.

use std::collections::HashMap;

use tokio::sync::{watch, Mutex};

use crate::ipc::{CoreRequest, CoreResponse};
use crate::limits::IDEMPOTENCY_CACHE_LIMIT;

/// Snapshot of a response, replayable under a new request id.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub ok: bool,
    pub result: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl CachedResponse {
    pub fn from_response(response: &CoreResponse) -> Self {
        Self {
            ok: response.ok,
            result: response.result.clone(),
            error_code: response.error.as_ref().map(|e| e.code.clone()),
            error_message: response.error.as_ref().map(|e| e.message.clone()),
        }
    }

    pub fn to_response(&self, request_id: &str) -> CoreResponse {
        if self.ok {
            CoreResponse::success(request_id, self.result.clone())
        } else {
            CoreResponse::failure(
                request_id,
                self.error_code.as_deref().unwrap_or("UNKNOWN_ERROR"),
                self.error_message.clone().unwrap_or_else(|| "Unknown error".to_string()),
            )
        }
    }
}

struct IdempotencyRecord {
    fingerprint: String,
    response: Option<CachedResponse>,
    /// Present while the owning request is still dispatching.
    pending: Option<watch::Sender<Option<CachedResponse>>>,
    /// LRU tick of last touch.
    last_used: u64,
}

/// Outcome of reserving a key.
pub enum Reservation {
    /// Caller owns the dispatch and must call `store` (or `abandon`).
    Owner,
    /// Another request owns the dispatch; await the receiver.
    Waiter(watch::Receiver<Option<CachedResponse>>),
    /// A snapshot already exists.
    Cached(CachedResponse),
    /// Key reused with a different fingerprint.
    FingerprintMismatch,
}

/// Stable serialization of the request's identity for fingerprinting.
pub fn fingerprint(request: &CoreRequest) -> String {
    // serde_json::Value serializes object keys in map order; re-parse into
    // a canonical value to keep the fingerprint stable across callers.
    let payload = serde_json::json!({
        "capability": request.capability,
        "method": request.method,
        "params": request.params,
    });
    canonical_json(&payload)
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Bounded LRU idempotency cache.
pub struct IdempotencyCache {
    records: Mutex<CacheState>,
    limit: usize,
}

struct CacheState {
    records: HashMap<(String, String), IdempotencyRecord>,
    tick: u64,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::with_limit(IDEMPOTENCY_CACHE_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            records: Mutex::new(CacheState {
                records: HashMap::new(),
                tick: 0,
            }),
            limit,
        }
    }

    /// The cache key for a request, when it carries a usable key.
    pub fn cache_key(request: &CoreRequest) -> Option<(String, String)> {
        let key = request.idempotency_key.as_deref()?.trim();
        if key.is_empty() {
            return None;
        }
        Some((request.session_id.clone(), key.to_string()))
    }

    /// Reserve a key for dispatch.
    pub async fn reserve(&self, key: &(String, String), fingerprint: &str) -> Reservation {
        let mut state = self.records.lock().await;
        state.tick += 1;
        let tick = state.tick;

        if let Some(record) = state.records.get_mut(key) {
            record.last_used = tick;
            if record.fingerprint != fingerprint {
                return Reservation::FingerprintMismatch;
            }
            if let Some(ref cached) = record.response {
                return Reservation::Cached(cached.clone());
            }
            if let Some(ref pending) = record.pending {
                return Reservation::Waiter(pending.subscribe());
            }
            // Record exists but its owner abandoned; take ownership.
            let (tx, _) = watch::channel(None);
            record.pending = Some(tx);
            return Reservation::Owner;
        }

        let (tx, _) = watch::channel(None);
        state.records.insert(
            key.clone(),
            IdempotencyRecord {
                fingerprint: fingerprint.to_string(),
                response: None,
                pending: Some(tx),
                last_used: tick,
            },
        );
        Reservation::Owner
    }

    /// Store the owner's response and wake all waiters.
    pub async fn store(&self, key: &(String, String), cached: CachedResponse) {
        let mut state = self.records.lock().await;
        state.tick += 1;
        let tick = state.tick;
        if let Some(record) = state.records.get_mut(key) {
            record.response = Some(cached.clone());
            record.last_used = tick;
            if let Some(pending) = record.pending.take() {
                let _ = pending.send(Some(cached));
            }
        }
        Self::trim(&mut state, self.limit);
    }

    /// Drop a reservation whose dispatch failed catastrophically; waiters
    /// see the channel close and retry.
    pub async fn abandon(&self, key: &(String, String)) {
        let mut state = self.records.lock().await;
        state.records.remove(key);
    }

    fn trim(state: &mut CacheState, limit: usize) {
        while state.records.len() > limit {
            let victim = state
                .records
                .iter()
                .filter(|(_, r)| r.pending.is_none())
                .min_by_key(|(_, r)| r.last_used)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    state.records.remove(&key);
                }
                // Everything pending: nothing evictable.
                None => break,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.records.len()
    }

    pub async fn clear(&self) {
        self.records.lock().await.records.clear();
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(session: &str, key: Option<&str>, params: serde_json::Value) -> CoreRequest {
        CoreRequest {
            request_id: "r".to_string(),
            session_id: session.to_string(),
            session_profile: None,
            session_origin: None,
            client_version: String::new(),
            capability: "jobs".to_string(),
            method: "submit".to_string(),
            params,
            idempotency_key: key.map(str::to_string),
        }
    }

    #[test]
    fn test_cache_key_requires_nonempty() {
        assert!(IdempotencyCache::cache_key(&request("s", None, serde_json::json!({}))).is_none());
        assert!(
            IdempotencyCache::cache_key(&request("s", Some("  "), serde_json::json!({}))).is_none()
        );
        let key =
            IdempotencyCache::cache_key(&request("s", Some("k1"), serde_json::json!({}))).unwrap();
        assert_eq!(key, ("s".to_string(), "k1".to_string()));
    }

    #[test]
    fn test_fingerprint_is_key_order_independent() {
        let a = request("s", Some("k"), serde_json::json!({"x": 1, "y": 2}));
        let b = request("s", Some("k"), serde_json::json!({"y": 2, "x": 1}));
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = request("s", Some("k"), serde_json::json!({"x": 1, "y": 3}));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[tokio::test]
    async fn test_owner_then_cached() {
        let cache = IdempotencyCache::new();
        let key = ("s".to_string(), "k1".to_string());

        assert!(matches!(cache.reserve(&key, "fp").await, Reservation::Owner));
        cache
            .store(
                &key,
                CachedResponse {
                    ok: true,
                    result: Some(serde_json::json!({"job_id": "j1"})),
                    error_code: None,
                    error_message: None,
                },
            )
            .await;

        match cache.reserve(&key, "fp").await {
            Reservation::Cached(cached) => {
                let response = cached.to_response("r2");
                assert!(response.ok);
                assert_eq!(response.result.unwrap()["job_id"], "j1");
            }
            _ => panic!("expected cached"),
        }
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch() {
        let cache = IdempotencyCache::new();
        let key = ("s".to_string(), "k1".to_string());
        assert!(matches!(cache.reserve(&key, "fp1").await, Reservation::Owner));
        assert!(matches!(
            cache.reserve(&key, "fp2").await,
            Reservation::FingerprintMismatch
        ));
    }

    #[tokio::test]
    async fn test_concurrent_waiter_receives_owner_result() {
        let cache = std::sync::Arc::new(IdempotencyCache::new());
        let key = ("s".to_string(), "k1".to_string());

        assert!(matches!(cache.reserve(&key, "fp").await, Reservation::Owner));
        let Reservation::Waiter(mut rx) = cache.reserve(&key, "fp").await else {
            panic!("expected waiter");
        };

        let store_cache = std::sync::Arc::clone(&cache);
        let store_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            store_cache
                .store(
                    &store_key,
                    CachedResponse {
                        ok: true,
                        result: Some(serde_json::json!({"n": 1})),
                        error_code: None,
                        error_message: None,
                    },
                )
                .await;
        });

        rx.changed().await.unwrap();
        let cached = rx.borrow().clone().unwrap();
        assert!(cached.ok);
        assert_eq!(cached.result.unwrap()["n"], 1);
    }

    #[tokio::test]
    async fn test_failure_responses_are_cached_too() {
        let cache = IdempotencyCache::new();
        let key = ("s".to_string(), "k1".to_string());
        cache.reserve(&key, "fp").await;
        cache
            .store(
                &key,
                CachedResponse {
                    ok: false,
                    result: None,
                    error_code: Some("NOT_FOUND".to_string()),
                    error_message: Some("gone".to_string()),
                },
            )
            .await;

        match cache.reserve(&key, "fp").await {
            Reservation::Cached(cached) => {
                let response = cached.to_response("r9");
                assert!(!response.ok);
                assert_eq!(response.error_code(), Some("NOT_FOUND"));
            }
            _ => panic!("expected cached"),
        }
    }

    #[tokio::test]
    async fn test_lru_eviction_skips_pending() {
        let cache = IdempotencyCache::with_limit(2);
        let pending_key = ("s".to_string(), "pending".to_string());
        cache.reserve(&pending_key, "fp").await; // stays pending

        for i in 0..3 {
            let key = ("s".to_string(), format!("k{i}"));
            cache.reserve(&key, "fp").await;
            cache
                .store(
                    &key,
                    CachedResponse {
                        ok: true,
                        result: None,
                        error_code: None,
                        error_message: None,
                    },
                )
                .await;
        }

        // Bound holds (pending entry may push us to limit+1 at most since
        // only settled entries are evictable).
        assert!(cache.len().await <= 3);
        // The pending entry survived.
        assert!(matches!(
            cache.reserve(&pending_key, "fp").await,
            Reservation::Waiter(_) | Reservation::Owner
        ));
    }
}
