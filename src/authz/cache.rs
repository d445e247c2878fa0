use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;

use super::value_set::PermissionValueSet;
use crate::events::{event_name, payload_field};

struct CacheEntry {
    set: Arc<PermissionValueSet>,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    generation: u64,
    user_generations: HashMap<String, u64>,
}

impl CacheState {
    fn generation_of(&self, username: &str) -> CacheGeneration {
        CacheGeneration {
            global: self.generation,
            user: self.user_generations.get(username).copied().unwrap_or(0),
        }
    }
}

/// Invalidation counters observed before a load started.
///
/// A set built from that load is only stored while both counters are unchanged,
/// so an invalidation that lands mid-load cannot be undone by a stale result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeneration {
    global: u64,
    user: u64,
}

/// Short-lived per-user cache of built permission sets.
///
/// Entries expire after the TTL and are dropped explicitly when a user's
/// memberships change (that user only) or when any grant or role changes
/// (everyone).
pub struct PermissionSetCache {
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl PermissionSetCache {
    const MAX_ENTRIES: usize = 10_000;

    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, username: &str) -> Option<Arc<PermissionValueSet>> {
        let now = Instant::now();
        self.state.read().ok().and_then(|state| {
            state
                .entries
                .get(username)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| Arc::clone(&entry.set))
        })
    }

    /// Snapshot to take before loading `username`'s grants.
    pub fn generation(&self, username: &str) -> CacheGeneration {
        self.state
            .read()
            .map(|state| state.generation_of(username))
            .unwrap_or(CacheGeneration { global: u64::MAX, user: u64::MAX })
    }

    pub fn put(&self, username: &str, set: Arc<PermissionValueSet>) {
        let seen = self.generation(username);
        self.put_if_current(username, seen, set);
    }

    /// Stores `set` unless `username` was invalidated since `seen` was taken.
    pub fn put_if_current(&self, username: &str, seen: CacheGeneration, set: Arc<PermissionValueSet>) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        if state.generation_of(username) != seen {
            tracing::debug!(username = %username, "permission set invalidated during load, not cached");
            return false;
        }
        if state.entries.len() >= Self::MAX_ENTRIES {
            let now = Instant::now();
            state.entries.retain(|_, entry| entry.expires_at > now);
            if state.entries.len() >= Self::MAX_ENTRIES {
                state.entries.clear();
            }
        }
        state.entries.insert(
            username.to_string(),
            CacheEntry {
                set,
                expires_at: Instant::now() + self.ttl,
            },
        );
        true
    }

    pub fn invalidate_user(&self, username: &str) {
        if let Ok(mut state) = self.state.write() {
            if state.user_generations.len() >= Self::MAX_ENTRIES && !state.user_generations.contains_key(username) {
                // fold per-user counters into one global bump
                state.user_generations.clear();
                state.generation = state.generation.wrapping_add(1);
            }
            let counter = state.user_generations.entry(username.to_string()).or_insert(0);
            *counter = counter.wrapping_add(1);
            if state.entries.remove(username).is_some() {
                tracing::debug!(username = %username, "permission set invalidated");
            }
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut state) = self.state.write() {
            state.generation = state.generation.wrapping_add(1);
            state.user_generations.clear();
            let dropped = state.entries.len();
            state.entries.clear();
            tracing::debug!(dropped, "all permission sets invalidated");
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies the invalidation implied by one domain event.
    pub fn apply_event(&self, event: &Value) {
        let name = event_name(event);
        let (entity, action) = name.split_once('.').unwrap_or((name, ""));
        match (entity, action) {
            ("user_role", _) | ("user", "updated") | ("user", "deleted") => match payload_field(event, "username") {
                Some(username) => self.invalidate_user(username),
                None => self.invalidate_all(),
            },
            ("permission", _) | ("role", "deleted") | ("role", "updated") => self.invalidate_all(),
            _ => {}
        }
    }
}

/// Invalidates `cache` from domain events until the bus closes.
pub async fn start_invalidation_listener(mut rx: broadcast::Receiver<Value>, cache: Arc<PermissionSetCache>) {
    loop {
        match rx.recv().await {
            Ok(event) => cache.apply_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // missed events may have been invalidations
                tracing::warn!(skipped, "invalidation listener lagged, clearing permission cache");
                cache.invalidate_all();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set() -> Arc<PermissionValueSet> {
        Arc::new(PermissionValueSet::empty())
    }

    #[test]
    fn returns_what_was_put() {
        let cache = PermissionSetCache::new(Duration::from_secs(60));
        let alice = set();
        cache.put("alice", Arc::clone(&alice));
        assert!(Arc::ptr_eq(&cache.get("alice").unwrap(), &alice));
        assert!(cache.get("bob").is_none());
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = PermissionSetCache::new(Duration::from_millis(1));
        cache.put("alice", set());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("alice").is_none());
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = PermissionSetCache::new(Duration::ZERO);
        cache.put("alice", set());
        assert!(cache.is_empty());
    }

    #[test]
    fn membership_events_invalidate_one_user() {
        let cache = PermissionSetCache::new(Duration::from_secs(60));
        cache.put("alice", set());
        cache.put("bob", set());

        cache.apply_event(&json!({"name": "user_role.created", "payload": {"new": {"username": "alice"}}}));

        assert!(cache.get("alice").is_none());
        assert!(cache.get("bob").is_some());
    }

    #[test]
    fn grant_events_invalidate_everyone() {
        let cache = PermissionSetCache::new(Duration::from_secs(60));
        cache.put("alice", set());
        cache.put("bob", set());

        cache.apply_event(&json!({"name": "permission.deleted", "payload": {"new": {"feature_fqn": "com.acme"}}}));
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidation_during_load_discards_the_result() {
        let cache = PermissionSetCache::new(Duration::from_secs(60));

        let seen = cache.generation("alice");
        cache.invalidate_user("alice");
        assert!(!cache.put_if_current("alice", seen, set()));
        assert!(cache.get("alice").is_none());

        let seen = cache.generation("alice");
        let bob_seen = cache.generation("bob");
        cache.invalidate_all();
        assert!(!cache.put_if_current("alice", seen, set()));
        assert!(!cache.put_if_current("bob", bob_seen, set()));
        assert!(cache.is_empty());

        let seen = cache.generation("alice");
        cache.invalidate_user("bob");
        assert!(cache.put_if_current("alice", seen, set()));
        assert!(cache.get("alice").is_some());
    }

    #[test]
    fn unrelated_events_keep_entries() {
        let cache = PermissionSetCache::new(Duration::from_secs(60));
        cache.put("alice", set());
        cache.apply_event(&json!({"name": "role.created", "payload": {"new": {"name": "clerk"}}}));
        cache.apply_event(&json!({"name": "tenancy.created", "payload": {"new": {"path": "/uk"}}}));
        assert_eq!(cache.len(), 1);
    }
}
