//! Per-turn context.
//!
//! A [`TurnContext`] lives for exactly one inbound activity. Components that
//! need turn-scoped caches (frames, change trackers) reserve a [`CacheKey`]
//! once at construction and look their entry up through
//! [`TurnContext::service`]. Entries vanish with the context, so nothing
//! cached for one turn can leak into another.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use crate::activity::Activity;
use crate::clock::{Clock, SystemClock};

static NEXT_CACHE_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique key for a component's slot in the turn's service cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    /// Reserve a fresh key. Two calls never return the same key.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_CACHE_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

type Service = Arc<dyn Any + Send + Sync>;

/// Everything the engine knows about the turn in flight.
pub struct TurnContext {
    id: Uuid,
    activity: Activity,
    clock: Arc<dyn Clock>,
    services: DashMap<CacheKey, Service>,
}

impl TurnContext {
    /// Context for `activity` using wall-clock time.
    pub fn new(activity: Activity) -> Self {
        Self::with_clock(activity, Arc::new(SystemClock))
    }

    pub fn with_clock(activity: Activity, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: Uuid::now_v7(),
            activity,
            clock,
            services: DashMap::new(),
        }
    }

    /// Unique id of this turn (time-ordered).
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Current time according to the turn's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Fetch the turn-scoped value under `key`, creating it on first use.
    pub fn service<T>(&self, key: CacheKey) -> Arc<T>
    where
        T: Any + Send + Sync + Default,
    {
        let entry: Service = self
            .services
            .entry(key)
            .or_insert_with(|| Arc::new(T::default()) as Service)
            .value()
            .clone();

        match entry.downcast::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(?key, "turn cache entry had an unexpected type; replacing it");
                let fresh = Arc::new(T::default());
                self.services.insert(key, fresh.clone() as Service);
                fresh
            }
        }
    }

    /// Whether anything has been cached under `key` this turn.
    pub fn has_service(&self, key: CacheKey) -> bool {
        self.services.contains_key(&key)
    }
}

impl std::fmt::Debug for TurnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnContext")
            .field("id", &self.id)
            .field("activity", &self.activity)
            .field("services", &self.services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ctx() -> TurnContext {
        TurnContext::new(Activity::message("cli", "bot", "alice", "c1", "hi"))
    }

    #[test]
    fn cache_keys_are_unique() {
        let a = CacheKey::new();
        let b = CacheKey::new();
        assert_ne!(a, b);
    }

    #[test]
    fn service_is_created_once_per_turn() {
        let key = CacheKey::new();
        let ctx = ctx();
        assert!(!ctx.has_service(key));

        let first = ctx.service::<Mutex<u32>>(key);
        *first.lock().unwrap() = 7;
        let second = ctx.service::<Mutex<u32>>(key);
        assert_eq!(*second.lock().unwrap(), 7);
        assert!(ctx.has_service(key));
    }

    #[test]
    fn services_do_not_leak_between_turns() {
        let key = CacheKey::new();
        let one = ctx();
        *one.service::<Mutex<u32>>(key).lock().unwrap() = 3;

        let two = ctx();
        assert_eq!(*two.service::<Mutex<u32>>(key).lock().unwrap(), 0);
        assert_ne!(one.id(), two.id());
    }
}
