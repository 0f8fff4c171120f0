//! Pluggable per-event augmentation.
//!
//! Enrichers run in a fixed order and are fail-open: a failing enricher is
//! logged and counted, and the event continues with whatever enrichment it
//! already has.

pub mod agent;
pub mod asset;
#[cfg(feature = "geoip")]
pub mod geoip;

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::Result;
use crate::metrics;
use crate::models::RawEvent;

#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &'static str;

    fn enabled(&self) -> bool {
        true
    }

    /// Mutate the event's enrichment side-bag in place.
    async fn enrich(&self, event: &mut RawEvent) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Ordered, fail-open chain of enrichers.
pub struct EnricherChain {
    enrichers: Vec<Box<dyn Enricher>>,
}

impl EnricherChain {
    pub fn new(enrichers: Vec<Box<dyn Enricher>>) -> Self {
        Self { enrichers }
    }

    pub async fn apply(&self, event: &mut RawEvent) {
        for enricher in &self.enrichers {
            if !enricher.enabled() {
                continue;
            }
            if let Err(e) = enricher.enrich(event).await {
                metrics::inc_enrich_failure(enricher.name());
                tracing::warn!(
                    enricher = enricher.name(),
                    event_id = %event.event_id,
                    error = %e,
                    "enrichment failed, continuing"
                );
            }
        }
    }

    pub async fn close(&self) {
        for enricher in &self.enrichers {
            if let Err(e) = enricher.close().await {
                tracing::warn!(enricher = enricher.name(), error = %e, "enricher close failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.enrichers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enrichers.is_empty()
    }
}

/// Bounded read-through cache with per-entry TTL, shared by the asset and
/// agent enrichers. Misses and lookup failures are cached as `None` so a
/// cold agent cannot stall the chain on every event.
pub(crate) struct TtlCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, (Instant, V)>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { inner: Mutex::new(LruCache::new(capacity)), ttl }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock();
        match cache.get(key) {
            Some((stamped, value)) if stamped.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: K, value: V) {
        self.inner.lock().put(key, (Instant::now(), value));
    }
}
