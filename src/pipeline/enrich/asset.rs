//! Asset-registry enrichment with a read-through TTL cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{Enricher, TtlCache};
use crate::assets::repository::AssetRepository;
use crate::error::{CoreError, Result};
use crate::models::{Asset, AssetContext, RawEvent};

pub struct AssetEnricher {
    repository: Arc<dyn AssetRepository>,
    cache: TtlCache<(Uuid, String), Option<AssetContext>>,
    lookup_timeout: Duration,
}

impl AssetEnricher {
    pub fn new(
        repository: Arc<dyn AssetRepository>,
        cache_capacity: usize,
        cache_ttl: Duration,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            cache: TtlCache::new(cache_capacity, cache_ttl),
            lookup_timeout,
        }
    }

    fn context_for(asset: &Asset) -> AssetContext {
        AssetContext {
            hostname: asset.hostname.clone(),
            os_family: asset.os_type.as_str().to_string(),
            os_version: asset.os_version.clone(),
            department: None,
            labels: Default::default(),
            tags: Vec::new(),
        }
    }
}

#[async_trait]
impl Enricher for AssetEnricher {
    fn name(&self) -> &'static str {
        "asset"
    }

    async fn enrich(&self, event: &mut RawEvent) -> Result<()> {
        let Ok(tenant) = Uuid::parse_str(&event.tenant_id) else {
            return Ok(());
        };
        let key = (tenant, event.agent_id.clone());

        if let Some(cached) = self.cache.get(&key) {
            event.enrichment.asset = cached;
            return Ok(());
        }

        let lookup = self.repository.find_by_agent_id(tenant, &event.agent_id);
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Err(_) => Err(CoreError::timeout("asset lookup exceeded deadline")),
            Ok(Err(CoreError::AssetNotFound(_))) => {
                self.cache.put(key, None);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(asset)) => {
                let context = Self::context_for(&asset);
                self.cache.put(key, Some(context.clone()));
                event.enrichment.asset = Some(context);
                Ok(())
            }
        }
    }
}
