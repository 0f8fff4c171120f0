//! Agent metadata enrichment, cached the same way as the asset lookup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{Enricher, TtlCache};
use crate::assets::repository::AssetRepository;
use crate::error::{CoreError, Result};
use crate::models::{AgentContext, RawEvent};

pub struct AgentEnricher {
    repository: Arc<dyn AssetRepository>,
    cache: TtlCache<(Uuid, String), Option<AgentContext>>,
    lookup_timeout: Duration,
}

impl AgentEnricher {
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
}

#[async_trait]
impl Enricher for AgentEnricher {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn enrich(&self, event: &mut RawEvent) -> Result<()> {
        let Ok(tenant) = Uuid::parse_str(&event.tenant_id) else {
            return Ok(());
        };
        let key = (tenant, event.agent_id.clone());

        if let Some(cached) = self.cache.get(&key) {
            event.enrichment.agent = cached;
            return Ok(());
        }

        let lookup = self.repository.find_by_agent_id(tenant, &event.agent_id);
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Err(_) => Err(CoreError::timeout("agent lookup exceeded deadline")),
            Ok(Err(CoreError::AssetNotFound(_))) => {
                self.cache.put(key, None);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(asset)) => {
                let context = AgentContext {
                    version: asset.agent_version.clone(),
                    hostname: asset.hostname.clone(),
                };
                self.cache.put(key, Some(context.clone()));
                event.enrichment.agent = Some(context);
                Ok(())
            }
        }
    }
}
