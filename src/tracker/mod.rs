//! Agent online-state tracking backed by the KV store.
//!
//! One hash per agent under `agent:status:{agent_id}` with the heartbeat
//! TTL, plus a per-tenant sorted set `agents:online:{tenant_id}` scored by
//! heartbeat epoch seconds. Both writes go out in one pipelined unit;
//! partial application is repaired by the next heartbeat.

pub mod reconciler;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::TrackerConfig;
use crate::error::{CoreError, Result};
use crate::models::{HeartbeatInfo, OnlineRecord};

fn status_key(agent_id: &str) -> String {
    format!("agent:status:{agent_id}")
}

fn online_key(tenant_id: &str) -> String {
    format!("agents:online:{tenant_id}")
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait LivenessTracker: Send + Sync {
    /// Record a heartbeat: refresh the status hash (with TTL) and the
    /// tenant's sorted set in one atomic pipelined unit.
    async fn update_heartbeat(
        &self,
        agent_id: &str,
        tenant_id: &str,
        info: &HeartbeatInfo,
    ) -> Result<()>;

    async fn is_online(&self, agent_id: &str) -> Result<bool>;

    async fn get_status(&self, agent_id: &str) -> Result<Option<OnlineRecord>>;

    /// Agents whose heartbeat falls inside the liveness window.
    async fn list_online(&self, tenant_id: &str) -> Result<Vec<String>>;

    async fn count_online(&self, tenant_id: &str) -> Result<u64>;
}

pub struct RedisTracker {
    conn: ConnectionManager,
    ttl: Duration,
    server_id: String,
}

impl RedisTracker {
    pub async fn connect(url: &str, cfg: &TrackerConfig) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CoreError::config(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(ttl_secs = cfg.heartbeat_ttl_secs, "online-state tracker connected");
        Ok(Self {
            conn,
            ttl: Duration::from_secs(cfg.heartbeat_ttl_secs),
            server_id: cfg.server_id.clone(),
        })
    }

    fn window_start(&self, now: i64) -> i64 {
        now - self.ttl.as_secs() as i64
    }
}

#[async_trait]
impl LivenessTracker for RedisTracker {
    async fn update_heartbeat(
        &self,
        agent_id: &str,
        tenant_id: &str,
        info: &HeartbeatInfo,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let fields: Vec<(&str, String)> = vec![
            ("agent_id", agent_id.to_string()),
            ("tenant_id", tenant_id.to_string()),
            ("status", "online".to_string()),
            ("last_heartbeat", now.to_string()),
            ("hostname", info.hostname.clone()),
            ("ip", info.ip.clone()),
            ("agent_version", info.agent_version.clone()),
            ("os_family", info.os_family.clone()),
            ("connected_server", self.server_id.clone()),
        ];

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(status_key(agent_id), &fields)
            .ignore()
            .cmd("EXPIRE")
            .arg(status_key(agent_id))
            .arg(self.ttl.as_secs())
            .ignore()
            .zadd(online_key(tenant_id), agent_id, now)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_online(&self, agent_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(status_key(agent_id)).await?;
        Ok(exists)
    }

    async fn get_status(&self, agent_id: &str) -> Result<Option<OnlineRecord>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(status_key(agent_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        let get = |k: &str| map.get(k).cloned().unwrap_or_default();
        Ok(Some(OnlineRecord {
            agent_id: get("agent_id"),
            tenant_id: get("tenant_id"),
            status: get("status"),
            last_heartbeat: get("last_heartbeat").parse().unwrap_or_default(),
            hostname: get("hostname"),
            ip: get("ip"),
            agent_version: get("agent_version"),
            os_family: get("os_family"),
            connected_server: get("connected_server"),
        }))
    }

    async fn list_online(&self, tenant_id: &str) -> Result<Vec<String>> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn.clone();
        let agents: Vec<String> = conn
            .zrangebyscore(online_key(tenant_id), self.window_start(now), now)
            .await?;
        Ok(agents)
    }

    async fn count_online(&self, tenant_id: &str) -> Result<u64> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn.clone();
        let count: u64 = conn
            .zcount(online_key(tenant_id), self.window_start(now), now)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_keys_follow_the_documented_layout() {
        assert_eq!(status_key("agent-7"), "agent:status:agent-7");
        assert_eq!(online_key("tenant-a"), "agents:online:tenant-a");
    }
}
