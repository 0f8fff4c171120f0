//! Idempotent topic bootstrap.

use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::types::RDKafkaErrorCode;

use crate::config::KafkaConfig;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    Delete,
    Compact,
}

impl CleanupPolicy {
    fn as_str(&self) -> &'static str {
        match self {
            CleanupPolicy::Delete => "delete",
            CleanupPolicy::Compact => "compact",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub retention_ms: i64,
    pub cleanup_policy: CleanupPolicy,
}

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// The topic set this deployment relies on.
pub fn default_topics(cfg: &KafkaConfig) -> Vec<TopicSpec> {
    vec![
        TopicSpec {
            name: cfg.raw_topic.clone(),
            partitions: 12,
            retention_ms: 7 * DAY_MS,
            cleanup_policy: CleanupPolicy::Delete,
        },
        TopicSpec {
            name: cfg.normalized_topic.clone(),
            partitions: 12,
            retention_ms: 7 * DAY_MS,
            cleanup_policy: CleanupPolicy::Delete,
        },
        TopicSpec {
            name: cfg.alerts_topic.clone(),
            partitions: 6,
            retention_ms: 30 * DAY_MS,
            cleanup_policy: CleanupPolicy::Delete,
        },
        TopicSpec {
            name: cfg.commands_topic.clone(),
            partitions: 6,
            retention_ms: DAY_MS,
            cleanup_policy: CleanupPolicy::Delete,
        },
        TopicSpec {
            name: cfg.dlq_topic.clone(),
            partitions: 3,
            retention_ms: 30 * DAY_MS,
            cleanup_policy: CleanupPolicy::Delete,
        },
    ]
}

/// Create any missing topics with the configured partitioning, replication
/// and retention. Safe to call on every startup.
pub async fn ensure_topics(cfg: &KafkaConfig, specs: &[TopicSpec]) -> Result<()> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &cfg.brokers)
        .create()
        .map_err(|e| CoreError::config(format!("failed to create admin client: {e}")))?;

    let metadata = admin
        .inner()
        .fetch_metadata(None, Duration::from_secs(cfg.dial_timeout_secs))?;
    let existing: Vec<&str> = metadata.topics().iter().map(|t| t.name()).collect();

    let missing: Vec<&TopicSpec> = specs
        .iter()
        .filter(|spec| !existing.contains(&spec.name.as_str()))
        .collect();
    if missing.is_empty() {
        tracing::debug!("all topics present");
        return Ok(());
    }

    let retention: Vec<String> = missing.iter().map(|s| s.retention_ms.to_string()).collect();
    let new_topics: Vec<NewTopic<'_>> = missing
        .iter()
        .zip(retention.iter())
        .map(|(spec, retention_ms)| {
            NewTopic::new(
                &spec.name,
                spec.partitions,
                TopicReplication::Fixed(cfg.replication_factor),
            )
            .set("retention.ms", retention_ms)
            .set("cleanup.policy", spec.cleanup_policy.as_str())
        })
        .collect();

    let results = admin
        .create_topics(new_topics.iter(), &AdminOptions::new())
        .await?;

    for result in results {
        match result {
            Ok(name) => tracing::info!(topic = %name, "topic created"),
            Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                tracing::debug!(topic = %name, "topic already exists");
            }
            Err((name, code)) => {
                return Err(CoreError::internal(format!(
                    "failed to create topic {name}: {code}"
                )));
            }
        }
    }

    Ok(())
}
