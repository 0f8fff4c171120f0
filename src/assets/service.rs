//! Upsert-on-heartbeat and administrative asset mutations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::assets::changelog::{fields, ChangeLogStore, FieldChange};
use crate::assets::groups::GroupRepository;
use crate::assets::repository::{AssetRepository, ListAssetsOptions};
use crate::error::{CoreError, Result};
use crate::metrics;
use crate::models::{
    Asset, AssetStatus, ChangeLogEntry, ChangeLogQuery, ChangeSource, HeartbeatInfo, OsType, Page,
    RegisterAssetRequest, UpdateAssetRequest,
};
use crate::tracker::LivenessTracker;

pub struct AssetService {
    repository: Arc<dyn AssetRepository>,
    changelog: Arc<dyn ChangeLogStore>,
    tracker: Arc<dyn LivenessTracker>,
    groups: Arc<dyn GroupRepository>,
}

impl AssetService {
    pub fn new(
        repository: Arc<dyn AssetRepository>,
        changelog: Arc<dyn ChangeLogStore>,
        tracker: Arc<dyn LivenessTracker>,
        groups: Arc<dyn GroupRepository>,
    ) -> Self {
        Self { repository, changelog, tracker, groups }
    }

    /// Create the asset on first heartbeat, or diff the monitored fields
    /// and overwrite the row on every later one. Tracker and change-log
    /// failures never abort the durable update.
    pub async fn register_or_update(&self, request: RegisterAssetRequest) -> Result<Asset> {
        let tenant_id = Uuid::parse_str(&request.tenant_id)
            .map_err(|_| CoreError::invalid_request("tenant_id must be a UUID"))?;
        let os_type: OsType = request.os_type.parse()?;
        if request.agent_id.is_empty() || request.agent_id.len() > 64 {
            return Err(CoreError::invalid_request(
                "agent_id must be between 1 and 64 characters",
            ));
        }

        let asset = match self
            .repository
            .find_by_agent_id(tenant_id, &request.agent_id)
            .await
        {
            Err(CoreError::AssetNotFound(_)) => self.register(tenant_id, os_type, &request).await?,
            Err(e) => return Err(e),
            Ok(existing) => self.heartbeat_update(existing, os_type, &request).await?,
        };

        self.push_to_tracker(&asset).await;
        metrics::inc_heartbeat("ok");
        Ok(asset)
    }

    async fn register(
        &self,
        tenant_id: Uuid,
        os_type: OsType,
        request: &RegisterAssetRequest,
    ) -> Result<Asset> {
        let now = Utc::now();
        let asset = Asset {
            id: Uuid::nil(),
            tenant_id,
            agent_id: request.agent_id.clone(),
            hostname: request.hostname.clone(),
            os_type,
            os_version: request.os_version.clone(),
            architecture: request.architecture.clone().unwrap_or_default(),
            ip_addresses: request.ip_addresses.clone(),
            mac_addresses: request.mac_addresses.clone(),
            agent_version: request.agent_version.clone(),
            status: AssetStatus::Online,
            last_seen_at: Some(now),
            first_seen_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let created = self.repository.create(asset).await?;
        tracing::info!(asset_id = %created.id, agent_id = %created.agent_id, "asset registered");

        if let Err(e) = self
            .changelog
            .log(created.id, fields::STATUS, "", "registered", ChangeSource::System)
            .await
        {
            metrics::inc_changelog_failure();
            tracing::warn!(asset_id = %created.id, error = %e, "registration change-log write failed");
        }
        Ok(created)
    }

    async fn heartbeat_update(
        &self,
        existing: Asset,
        os_type: OsType,
        request: &RegisterAssetRequest,
    ) -> Result<Asset> {
        let changes = diff_monitored_fields(&existing, request);

        if !changes.is_empty() {
            if let Err(e) = self
                .changelog
                .log_multi(existing.id, &changes, ChangeSource::Agent)
                .await
            {
                metrics::inc_changelog_failure();
                tracing::warn!(asset_id = %existing.id, error = %e, "heartbeat change-log write failed");
            }
        }

        let now = Utc::now();
        let updated = Asset {
            hostname: request.hostname.clone(),
            os_type,
            os_version: request.os_version.clone(),
            architecture: request
                .architecture
                .clone()
                .unwrap_or_else(|| existing.architecture.clone()),
            ip_addresses: request.ip_addresses.clone(),
            mac_addresses: request.mac_addresses.clone(),
            agent_version: request.agent_version.clone(),
            status: AssetStatus::Online,
            last_seen_at: Some(now),
            updated_at: now,
            ..existing
        };
        self.repository.update(&updated).await
    }

    async fn push_to_tracker(&self, asset: &Asset) {
        let info = HeartbeatInfo {
            hostname: asset.hostname.clone(),
            ip: asset.ip_addresses.first().cloned().unwrap_or_default(),
            agent_version: asset.agent_version.clone(),
            os_family: asset.os_type.as_str().to_string(),
        };
        if let Err(e) = self
            .tracker
            .update_heartbeat(&asset.agent_id, &asset.tenant_id.to_string(), &info)
            .await
        {
            metrics::inc_heartbeat("tracker_error");
            tracing::warn!(agent_id = %asset.agent_id, error = %e, "tracker update failed");
        }
    }

    /// Selective administrative update; only fields that actually change
    /// are written to the audit trail, sourced `api`.
    pub async fn update_asset(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        patch: UpdateAssetRequest,
    ) -> Result<Asset> {
        let existing = self.repository.find_by_id(tenant_id, id).await?;
        let mut updated = existing.clone();
        let mut changes = Vec::new();

        if let Some(hostname) = patch.hostname {
            if hostname != existing.hostname {
                changes.push(FieldChange::new(fields::HOSTNAME, &existing.hostname, &hostname));
                updated.hostname = hostname;
            }
        }
        if let Some(os_version) = patch.os_version {
            if os_version != existing.os_version {
                changes.push(FieldChange::new(fields::OS_VERSION, &existing.os_version, &os_version));
                updated.os_version = os_version;
            }
        }
        if let Some(architecture) = patch.architecture {
            if architecture != existing.architecture {
                changes.push(FieldChange::new(
                    fields::ARCHITECTURE,
                    &existing.architecture,
                    &architecture,
                ));
                updated.architecture = architecture;
            }
        }
        if let Some(ip_addresses) = patch.ip_addresses {
            if ip_addresses != existing.ip_addresses {
                changes.push(FieldChange::new(
                    fields::IP_ADDRESSES,
                    existing.joined_ips(),
                    ip_addresses.join(","),
                ));
                updated.ip_addresses = ip_addresses;
            }
        }
        if let Some(mac_addresses) = patch.mac_addresses {
            if mac_addresses != existing.mac_addresses {
                changes.push(FieldChange::new(
                    fields::MAC_ADDRESSES,
                    existing.mac_addresses.join(","),
                    mac_addresses.join(","),
                ));
                updated.mac_addresses = mac_addresses;
            }
        }
        if let Some(agent_version) = patch.agent_version {
            if agent_version != existing.agent_version {
                changes.push(FieldChange::new(
                    fields::AGENT_VERSION,
                    &existing.agent_version,
                    &agent_version,
                ));
                updated.agent_version = agent_version;
            }
        }

        if changes.is_empty() {
            return Ok(existing);
        }

        let saved = self.repository.update(&updated).await?;
        if let Err(e) = self
            .changelog
            .log_multi(saved.id, &changes, ChangeSource::Api)
            .await
        {
            metrics::inc_changelog_failure();
            tracing::warn!(asset_id = %saved.id, error = %e, "api change-log write failed");
        }
        Ok(saved)
    }

    /// Soft-delete the asset and drop its group memberships.
    pub async fn delete_asset(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.repository.soft_delete(tenant_id, id).await?;
        let removed = self.groups.remove_asset_memberships(id).await?;
        if removed > 0 {
            tracing::debug!(asset_id = %id, removed, "group memberships removed with asset");
        }
        Ok(())
    }

    pub async fn get_asset(&self, tenant_id: Uuid, id: Uuid) -> Result<Asset> {
        self.repository.find_by_id(tenant_id, id).await
    }

    pub async fn list_assets(
        &self,
        tenant_id: Uuid,
        opts: ListAssetsOptions,
    ) -> Result<Page<Asset>> {
        self.repository.find_all(tenant_id, opts).await
    }

    pub async fn count_by_status(&self, tenant_id: Uuid) -> Result<HashMap<AssetStatus, i64>> {
        self.repository.count_by_status(tenant_id).await
    }

    pub async fn changes(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        query: ChangeLogQuery,
    ) -> Result<Page<ChangeLogEntry>> {
        // Tenant scoping happens through the asset lookup.
        let asset = self.repository.find_by_id(tenant_id, id).await?;
        self.changelog.history(asset.id, query).await
    }
}

/// Diff the monitored set. IP addresses are compared as the comma-joined
/// string of the ordered sequence.
fn diff_monitored_fields(existing: &Asset, request: &RegisterAssetRequest) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    if existing.hostname != request.hostname {
        changes.push(FieldChange::new(
            fields::HOSTNAME,
            &existing.hostname,
            &request.hostname,
        ));
    }
    if existing.os_version != request.os_version {
        changes.push(FieldChange::new(
            fields::OS_VERSION,
            &existing.os_version,
            &request.os_version,
        ));
    }
    let existing_ips = existing.joined_ips();
    let requested_ips = request.ip_addresses.join(",");
    if existing_ips != requested_ips {
        changes.push(FieldChange::new(fields::IP_ADDRESSES, existing_ips, requested_ips));
    }
    if existing.agent_version != request.agent_version {
        changes.push(FieldChange::new(
            fields::AGENT_VERSION,
            &existing.agent_version,
            &request.agent_version,
        ));
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::changelog::MockChangeLogStore;
    use crate::assets::groups::MockGroupRepository;
    use crate::assets::repository::MockAssetRepository;
    use crate::tracker::MockLivenessTracker;
    use mockall::predicate::*;

    const TENANT: &str = "11111111-2222-3333-4444-555555555555";

    fn request() -> RegisterAssetRequest {
        RegisterAssetRequest {
            agent_id: "agent-new-001".into(),
            tenant_id: TENANT.into(),
            hostname: "new-host".into(),
            os_type: "linux".into(),
            os_version: "Ubuntu 22.04".into(),
            architecture: Some("x86_64".into()),
            ip_addresses: vec!["192.168.1.100".into()],
            mac_addresses: vec!["00:11:22:33:44:55".into()],
            agent_version: "1.0.0".into(),
        }
    }

    fn existing_asset() -> Asset {
        let now = Utc::now();
        Asset {
            id: Uuid::new_v4(),
            tenant_id: Uuid::parse_str(TENANT).unwrap(),
            agent_id: "agent-new-001".into(),
            hostname: "new-host".into(),
            os_type: OsType::Linux,
            os_version: "Ubuntu 22.04".into(),
            architecture: "x86_64".into(),
            ip_addresses: vec!["192.168.1.100".into()],
            mac_addresses: vec!["00:11:22:33:44:55".into()],
            agent_version: "1.0.0".into(),
            status: AssetStatus::Online,
            last_seen_at: Some(now),
            first_seen_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn service(
        repository: MockAssetRepository,
        changelog: MockChangeLogStore,
        tracker: MockLivenessTracker,
    ) -> AssetService {
        AssetService::new(
            Arc::new(repository),
            Arc::new(changelog),
            Arc::new(tracker),
            Arc::new(MockGroupRepository::new()),
        )
    }

    #[tokio::test]
    async fn first_heartbeat_creates_asset_with_registration_entry() {
        let mut repository = MockAssetRepository::new();
        repository
            .expect_find_by_agent_id()
            .returning(|_, agent| Err(CoreError::AssetNotFound(agent.to_string())));
        repository.expect_create().returning(|mut asset| {
            asset.id = Uuid::new_v4();
            Ok(asset)
        });

        let mut changelog = MockChangeLogStore::new();
        changelog
            .expect_log()
            .with(
                always(),
                eq(fields::STATUS),
                eq(""),
                eq("registered"),
                eq(ChangeSource::System),
            )
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let mut tracker = MockLivenessTracker::new();
        tracker
            .expect_update_heartbeat()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let asset = service(repository, changelog, tracker)
            .register_or_update(request())
            .await
            .unwrap();

        assert!(!asset.id.is_nil());
        assert_eq!(asset.hostname, "new-host");
        assert_eq!(asset.status, AssetStatus::Online);
        assert!(asset.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn subsequent_heartbeat_logs_each_differing_monitored_field() {
        let mut repository = MockAssetRepository::new();
        repository
            .expect_find_by_agent_id()
            .returning(|_, _| Ok(existing_asset()));
        repository
            .expect_update()
            .withf(|asset| {
                asset.hostname == "renamed"
                    && asset.status == AssetStatus::Online
                    && asset.ip_addresses.len() == 2
            })
            .returning(|asset| Ok(asset.clone()));

        let mut changelog = MockChangeLogStore::new();
        changelog
            .expect_log_multi()
            .withf(|_, changes, source| {
                let fields: Vec<&str> =
                    changes.iter().map(|c| c.field_name.as_str()).collect();
                *source == ChangeSource::Agent
                    && changes.len() == 4
                    && fields.contains(&"hostname")
                    && fields.contains(&"os_version")
                    && fields.contains(&"ip_addresses")
                    && fields.contains(&"agent_version")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut tracker = MockLivenessTracker::new();
        tracker.expect_update_heartbeat().returning(|_, _, _| Ok(()));

        let mut updated = request();
        updated.hostname = "renamed".into();
        updated.os_version = "Ubuntu 24.04".into();
        updated.ip_addresses = vec!["192.168.1.100".into(), "10.0.0.1".into()];
        updated.agent_version = "2.0.0".into();

        let asset = service(repository, changelog, tracker)
            .register_or_update(updated)
            .await
            .unwrap();
        assert_eq!(asset.agent_version, "2.0.0");
    }

    #[tokio::test]
    async fn unchanged_heartbeat_writes_no_changelog_rows() {
        let mut repository = MockAssetRepository::new();
        repository
            .expect_find_by_agent_id()
            .returning(|_, _| Ok(existing_asset()));
        repository.expect_update().returning(|asset| Ok(asset.clone()));

        let mut changelog = MockChangeLogStore::new();
        changelog.expect_log_multi().times(0);

        let mut tracker = MockLivenessTracker::new();
        tracker.expect_update_heartbeat().returning(|_, _, _| Ok(()));

        service(repository, changelog, tracker)
            .register_or_update(request())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tracker_and_changelog_failures_do_not_abort_the_upsert() {
        let mut repository = MockAssetRepository::new();
        repository
            .expect_find_by_agent_id()
            .returning(|_, agent| Err(CoreError::AssetNotFound(agent.to_string())));
        repository.expect_create().returning(|mut asset| {
            asset.id = Uuid::new_v4();
            Ok(asset)
        });

        let mut changelog = MockChangeLogStore::new();
        changelog
            .expect_log()
            .returning(|_, _, _, _, _| Err(CoreError::internal("audit store down")));

        let mut tracker = MockLivenessTracker::new();
        tracker
            .expect_update_heartbeat()
            .returning(|_, _, _| Err(CoreError::timeout("kv unreachable")));

        let asset = service(repository, changelog, tracker)
            .register_or_update(request())
            .await
            .unwrap();
        assert_eq!(asset.status, AssetStatus::Online);
    }

    #[tokio::test]
    async fn invalid_tenant_is_rejected_before_any_lookup() {
        let mut repository = MockAssetRepository::new();
        repository.expect_find_by_agent_id().times(0);

        let mut bad = request();
        bad.tenant_id = "not-a-uuid".into();

        let err = service(repository, MockChangeLogStore::new(), MockLivenessTracker::new())
            .register_or_update(bad)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn api_update_logs_only_fields_that_changed() {
        let existing = existing_asset();
        let tenant = existing.tenant_id;
        let id = existing.id;

        let mut repository = MockAssetRepository::new();
        let lookup = existing.clone();
        repository
            .expect_find_by_id()
            .returning(move |_, _| Ok(lookup.clone()));
        repository.expect_update().returning(|asset| Ok(asset.clone()));

        let mut changelog = MockChangeLogStore::new();
        changelog
            .expect_log_multi()
            .withf(|_, changes, source| {
                *source == ChangeSource::Api
                    && changes.len() == 1
                    && changes[0].field_name == "hostname"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let patch = UpdateAssetRequest {
            hostname: Some("patched".into()),
            os_version: Some(existing.os_version.clone()),
            ..Default::default()
        };
        let updated = service(repository, changelog, MockLivenessTracker::new())
            .update_asset(tenant, id, patch)
            .await
            .unwrap();
        assert_eq!(updated.hostname, "patched");
    }

    #[tokio::test]
    async fn delete_asset_removes_group_memberships() {
        let mut repository = MockAssetRepository::new();
        repository.expect_soft_delete().returning(|_, _| Ok(()));

        let mut groups = MockGroupRepository::new();
        groups
            .expect_remove_asset_memberships()
            .times(1)
            .returning(|_| Ok(2));

        let service = AssetService::new(
            Arc::new(repository),
            Arc::new(MockChangeLogStore::new()),
            Arc::new(MockLivenessTracker::new()),
            Arc::new(groups),
        );
        service
            .delete_asset(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
    }
}
