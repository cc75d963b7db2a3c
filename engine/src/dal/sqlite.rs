use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::SqlitePool;

use zane_common::{DeploymentChange, DeploymentStatus};

use super::{ArchivedProject, ArchivedService, Dal, Deployment, DeploymentChangeRow};
use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS deployments (
    hash TEXT PRIMARY KEY,
    service_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    slot TEXT NOT NULL,
    status TEXT NOT NULL,
    status_reason TEXT,
    queued_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    is_current_production INTEGER NOT NULL DEFAULT 0,
    url TEXT,
    auth_token TEXT NOT NULL DEFAULT '',
    service_snapshot TEXT NOT NULL,
    commit_sha TEXT,
    commit_message TEXT,
    commit_author_name TEXT,
    build_started_at TEXT,
    build_finished_at TEXT,
    ignore_build_cache INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_deployments_service_queued
    ON deployments (service_id, queued_at);

CREATE TABLE IF NOT EXISTS deployment_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    deployment_hash TEXT NOT NULL REFERENCES deployments (hash) ON DELETE CASCADE,
    field TEXT NOT NULL,
    change_type TEXT NOT NULL,
    item_id TEXT,
    new_value TEXT,
    old_value TEXT
);

CREATE TABLE IF NOT EXISTS archived_projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    original_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS archived_services (
    original_id TEXT PRIMARY KEY,
    archived_project_id INTEGER NOT NULL REFERENCES archived_projects (id) ON DELETE CASCADE,
    project_original_id TEXT NOT NULL,
    urls TEXT NOT NULL DEFAULT '[]',
    deployment_urls TEXT NOT NULL DEFAULT '[]',
    deployment_hashes TEXT NOT NULL DEFAULT '[]',
    volume_ids TEXT NOT NULL DEFAULT '[]'
);
"#;

#[derive(Clone)]
pub struct SqliteDal {
    pool: SqlitePool,
}

impl SqliteDal {
    pub async fn new(state_uri: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(state_uri)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// A fresh in-memory database on a single connection, for tests.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(sqlx::Error::from)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Dal for SqliteDal {
    async fn insert_project(&self, project_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO projects (id) VALUES (?)")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn project_exists(&self, project_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn insert_deployment(
        &self,
        deployment: &Deployment,
        changes: &[DeploymentChange],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO deployments (
                hash, service_id, project_id, slot, status, status_reason,
                queued_at, started_at, finished_at, is_current_production, url,
                auth_token, service_snapshot, commit_sha, commit_message,
                commit_author_name, build_started_at, build_finished_at,
                ignore_build_cache
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&deployment.hash)
        .bind(&deployment.service_id)
        .bind(&deployment.project_id)
        .bind(deployment.slot)
        .bind(deployment.status)
        .bind(&deployment.status_reason)
        .bind(deployment.queued_at)
        .bind(deployment.started_at)
        .bind(deployment.finished_at)
        .bind(deployment.is_current_production)
        .bind(&deployment.url)
        .bind(&deployment.auth_token)
        .bind(&deployment.service_snapshot)
        .bind(&deployment.commit_sha)
        .bind(&deployment.commit_message)
        .bind(&deployment.commit_author_name)
        .bind(deployment.build_started_at)
        .bind(deployment.build_finished_at)
        .bind(deployment.ignore_build_cache)
        .execute(&mut *tx)
        .await?;

        for change in changes {
            sqlx::query(
                r#"INSERT INTO deployment_changes
                    (deployment_hash, field, change_type, item_id, new_value, old_value)
                VALUES (?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&deployment.hash)
            .bind(change.field)
            .bind(change.change_type)
            .bind(&change.item_id)
            .bind(change.new_value.clone().map(Json))
            .bind(change.old_value.clone().map(Json))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn deployment(&self, hash: &str) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as("SELECT * FROM deployments WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(deployment)
    }

    async fn deployment_changes(&self, hash: &str) -> Result<Vec<DeploymentChange>> {
        let rows: Vec<DeploymentChangeRow> = sqlx::query_as(
            r#"SELECT field, change_type, item_id, new_value, old_value
            FROM deployment_changes WHERE deployment_hash = ? ORDER BY id"#,
        )
        .bind(hash)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_preparing(&self, hash: &str) -> Result<Option<Deployment>> {
        sqlx::query(
            "UPDATE deployments SET status = ?, started_at = ? WHERE hash = ? AND status = ?",
        )
        .bind(DeploymentStatus::Preparing)
        .bind(Utc::now())
        .bind(hash)
        .bind(DeploymentStatus::Queued)
        .execute(&self.pool)
        .await?;

        self.deployment(hash).await
    }

    async fn set_status(
        &self,
        hash: &str,
        status: DeploymentStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE deployments SET status = ?, status_reason = ? WHERE hash = ?")
            .bind(status)
            .bind(reason)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn previous_deployment(
        &self,
        service_id: &str,
        before: DateTime<Utc>,
        excluding_hash: &str,
    ) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as(
            r#"SELECT * FROM deployments
            WHERE service_id = ? AND queued_at < ? AND hash <> ?
            ORDER BY queued_at DESC LIMIT 1"#,
        )
        .bind(service_id)
        .bind(before)
        .bind(excluding_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deployment)
    }

    async fn next_queued_deployment(
        &self,
        service_id: &str,
        excluding_hash: &str,
    ) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as(
            r#"SELECT * FROM deployments
            WHERE service_id = ? AND hash <> ? AND status = ?
            ORDER BY queued_at ASC LIMIT 1"#,
        )
        .bind(service_id)
        .bind(excluding_hash)
        .bind(DeploymentStatus::Queued)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deployment)
    }

    async fn current_production_deployment(
        &self,
        service_id: &str,
    ) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as(
            "SELECT * FROM deployments WHERE service_id = ? AND is_current_production = 1 LIMIT 1",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deployment)
    }

    async fn finish_deployment(
        &self,
        hash: &str,
        healthy: bool,
        reason: Option<&str>,
    ) -> Result<Option<DeploymentStatus>> {
        let mut tx = self.pool.begin().await?;

        let deployment: Option<Deployment> =
            sqlx::query_as("SELECT * FROM deployments WHERE hash = ?")
                .bind(hash)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(deployment) = deployment else {
            return Ok(None);
        };

        let sibling_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM deployments WHERE service_id = ?")
                .bind(&deployment.service_id)
                .fetch_one(&mut *tx)
                .await?;

        let status = if healthy {
            DeploymentStatus::Healthy
        } else {
            DeploymentStatus::Failed
        };
        let is_current_production = healthy || sibling_count == 1;

        sqlx::query(
            r#"UPDATE deployments
            SET status = ?, status_reason = ?, finished_at = ?, is_current_production = ?
            WHERE hash = ?"#,
        )
        .bind(status)
        .bind(reason)
        .bind(Utc::now())
        .bind(is_current_production)
        .bind(hash)
        .execute(&mut *tx)
        .await?;

        if is_current_production {
            sqlx::query(
                "UPDATE deployments SET is_current_production = 0 WHERE service_id = ? AND hash <> ?",
            )
            .bind(&deployment.service_id)
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(status))
    }

    async fn unfinished_deployments(&self) -> Result<Vec<Deployment>> {
        let deployments = sqlx::query_as(
            r#"SELECT * FROM deployments
            WHERE status IN ('QUEUED', 'PREPARING', 'STARTING', 'RESTARTING')
            ORDER BY queued_at ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(deployments)
    }

    async fn monitored_deployments(&self) -> Result<Vec<Deployment>> {
        let deployments = sqlx::query_as(
            r#"SELECT * FROM deployments
            WHERE is_current_production = 1 AND status IN ('HEALTHY', 'SLEEPING')
            ORDER BY queued_at ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(deployments)
    }

    async fn insert_archived_project(&self, original_id: &str) -> Result<i64> {
        let id: i64 =
            sqlx::query_scalar("INSERT INTO archived_projects (original_id) VALUES (?) RETURNING id")
                .bind(original_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }

    async fn archived_project(&self, id: i64) -> Result<Option<ArchivedProject>> {
        let project = sqlx::query_as("SELECT id, original_id FROM archived_projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    async fn insert_archived_service(
        &self,
        service: &ArchivedService,
        archived_project_id: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO archived_services
                (original_id, archived_project_id, project_original_id, urls,
                 deployment_urls, deployment_hashes, volume_ids)
            VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&service.original_id)
        .bind(archived_project_id)
        .bind(&service.project_original_id)
        .bind(&service.urls)
        .bind(&service.deployment_urls)
        .bind(&service.deployment_hashes)
        .bind(&service.volume_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn archived_services(&self, archived_project_id: i64) -> Result<Vec<ArchivedService>> {
        let services = sqlx::query_as(
            r#"SELECT original_id, project_original_id, urls, deployment_urls,
                deployment_hashes, volume_ids
            FROM archived_services WHERE archived_project_id = ?"#,
        )
        .bind(archived_project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(services)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use zane_common::service::{PortConfig, ServiceSnapshot};
    use zane_common::{ChangeField, ChangeType, DeploymentSlot};

    use super::*;

    fn snapshot(service_id: &str) -> ServiceSnapshot {
        ServiceSnapshot {
            id: service_id.to_string(),
            slug: service_id.to_string(),
            project_id: "p1".into(),
            environment_id: Some("production".into()),
            image: "nginx:alpine".into(),
            command: None,
            credentials: None,
            env_variables: vec![],
            volumes: vec![],
            ports: vec![PortConfig { host: None, forwarded: 80 }],
            urls: vec![],
            healthcheck: None,
            resource_limits: None,
            network_alias: service_id.to_string(),
            network_aliases: vec![service_id.to_string()],
        }
    }

    fn deployment(hash: &str, service_id: &str, slot: DeploymentSlot) -> Deployment {
        Deployment {
            hash: hash.to_string(),
            service_id: service_id.to_string(),
            project_id: "p1".into(),
            slot,
            status: DeploymentStatus::Queued,
            status_reason: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            is_current_production: false,
            url: None,
            auth_token: "token".into(),
            service_snapshot: Json(snapshot(service_id)),
            commit_sha: None,
            commit_message: None,
            commit_author_name: None,
            build_started_at: None,
            build_finished_at: None,
            ignore_build_cache: false,
        }
    }

    #[tokio::test]
    async fn deployments_round_trip_with_changes() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        let changes = vec![DeploymentChange {
            field: ChangeField::Volumes,
            change_type: ChangeType::Delete,
            item_id: Some("vol_a".into()),
            new_value: None,
            old_value: Some(serde_json::json!({"container_path": "/data"})),
        }];

        dal.insert_deployment(&deployment("dpl_dkr_h1", "app", DeploymentSlot::Blue), &changes)
            .await
            .unwrap();

        let loaded = dal.deployment("dpl_dkr_h1").await.unwrap().unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Queued);
        assert_eq!(loaded.service().network_alias, "app");

        let loaded_changes = dal.deployment_changes("dpl_dkr_h1").await.unwrap();
        assert_eq!(loaded_changes, changes);
    }

    #[tokio::test]
    async fn prepare_only_transitions_queued_rows() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        dal.insert_deployment(&deployment("dpl_dkr_h1", "app", DeploymentSlot::Blue), &[])
            .await
            .unwrap();

        let prepared = dal.mark_preparing("dpl_dkr_h1").await.unwrap().unwrap();
        assert_eq!(prepared.status, DeploymentStatus::Preparing);
        assert!(prepared.started_at.is_some());

        // A second call leaves the row alone.
        dal.set_status("dpl_dkr_h1", DeploymentStatus::Starting, None).await.unwrap();
        let untouched = dal.mark_preparing("dpl_dkr_h1").await.unwrap().unwrap();
        assert_eq!(untouched.status, DeploymentStatus::Starting);

        assert!(dal.mark_preparing("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finishing_healthy_flips_production_exclusively() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        let mut first = deployment("dpl_dkr_h1", "app", DeploymentSlot::Blue);
        first.is_current_production = true;
        dal.insert_deployment(&first, &[]).await.unwrap();

        let mut second = deployment("dpl_dkr_h2", "app", DeploymentSlot::Green);
        second.queued_at = first.queued_at + chrono::Duration::seconds(5);
        dal.insert_deployment(&second, &[]).await.unwrap();

        let status = dal.finish_deployment("dpl_dkr_h2", true, None).await.unwrap().unwrap();
        assert_eq!(status, DeploymentStatus::Healthy);

        let first = dal.deployment("dpl_dkr_h1").await.unwrap().unwrap();
        let second = dal.deployment("dpl_dkr_h2").await.unwrap().unwrap();
        assert!(!first.is_current_production);
        assert!(second.is_current_production);
        assert!(second.finished_at.is_some());

        let production = dal.current_production_deployment("app").await.unwrap().unwrap();
        assert_eq!(production.hash, "dpl_dkr_h2");
    }

    #[tokio::test]
    async fn failed_only_deployment_still_becomes_production() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        dal.insert_deployment(&deployment("dpl_dkr_h1", "app", DeploymentSlot::Blue), &[])
            .await
            .unwrap();

        let status = dal
            .finish_deployment("dpl_dkr_h1", false, Some("probe failed"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, DeploymentStatus::Failed);

        let row = dal.deployment("dpl_dkr_h1").await.unwrap().unwrap();
        assert!(row.is_current_production);
        assert_eq!(row.status_reason.as_deref(), Some("probe failed"));
    }

    #[tokio::test]
    async fn previous_and_next_queued_queries_respect_order() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        let base = Utc::now();

        let mut first = deployment("dpl_dkr_h1", "app", DeploymentSlot::Blue);
        first.queued_at = base;
        let mut second = deployment("dpl_dkr_h2", "app", DeploymentSlot::Green);
        second.queued_at = base + chrono::Duration::seconds(10);
        let mut third = deployment("dpl_dkr_h3", "app", DeploymentSlot::Blue);
        third.queued_at = base + chrono::Duration::seconds(20);

        for row in [&first, &second, &third] {
            dal.insert_deployment(row, &[]).await.unwrap();
        }

        let previous = dal
            .previous_deployment("app", third.queued_at, "dpl_dkr_h3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(previous.hash, "dpl_dkr_h2");

        // Oldest QUEUED sibling wins the drain.
        let next = dal.next_queued_deployment("app", "dpl_dkr_h1").await.unwrap().unwrap();
        assert_eq!(next.hash, "dpl_dkr_h2");

        dal.set_status("dpl_dkr_h2", DeploymentStatus::Cancelled, None).await.unwrap();
        let next = dal.next_queued_deployment("app", "dpl_dkr_h1").await.unwrap().unwrap();
        assert_eq!(next.hash, "dpl_dkr_h3");
    }

    #[tokio::test]
    async fn unfinished_deployments_are_requeue_candidates() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        let mut active = deployment("dpl_dkr_h1", "app", DeploymentSlot::Blue);
        active.status = DeploymentStatus::Starting;
        dal.insert_deployment(&active, &[]).await.unwrap();

        let mut done = deployment("dpl_dkr_h2", "other", DeploymentSlot::Blue);
        done.status = DeploymentStatus::Healthy;
        dal.insert_deployment(&done, &[]).await.unwrap();

        let unfinished = dal.unfinished_deployments().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].hash, "dpl_dkr_h1");
    }

    #[tokio::test]
    async fn monitored_deployments_are_the_live_production_rows() {
        let dal = SqliteDal::new_in_memory().await.unwrap();

        let mut healthy = deployment("dpl_dkr_h1", "app", DeploymentSlot::Blue);
        healthy.status = DeploymentStatus::Healthy;
        healthy.is_current_production = true;
        dal.insert_deployment(&healthy, &[]).await.unwrap();

        let mut sleeping = deployment("dpl_dkr_h2", "worker", DeploymentSlot::Blue);
        sleeping.status = DeploymentStatus::Sleeping;
        sleeping.is_current_production = true;
        dal.insert_deployment(&sleeping, &[]).await.unwrap();

        let mut replaced = deployment("dpl_dkr_h3", "app", DeploymentSlot::Green);
        replaced.status = DeploymentStatus::Removed;
        dal.insert_deployment(&replaced, &[]).await.unwrap();

        let monitored = dal.monitored_deployments().await.unwrap();
        let hashes: Vec<&str> = monitored.iter().map(|row| row.hash.as_str()).collect();
        assert_eq!(hashes, vec!["dpl_dkr_h1", "dpl_dkr_h2"]);
    }

    #[tokio::test]
    async fn archived_rows_round_trip() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        let project_id = dal.insert_archived_project("p1").await.unwrap();

        let service = ArchivedService {
            original_id: "app".into(),
            project_original_id: "p1".into(),
            urls: Json(vec![]),
            deployment_urls: Json(vec!["dpl_dkr_h1.zaneops.dev".into()]),
            deployment_hashes: Json(vec!["dpl_dkr_h1".into()]),
            volume_ids: Json(vec!["vol_a".into()]),
        };
        dal.insert_archived_service(&service, project_id).await.unwrap();

        let archived = dal.archived_project(project_id).await.unwrap().unwrap();
        assert_eq!(archived.original_id, "p1");

        let services = dal.archived_services(project_id).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].deployment_hashes.0, vec!["dpl_dkr_h1".to_string()]);
    }
}
