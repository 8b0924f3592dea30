//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `gantry-core` using sqlx with split
//! read/write pools. Workflow definitions and instance state are stored as
//! JSON blobs inside a narrow relational envelope (id, status, timestamps as
//! columns for filtering and prefix lookup).

use chrono::{DateTime, Utc};
use gantry_core::repository::workflow::WorkflowRepository;
use gantry_types::error::RepositoryError;
use gantry_types::graph::Workflow;
use gantry_types::instance::{InstanceStatus, WorkflowInstance};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Serialize a serde-tagged status enum to its storage string.
pub(crate) fn status_to_str<T: serde::Serialize>(status: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(status) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        _ => Err(RepositoryError::Query("unencodable status".to_string())),
    }
}

fn decode_workflow(row: &sqlx::sqlite::SqliteRow) -> Result<Workflow, RepositoryError> {
    let definition: String = row
        .try_get("definition")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(&definition)
        .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
}

fn decode_instance(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowInstance, RepositoryError> {
    let state: String = row
        .try_get("state")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(&state)
        .map_err(|e| RepositoryError::Query(format!("invalid instance state JSON: {e}")))
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let definition = serde_json::to_string(workflow)
            .map_err(|e| RepositoryError::Query(format!("serialize workflow: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&definition)
        .bind(format_datetime(&workflow.created_at))
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode_workflow).transpose()
    }

    async fn find_workflow(&self, id_prefix: &str) -> Result<Option<Workflow>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflows WHERE id LIKE ? || '%' LIMIT 2")
            .bind(id_prefix)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match rows.len() {
            0 => Ok(None),
            1 => decode_workflow(&rows[0]).map(Some),
            _ => Err(RepositoryError::Conflict(format!(
                "id prefix '{id_prefix}' is ambiguous"
            ))),
        }
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY id")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(decode_workflow).collect()
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let state = serde_json::to_string(instance)
            .map_err(|e| RepositoryError::Query(format!("serialize instance: {e}")))?;
        let status = status_to_str(&instance.status)?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
                 (id, workflow_id, status, state, error, created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 state = excluded.state,
                 error = excluded.error,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(instance.id.to_string())
        .bind(instance.workflow_id.to_string())
        .bind(&status)
        .bind(&state)
        .bind(&instance.error)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode_instance).transpose()
    }

    async fn find_instance(
        &self,
        id_prefix: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let rows =
            sqlx::query("SELECT state FROM workflow_instances WHERE id LIKE ? || '%' LIMIT 2")
                .bind(id_prefix)
                .fetch_all(&self.pool.reader)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match rows.len() {
            0 => Ok(None),
            1 => decode_instance(&rows[0]).map(Some),
            _ => Err(RepositoryError::Conflict(format!(
                "id prefix '{id_prefix}' is ambiguous"
            ))),
        }
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT state FROM workflow_instances WHERE status = ? ORDER BY id DESC",
                )
                .bind(status_to_str(&status)?)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT state FROM workflow_instances ORDER BY id DESC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(decode_instance).collect()
    }

    async fn delete_instance(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_types::graph::{Edge, Node, NodeKind};
    use gantry_types::instance::NodeStatus;
    use serde_json::json;
    use std::collections::HashMap;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_workflow() -> Workflow {
        Workflow {
            id: Uuid::now_v7(),
            name: "daily-digest".to_string(),
            description: Some("Gather and summarize".to_string()),
            version: "1.0.0".to_string(),
            nodes: vec![
                Node {
                    id: "start".into(),
                    name: "Start".into(),
                    kind: NodeKind::Start,
                    retry: None,
                },
                Node {
                    id: "gather".into(),
                    name: "Gather".into(),
                    kind: NodeKind::Task {
                        prompt: "Find top 5 AI news".into(),
                        agent: Some("researcher".into()),
                    },
                    retry: None,
                },
                Node {
                    id: "end".into(),
                    name: "End".into(),
                    kind: NodeKind::End,
                    retry: None,
                },
            ],
            edges: vec![
                Edge {
                    id: "e1".into(),
                    from: "start".into(),
                    to: "gather".into(),
                    condition: None,
                    max_loops: None,
                    label: None,
                },
                Edge {
                    id: "e2".into(),
                    from: "gather".into(),
                    to: "end".into(),
                    condition: None,
                    max_loops: None,
                    label: None,
                },
            ],
            variables: HashMap::from([("topic".to_string(), json!("ai"))]),
            created_at: Utc::now(),
        }
    }

    // -- Workflow CRUD --

    #[tokio::test]
    async fn test_save_and_get_workflow() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow();

        repo.save_workflow(&wf).await.unwrap();

        let loaded = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "daily-digest");
        assert_eq!(loaded.nodes.len(), 3);
        assert_eq!(loaded.edges.len(), 2);
        assert_eq!(loaded.variables.get("topic"), Some(&json!("ai")));
    }

    #[tokio::test]
    async fn test_save_workflow_upsert() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let mut wf = sample_workflow();

        repo.save_workflow(&wf).await.unwrap();
        wf.version = "2.0.0".to_string();
        repo.save_workflow(&wf).await.unwrap();

        let loaded = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, "2.0.0");
        assert_eq!(repo.list_workflows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_workflow_by_prefix() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow();
        repo.save_workflow(&wf).await.unwrap();

        let prefix = &wf.id.to_string()[..13];
        let found = repo.find_workflow(prefix).await.unwrap().unwrap();
        assert_eq!(found.id, wf.id);

        assert!(repo.find_workflow("ffffffff").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_workflow() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow();
        repo.save_workflow(&wf).await.unwrap();

        assert!(repo.delete_workflow(&wf.id).await.unwrap());
        assert!(repo.get_workflow(&wf.id).await.unwrap().is_none());
        assert!(!repo.delete_workflow(&wf.id).await.unwrap());
    }

    // -- Instance lifecycle --

    #[tokio::test]
    async fn test_save_and_get_instance() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow();
        repo.save_workflow(&wf).await.unwrap();

        let instance = WorkflowInstance::for_workflow(&wf);
        repo.save_instance(&instance).await.unwrap();

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, instance.id);
        assert_eq!(loaded.workflow_id, wf.id);
        assert_eq!(loaded.status, InstanceStatus::Pending);
        assert_eq!(loaded.node_states.len(), 3);
        assert_eq!(
            loaded.node_state("gather").unwrap().status,
            NodeStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_instance_state_updates_persist() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow();
        repo.save_workflow(&wf).await.unwrap();

        let mut instance = WorkflowInstance::for_workflow(&wf);
        repo.save_instance(&instance).await.unwrap();

        instance.status = InstanceStatus::Running;
        instance
            .node_states
            .get_mut("gather")
            .unwrap()
            .status = NodeStatus::Ready;
        instance.outputs.insert("start".into(), json!(null));
        instance.edge_traversals.insert("e1".into(), 1);
        repo.save_instance(&instance).await.unwrap();

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Running);
        assert_eq!(loaded.node_state("gather").unwrap().status, NodeStatus::Ready);
        assert_eq!(loaded.traversals("e1"), 1);
    }

    #[tokio::test]
    async fn test_list_instances_by_status() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow();
        repo.save_workflow(&wf).await.unwrap();

        let running = {
            let mut i = WorkflowInstance::for_workflow(&wf);
            i.status = InstanceStatus::Running;
            i
        };
        let failed = {
            let mut i = WorkflowInstance::for_workflow(&wf);
            i.status = InstanceStatus::Failed;
            i.error = Some("node 'gather' timed out".to_string());
            i
        };
        repo.save_instance(&running).await.unwrap();
        repo.save_instance(&failed).await.unwrap();

        let all = repo.list_instances(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_failed = repo
            .list_instances(Some(InstanceStatus::Failed))
            .await
            .unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].id, failed.id);
        assert_eq!(
            only_failed[0].error.as_deref(),
            Some("node 'gather' timed out")
        );
    }

    #[tokio::test]
    async fn test_find_instance_by_prefix() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow();
        repo.save_workflow(&wf).await.unwrap();

        let instance = WorkflowInstance::for_workflow(&wf);
        repo.save_instance(&instance).await.unwrap();

        let prefix = &instance.id.to_string()[..13];
        let found = repo.find_instance(prefix).await.unwrap().unwrap();
        assert_eq!(found.id, instance.id);
    }

    #[tokio::test]
    async fn test_delete_instance() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow();
        repo.save_workflow(&wf).await.unwrap();
        let instance = WorkflowInstance::for_workflow(&wf);
        repo.save_instance(&instance).await.unwrap();

        assert!(repo.delete_instance(&instance.id).await.unwrap());
        assert!(repo.get_instance(&instance.id).await.unwrap().is_none());
    }
}
