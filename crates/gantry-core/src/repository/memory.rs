//! In-memory store implementing both repository ports.
//!
//! Backs the engine's test suites and embedded single-process use where
//! durability is not required. Claim ordering matches the SQLite
//! implementation exactly so scheduling tests are representative.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gantry_types::error::RepositoryError;
use gantry_types::graph::Workflow;
use gantry_types::instance::{InstanceStatus, WorkflowInstance};
use gantry_types::job::{Job, JobStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::job::JobRepository;
use super::workflow::WorkflowRepository;

/// In-memory implementation of [`WorkflowRepository`] and [`JobRepository`].
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    workflows: Arc<DashMap<Uuid, Workflow>>,
    instances: Arc<DashMap<Uuid, WorkflowInstance>>,
    /// Jobs live behind one lock so claim ordering is a single atomic step.
    jobs: Arc<Mutex<Vec<Job>>>,
    next_seq: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolve a prefix against a set of id strings: `Ok(None)` when nothing
/// matches, `Conflict` when more than one does.
fn resolve_prefix(prefix: &str, ids: Vec<Uuid>) -> Result<Option<Uuid>, RepositoryError> {
    let matches: Vec<Uuid> = ids
        .into_iter()
        .filter(|id| id.to_string().starts_with(prefix))
        .collect();
    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches[0])),
        n => Err(RepositoryError::Conflict(format!(
            "id prefix '{prefix}' matches {n} entities"
        ))),
    }
}

impl WorkflowRepository for MemoryStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.workflows.get(id).map(|w| w.clone()))
    }

    async fn find_workflow(&self, id_prefix: &str) -> Result<Option<Workflow>, RepositoryError> {
        let ids = self.workflows.iter().map(|e| *e.key()).collect();
        match resolve_prefix(id_prefix, ids)? {
            Some(id) => self.get_workflow(&id).await,
            None => Ok(None),
        }
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let mut all: Vec<Workflow> = self.workflows.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.workflows.remove(id).is_some())
    }

    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.instances.get(id).map(|i| i.clone()))
    }

    async fn find_instance(
        &self,
        id_prefix: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let ids = self.instances.iter().map(|e| *e.key()).collect();
        match resolve_prefix(id_prefix, ids)? {
            Some(id) => self.get_instance(&id).await,
            None => Ok(None),
        }
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut all: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|e| status.is_none_or(|s| e.value().status == s))
            .map(|e| e.value().clone())
            .collect();
        // UUIDv7 ids are time-ordered; newest first.
        all.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(all)
    }

    async fn delete_instance(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.instances.remove(id).is_some())
    }
}

impl JobRepository for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<Job, RepositoryError> {
        let mut stored = job.clone();
        stored.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().await.push(stored.clone());
        Ok(stored)
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
        Ok(self.jobs.lock().await.iter().find(|j| j.id == *id).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn claim_next(
        &self,
        instance: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let mut jobs = self.jobs.lock().await;
        let winner = jobs
            .iter_mut()
            .filter(|j| j.status.is_claimable() && j.available_at <= now)
            .filter(|j| instance.is_none_or(|id| j.payload.instance_id == id))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.available_at.cmp(&b.available_at))
                    .then(a.seq.cmp(&b.seq))
            });
        Ok(winner.map(|job| {
            job.status = JobStatus::Active;
            job.clone()
        }))
    }

    async fn list_jobs(
        &self,
        status: JobStatus,
        instance: Option<Uuid>,
    ) -> Result<Vec<Job>, RepositoryError> {
        let jobs = self.jobs.lock().await;
        let mut matched: Vec<Job> = jobs
            .iter()
            .filter(|j| j.status == status)
            .filter(|j| instance.is_none_or(|id| j.payload.instance_id == id))
            .cloned()
            .collect();
        matched.sort_by_key(|j| j.seq);
        Ok(matched)
    }

    async fn delete_jobs_for_instance(&self, instance_id: &Uuid) -> Result<u64, RepositoryError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|j| j.payload.instance_id != *instance_id);
        Ok((before - jobs.len()) as u64)
    }

    async fn delete_jobs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|j| {
            !(matches!(j.status, JobStatus::Completed | JobStatus::Failed)
                && j.created_at < cutoff)
        });
        Ok((before - jobs.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_types::job::JobPayload;

    fn make_job(instance_id: Uuid, node: &str, priority: i64) -> Job {
        Job {
            id: Uuid::now_v7(),
            payload: JobPayload {
                workflow_id: Uuid::now_v7(),
                instance_id,
                node_id: node.to_string(),
                attempt: 1,
            },
            status: JobStatus::Waiting,
            priority,
            reason: None,
            created_at: Utc::now(),
            available_at: Utc::now(),
            seq: 0,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_monotonic_seq() {
        let store = MemoryStore::new();
        let instance = Uuid::now_v7();
        let a = store.insert_job(&make_job(instance, "a", 0)).await.unwrap();
        let b = store.insert_job(&make_job(instance, "b", 0)).await.unwrap();
        assert!(b.seq > a.seq);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_insertion() {
        let store = MemoryStore::new();
        let instance = Uuid::now_v7();
        store.insert_job(&make_job(instance, "low", 0)).await.unwrap();
        store.insert_job(&make_job(instance, "high", 10)).await.unwrap();
        store.insert_job(&make_job(instance, "low-2", 0)).await.unwrap();

        let first = store.claim_next(None, Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.payload.node_id, "high");
        assert_eq!(first.status, JobStatus::Active);

        let second = store.claim_next(None, Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.payload.node_id, "low");

        let third = store.claim_next(None, Utc::now()).await.unwrap().unwrap();
        assert_eq!(third.payload.node_id, "low-2");

        assert!(store.claim_next(None, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_instance_filter() {
        let store = MemoryStore::new();
        let mine = Uuid::now_v7();
        let theirs = Uuid::now_v7();
        store.insert_job(&make_job(theirs, "other", 100)).await.unwrap();
        store.insert_job(&make_job(mine, "ours", 0)).await.unwrap();

        let claimed = store.claim_next(Some(mine), Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.payload.instance_id, mine);
    }

    #[tokio::test]
    async fn test_delete_jobs_for_instance() {
        let store = MemoryStore::new();
        let keep = Uuid::now_v7();
        let purge = Uuid::now_v7();
        store.insert_job(&make_job(purge, "a", 0)).await.unwrap();
        store.insert_job(&make_job(purge, "b", 0)).await.unwrap();
        store.insert_job(&make_job(keep, "c", 0)).await.unwrap();

        let removed = store.delete_jobs_for_instance(&purge).await.unwrap();
        assert_eq!(removed, 2);
        let remaining = store.list_jobs(JobStatus::Waiting, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload.instance_id, keep);
    }

    #[tokio::test]
    async fn test_prefix_lookup_conflict() {
        let ids = vec![Uuid::now_v7(), Uuid::now_v7()];
        // Every UUIDv7 string starts with a digit-heavy timestamp; an empty
        // prefix matches everything.
        let err = resolve_prefix("", ids).unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }
}
