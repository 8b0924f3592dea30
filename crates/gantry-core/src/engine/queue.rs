//! Persisted, priority-ordered job queue.
//!
//! `JobQueue` wraps a [`JobRepository`] with the queue's state machine:
//! claim, complete, fail-and-requeue, terminal failure, human suspension,
//! instance purge, and aged cleanup. The queue is a dispatch mechanism --
//! node status lives on the instance and is owned by the state manager.
//!
//! Delay/schedule semantics live here: a job created with a delay is stored
//! `Delayed` and stays invisible to claiming until `available_at` passes,
//! so a process restart does not lose the delay.

use std::time::Duration;

use chrono::Utc;
use gantry_types::error::RepositoryError;
use gantry_types::job::{Job, JobPayload, JobStatus};
use uuid::Uuid;

use crate::repository::job::JobRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job {id} is {actual:?}, expected {expected:?}")]
    UnexpectedStatus {
        id: Uuid,
        actual: JobStatus,
        expected: JobStatus,
    },
}

// ---------------------------------------------------------------------------
// Enqueue options
// ---------------------------------------------------------------------------

/// Options for enqueueing a job.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Visibility delay; the job cannot be claimed until it elapses.
    pub delay: Option<Duration>,
    /// Higher dispatches first.
    pub priority: i64,
}

/// Suspended (human-gate) jobs park far in the future so normal claiming
/// never sees them; resumption goes through the engine's approve/reject
/// path, not the claim loop.
const SUSPEND_PARK_DAYS: i64 = 365 * 100;

fn chrono_duration(delay: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(delay.as_millis() as i64)
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Priority-ordered queue of "execute this node" jobs over a persistence
/// port.
pub struct JobQueue<R: JobRepository> {
    repo: R,
}

impl<R: JobRepository> JobQueue<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Enqueue one job. Returns the job id.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        let now = Utc::now();
        let (status, available_at) = match options.delay {
            Some(delay) if !delay.is_zero() => {
                (JobStatus::Delayed, now + chrono_duration(delay))
            }
            _ => (JobStatus::Waiting, now),
        };

        let job = Job {
            id: Uuid::now_v7(),
            payload,
            status,
            priority: options.priority,
            reason: None,
            created_at: now,
            available_at,
            seq: 0,
        };
        let stored = self.repo.insert_job(&job).await?;

        tracing::debug!(
            job_id = %stored.id,
            instance_id = %stored.payload.instance_id,
            node_id = stored.payload.node_id.as_str(),
            status = ?stored.status,
            "job enqueued"
        );
        Ok(stored.id)
    }

    /// Enqueue several jobs with the same options.
    pub async fn enqueue_many(
        &self,
        payloads: Vec<JobPayload>,
        options: EnqueueOptions,
    ) -> Result<Vec<Uuid>, QueueError> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            ids.push(self.enqueue(payload, options.clone()).await?);
        }
        Ok(ids)
    }

    /// Claim the next eligible job: highest priority, earliest available,
    /// then insertion order -- optionally restricted to one instance. The
    /// returned job is already `Active`; a second immediate call will not
    /// return it again.
    pub async fn get_next_job(&self, instance: Option<Uuid>) -> Result<Option<Job>, QueueError> {
        let claimed = self.repo.claim_next(instance, Utc::now()).await?;
        if let Some(job) = &claimed {
            tracing::debug!(
                job_id = %job.id,
                node_id = job.payload.node_id.as_str(),
                "job claimed"
            );
        }
        Ok(claimed)
    }

    /// Mark an active job completed.
    pub async fn complete(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut job = self.expect_active(job_id).await?;
        job.status = JobStatus::Completed;
        self.repo.update_job(&job).await?;
        tracing::debug!(job_id = %job_id, "job completed");
        Ok(())
    }

    /// Return an active job to the queue for a future retry, optionally
    /// delayed by the retry backoff.
    pub async fn fail(
        &self,
        job_id: Uuid,
        reason: &str,
        retry_delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        let mut job = self.expect_active(job_id).await?;
        let now = Utc::now();
        match retry_delay {
            Some(delay) if !delay.is_zero() => {
                job.status = JobStatus::Delayed;
                job.available_at = now + chrono_duration(delay);
            }
            _ => {
                job.status = JobStatus::Waiting;
                job.available_at = now;
            }
        }
        job.payload.attempt += 1;
        job.reason = Some(reason.to_string());
        self.repo.update_job(&job).await?;
        tracing::debug!(job_id = %job_id, reason, "job returned to queue for retry");
        Ok(())
    }

    /// Terminally fail a job.
    pub async fn mark_failed(&self, job_id: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut job = self
            .repo
            .get_job(&job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;
        job.status = JobStatus::Failed;
        job.reason = Some(reason.to_string());
        self.repo.update_job(&job).await?;
        tracing::debug!(job_id = %job_id, reason, "job failed terminally");
        Ok(())
    }

    /// Suspend an active job for human approval: status `Waiting`, parked
    /// beyond the claim horizon until the approve/reject path resolves it.
    pub async fn mark_waiting(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut job = self.expect_active(job_id).await?;
        job.status = JobStatus::Waiting;
        job.available_at = Utc::now() + chrono::Duration::days(SUSPEND_PARK_DAYS);
        job.reason = Some("awaiting human approval".to_string());
        self.repo.update_job(&job).await?;
        tracing::debug!(job_id = %job_id, "job suspended for human approval");
        Ok(())
    }

    /// Complete a suspended (human-gate) job once the approval path has
    /// resolved its node. Only `Waiting` jobs are eligible; active jobs go
    /// through [`JobQueue::complete`].
    pub async fn complete_suspended(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut job = self
            .repo
            .get_job(&job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;
        if job.status != JobStatus::Waiting {
            return Err(QueueError::UnexpectedStatus {
                id: job_id,
                actual: job.status,
                expected: JobStatus::Waiting,
            });
        }
        job.status = JobStatus::Completed;
        job.reason = None;
        self.repo.update_job(&job).await?;
        tracing::debug!(job_id = %job_id, "suspended job completed");
        Ok(())
    }

    /// Jobs suspended for human approval, optionally for one instance.
    pub async fn waiting_human_jobs(
        &self,
        instance: Option<Uuid>,
    ) -> Result<Vec<Job>, QueueError> {
        let horizon = Utc::now() + chrono::Duration::days(SUSPEND_PARK_DAYS / 2);
        let waiting = self.repo.list_jobs(JobStatus::Waiting, instance).await?;
        Ok(waiting
            .into_iter()
            .filter(|j| j.available_at > horizon)
            .collect())
    }

    /// Purge every job belonging to an instance (cancellation, terminal
    /// failure). Returns the count removed.
    pub async fn remove_jobs_for_instance(&self, instance_id: Uuid) -> Result<u64, QueueError> {
        let removed = self.repo.delete_jobs_for_instance(&instance_id).await?;
        if removed > 0 {
            tracing::debug!(instance_id = %instance_id, removed, "purged instance jobs");
        }
        Ok(removed)
    }

    /// Delete terminal jobs older than `age`. Returns the count removed.
    pub async fn cleanup_old_jobs(&self, age: Duration) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono_duration(age);
        let removed = self.repo.delete_jobs_older_than(cutoff).await?;
        if removed > 0 {
            tracing::debug!(removed, "cleaned up old jobs");
        }
        Ok(removed)
    }

    async fn expect_active(&self, job_id: Uuid) -> Result<Job, QueueError> {
        let job = self
            .repo
            .get_job(&job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;
        if job.status != JobStatus::Active {
            return Err(QueueError::UnexpectedStatus {
                id: job_id,
                actual: job.status,
                expected: JobStatus::Active,
            });
        }
        Ok(job)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryStore;

    fn queue() -> JobQueue<MemoryStore> {
        JobQueue::new(MemoryStore::new())
    }

    fn payload(instance: Uuid, node: &str) -> JobPayload {
        JobPayload {
            workflow_id: Uuid::now_v7(),
            instance_id: instance,
            node_id: node.to_string(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_claim_roundtrip() {
        let queue = queue();
        let instance = Uuid::now_v7();
        let id = queue
            .enqueue(payload(instance, "a"), EnqueueOptions::default())
            .await
            .unwrap();

        let job = queue.get_next_job(None).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Active);

        // Jobs are not double-dispatched
        assert!(queue.get_next_job(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_ordering_deterministic() {
        let queue = queue();
        let instance = Uuid::now_v7();
        queue
            .enqueue(payload(instance, "first"), EnqueueOptions::default())
            .await
            .unwrap();
        queue
            .enqueue(payload(instance, "second"), EnqueueOptions::default())
            .await
            .unwrap();
        queue
            .enqueue(
                payload(instance, "urgent"),
                EnqueueOptions {
                    delay: None,
                    priority: 5,
                },
            )
            .await
            .unwrap();

        let order: Vec<String> = [
            queue.get_next_job(None).await.unwrap().unwrap(),
            queue.get_next_job(None).await.unwrap().unwrap(),
            queue.get_next_job(None).await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|j| j.payload.node_id)
        .collect();
        assert_eq!(order, vec!["urgent", "first", "second"]);
    }

    #[tokio::test]
    async fn test_delayed_job_invisible_until_due() {
        let queue = queue();
        let instance = Uuid::now_v7();
        queue
            .enqueue(
                payload(instance, "later"),
                EnqueueOptions {
                    delay: Some(Duration::from_secs(3600)),
                    priority: 100,
                },
            )
            .await
            .unwrap();
        queue
            .enqueue(payload(instance, "now"), EnqueueOptions::default())
            .await
            .unwrap();

        let job = queue.get_next_job(None).await.unwrap().unwrap();
        assert_eq!(job.payload.node_id, "now", "delayed job must be invisible");
        assert!(queue.get_next_job(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_returns_job_for_retry() {
        let queue = queue();
        let instance = Uuid::now_v7();
        queue
            .enqueue(payload(instance, "flaky"), EnqueueOptions::default())
            .await
            .unwrap();

        let job = queue.get_next_job(None).await.unwrap().unwrap();
        queue.fail(job.id, "connection timed out", None).await.unwrap();

        let retried = queue.get_next_job(None).await.unwrap().unwrap();
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.payload.attempt, 2);
        assert_eq!(retried.reason.as_deref(), Some("connection timed out"));
    }

    #[tokio::test]
    async fn test_fail_with_delay_defers_retry() {
        let queue = queue();
        let instance = Uuid::now_v7();
        queue
            .enqueue(payload(instance, "flaky"), EnqueueOptions::default())
            .await
            .unwrap();

        let job = queue.get_next_job(None).await.unwrap().unwrap();
        queue
            .fail(job.id, "503", Some(Duration::from_secs(600)))
            .await
            .unwrap();

        assert!(
            queue.get_next_job(None).await.unwrap().is_none(),
            "backoff delay must hide the job"
        );
    }

    #[tokio::test]
    async fn test_mark_failed_is_terminal() {
        let queue = queue();
        let instance = Uuid::now_v7();
        queue
            .enqueue(payload(instance, "doomed"), EnqueueOptions::default())
            .await
            .unwrap();

        let job = queue.get_next_job(None).await.unwrap().unwrap();
        queue.mark_failed(job.id, "401 unauthorized").await.unwrap();

        assert!(queue.get_next_job(None).await.unwrap().is_none());
        let failed = queue.repo().get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_mark_waiting_excludes_from_dispatch() {
        let queue = queue();
        let instance = Uuid::now_v7();
        queue
            .enqueue(payload(instance, "gate"), EnqueueOptions::default())
            .await
            .unwrap();

        let job = queue.get_next_job(None).await.unwrap().unwrap();
        queue.mark_waiting(job.id).await.unwrap();

        let suspended = queue.repo().get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(suspended.status, JobStatus::Waiting);
        assert!(
            queue.get_next_job(None).await.unwrap().is_none(),
            "suspended job must not be re-dispatched"
        );

        let humans = queue.waiting_human_jobs(Some(instance)).await.unwrap();
        assert_eq!(humans.len(), 1);
        assert_eq!(humans[0].id, job.id);

        queue.complete_suspended(job.id).await.unwrap();
        let resolved = queue.repo().get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, JobStatus::Completed);
        assert!(queue.waiting_human_jobs(Some(instance)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_instance_scoped_claim() {
        let queue = queue();
        let mine = Uuid::now_v7();
        let theirs = Uuid::now_v7();
        queue
            .enqueue(
                payload(theirs, "other"),
                EnqueueOptions {
                    delay: None,
                    priority: 50,
                },
            )
            .await
            .unwrap();
        queue
            .enqueue(payload(mine, "ours"), EnqueueOptions::default())
            .await
            .unwrap();

        let job = queue.get_next_job(Some(mine)).await.unwrap().unwrap();
        assert_eq!(job.payload.instance_id, mine);
        assert!(queue.get_next_job(Some(mine)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_jobs_for_instance() {
        let queue = queue();
        let doomed = Uuid::now_v7();
        queue
            .enqueue_many(
                vec![payload(doomed, "a"), payload(doomed, "b")],
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let removed = queue.remove_jobs_for_instance(doomed).await.unwrap();
        assert_eq!(removed, 2);
        assert!(queue.get_next_job(Some(doomed)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_requires_active() {
        let queue = queue();
        let instance = Uuid::now_v7();
        let id = queue
            .enqueue(payload(instance, "a"), EnqueueOptions::default())
            .await
            .unwrap();

        // Not yet claimed
        assert!(matches!(
            queue.complete(id).await,
            Err(QueueError::UnexpectedStatus { .. })
        ));
    }

    #[tokio::test]
    async fn test_cleanup_old_jobs_spares_recent_and_pending() {
        let queue = queue();
        let instance = Uuid::now_v7();
        queue
            .enqueue(payload(instance, "done"), EnqueueOptions::default())
            .await
            .unwrap();
        let job = queue.get_next_job(None).await.unwrap().unwrap();
        queue.complete(job.id).await.unwrap();
        queue
            .enqueue(payload(instance, "pending"), EnqueueOptions::default())
            .await
            .unwrap();

        // Nothing older than an hour
        assert_eq!(
            queue.cleanup_old_jobs(Duration::from_secs(3600)).await.unwrap(),
            0
        );
        // Zero age removes the completed job but never the pending one
        assert_eq!(
            queue.cleanup_old_jobs(Duration::from_secs(0)).await.unwrap(),
            1
        );
        assert!(queue.get_next_job(None).await.unwrap().is_some());
    }
}
