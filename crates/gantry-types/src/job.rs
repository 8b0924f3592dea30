//! Job queue entities.
//!
//! A [`Job`] is a queued request to dispatch one node of one instance. Its
//! lifecycle is strictly subordinate to the node's state on the instance:
//! the queue is a dispatch mechanism, never the authority on node status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for dispatch once `available_at` passes.
    Waiting,
    /// Claimed by a worker and in flight.
    Active,
    /// Finished successfully.
    Completed,
    /// Terminally failed.
    Failed,
    /// Created with a visibility delay; claimable once due.
    Delayed,
}

impl JobStatus {
    /// Whether a job in this status can be claimed (subject to
    /// `available_at`).
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// What a job asks the worker to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub workflow_id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    /// Attempt number at enqueue time. Informational only: the ceiling is
    /// always enforced against the instance's `NodeState.attempts`.
    pub attempt: u32,
}

/// A persisted queue item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv7 job id.
    pub id: Uuid,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Higher dispatches first.
    pub priority: i64,
    /// Failure reason, for failed/requeued jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Jobs are invisible to claiming until this instant passes.
    pub available_at: DateTime<Utc>,
    /// Insertion order, assigned by the store. Final claim-ordering
    /// tie-break after priority and `available_at`.
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
