//! State manager: the sole owner of instance and node status transitions.
//!
//! Every mutation is one atomic read-modify-write persisted through the
//! repository before the caller moves forward, so a crash never loses a
//! transition. Transition legality is enforced here; callers that attempt an
//! illegal transition get an error instead of silent corruption.

use chrono::Utc;
use gantry_types::error::RepositoryError;
use gantry_types::graph::Workflow;
use gantry_types::instance::{
    InstanceStatus, LoopState, NodeStatus, WorkflowInstance,
};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from state transitions.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("node '{node}' not found on instance {instance}")]
    NodeNotFound { instance: Uuid, node: String },

    #[error("illegal node transition for '{node}': {from:?} -> {to:?}")]
    InvalidNodeTransition {
        node: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("illegal instance transition: {from:?} -> {to:?}")]
    InvalidInstanceTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },
}

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

/// Owns the authoritative status of each node and of the instance as a
/// whole. All status transitions go through here and are persisted
/// atomically per call.
pub struct StateManager<R: WorkflowRepository> {
    repo: R,
}

impl<R: WorkflowRepository> StateManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Instance lifecycle
    // -----------------------------------------------------------------------

    /// Create and persist a fresh instance for a workflow.
    pub async fn create_instance(
        &self,
        workflow: &Workflow,
    ) -> Result<WorkflowInstance, StateError> {
        let instance = WorkflowInstance::for_workflow(workflow);
        self.repo.save_instance(&instance).await?;
        tracing::info!(
            instance_id = %instance.id,
            workflow = workflow.name.as_str(),
            "instance created"
        );
        Ok(instance)
    }

    /// Load an instance or fail.
    pub async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance, StateError> {
        self.repo
            .get_instance(&id)
            .await?
            .ok_or(StateError::InstanceNotFound(id))
    }

    /// Pending -> Running.
    pub async fn mark_instance_running(&self, id: Uuid) -> Result<(), StateError> {
        self.with_instance(id, |instance| {
            transition_instance(instance, InstanceStatus::Running)
        })
        .await?;
        Ok(())
    }

    /// Fail the instance, carrying the failing node's error message so
    /// operators can resume from the correct point.
    pub async fn fail_instance(
        &self,
        id: Uuid,
        node_id: &str,
        error: &str,
    ) -> Result<(), StateError> {
        self.with_instance(id, |instance| {
            transition_instance(instance, InstanceStatus::Failed)?;
            instance.error = Some(error.to_string());
            instance.completed_at = Some(Utc::now());
            Ok(())
        })
        .await?;
        tracing::warn!(instance_id = %id, node_id, error, "instance failed");
        Ok(())
    }

    /// Cancel the instance. The caller is responsible for purging its queued
    /// jobs so no orphaned job later mutates a cancelled instance.
    pub async fn cancel_instance(&self, id: Uuid) -> Result<(), StateError> {
        self.with_instance(id, |instance| {
            transition_instance(instance, InstanceStatus::Cancelled)?;
            instance.completed_at = Some(Utc::now());
            Ok(())
        })
        .await?;
        tracing::info!(instance_id = %id, "instance cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Node transitions
    // -----------------------------------------------------------------------

    /// Pending/Done/Running -> Ready (Done for loop re-entry, Running for
    /// the retry re-queue).
    pub async fn mark_node_ready(&self, id: Uuid, node_id: &str) -> Result<(), StateError> {
        self.with_instance(id, |instance| {
            transition_node(instance, node_id, NodeStatus::Ready)?;
            Ok(())
        })
        .await?;
        tracing::debug!(instance_id = %id, node_id, "node ready");
        Ok(())
    }

    /// Ready -> Running. Increments the attempt counter and stamps the
    /// start time.
    pub async fn mark_node_running(&self, id: Uuid, node_id: &str) -> Result<u32, StateError> {
        let instance = self
            .with_instance(id, |instance| {
                let state = transition_node(instance, node_id, NodeStatus::Running)?;
                state.attempts += 1;
                state.started_at = Some(Utc::now());
                state.error = None;
                Ok(())
            })
            .await?;
        let attempts = instance
            .node_state(node_id)
            .map(|s| s.attempts)
            .unwrap_or(0);
        tracing::debug!(instance_id = %id, node_id, attempts, "node running");
        Ok(attempts)
    }

    /// Running/Waiting -> Done. Stores the output and stamps duration.
    pub async fn mark_node_done(
        &self,
        id: Uuid,
        node_id: &str,
        output: Value,
    ) -> Result<(), StateError> {
        self.with_instance(id, |instance| {
            let state = transition_node(instance, node_id, NodeStatus::Done)?;
            let now = Utc::now();
            if let Some(started) = state.started_at {
                state.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
            }
            state.completed_at = Some(now);
            state.error = None;
            instance.outputs.insert(node_id.to_string(), output);
            Ok(())
        })
        .await?;
        tracing::debug!(instance_id = %id, node_id, "node done");
        Ok(())
    }

    /// Running/Waiting/Ready -> Failed.
    pub async fn mark_node_failed(
        &self,
        id: Uuid,
        node_id: &str,
        error: &str,
    ) -> Result<(), StateError> {
        self.with_instance(id, |instance| {
            let state = transition_node(instance, node_id, NodeStatus::Failed)?;
            state.error = Some(error.to_string());
            state.completed_at = Some(Utc::now());
            Ok(())
        })
        .await?;
        tracing::debug!(instance_id = %id, node_id, error, "node failed");
        Ok(())
    }

    /// Running -> Waiting (human gate).
    pub async fn mark_node_waiting(&self, id: Uuid, node_id: &str) -> Result<(), StateError> {
        self.with_instance(id, |instance| {
            transition_node(instance, node_id, NodeStatus::Waiting)?;
            Ok(())
        })
        .await?;
        tracing::debug!(instance_id = %id, node_id, "node waiting for approval");
        Ok(())
    }

    /// Any non-terminal -> Skipped (unreached branch).
    pub async fn mark_node_skipped(&self, id: Uuid, node_id: &str) -> Result<(), StateError> {
        self.with_instance(id, |instance| {
            let state = transition_node(instance, node_id, NodeStatus::Skipped)?;
            state.completed_at = Some(Utc::now());
            Ok(())
        })
        .await?;
        tracing::debug!(instance_id = %id, node_id, "node skipped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Instance data
    // -----------------------------------------------------------------------

    /// Write one variable (assign/script nodes).
    pub async fn set_variable(
        &self,
        id: Uuid,
        name: &str,
        value: Value,
    ) -> Result<(), StateError> {
        self.with_instance(id, |instance| {
            instance.variables.insert(name.to_string(), value);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Increment an edge's traversal counter; returns the new count.
    pub async fn record_edge_traversal(
        &self,
        id: Uuid,
        edge_id: &str,
    ) -> Result<u32, StateError> {
        let instance = self
            .with_instance(id, |instance| {
                *instance
                    .edge_traversals
                    .entry(edge_id.to_string())
                    .or_insert(0) += 1;
                Ok(())
            })
            .await?;
        Ok(instance.traversals(edge_id))
    }

    /// Initialize or advance a foreach cursor. On first call the evaluated
    /// items are stored with index 0; each later call advances the index.
    /// Returns the updated cursor.
    pub async fn advance_foreach(
        &self,
        id: Uuid,
        node_id: &str,
        items: Option<Vec<Value>>,
    ) -> Result<LoopState, StateError> {
        let instance = self
            .with_instance(id, |instance| {
                match instance.loops.get_mut(node_id) {
                    Some(cursor) => cursor.index += 1,
                    None => {
                        instance.loops.insert(
                            node_id.to_string(),
                            LoopState {
                                items: items.unwrap_or_default(),
                                index: 0,
                            },
                        );
                    }
                }
                Ok(())
            })
            .await?;
        Ok(instance
            .loops
            .get(node_id)
            .cloned()
            .unwrap_or(LoopState { items: vec![], index: 0 }))
    }

    // -----------------------------------------------------------------------
    // Completion check
    // -----------------------------------------------------------------------

    /// Inspect all node states and flip the instance to `Completed` or
    /// `Failed` when warranted. Idempotent: called after every node
    /// transition without assuming which node triggered it, and a no-op on
    /// already-terminal instances.
    ///
    /// Rules, in order:
    /// - any node `Failed` -> instance `Failed` with that node's error;
    /// - any node in flight (`Ready`/`Running`/`Waiting`) -> unchanged;
    /// - otherwise, once at least one node has resolved, the remaining
    ///   `Pending` nodes are unreachable: they are marked `Skipped` and the
    ///   instance completes.
    pub async fn check_workflow_completion(
        &self,
        id: Uuid,
    ) -> Result<InstanceStatus, StateError> {
        let instance = self.get_instance(id).await?;
        if instance.status.is_terminal() {
            return Ok(instance.status);
        }

        if let Some((node_id, state)) = instance
            .node_states
            .iter()
            .find(|(_, s)| s.status == NodeStatus::Failed)
        {
            let error = state
                .error
                .clone()
                .unwrap_or_else(|| format!("node '{node_id}' failed"));
            let node_id = node_id.clone();
            self.fail_instance(id, &node_id, &error).await?;
            return Ok(InstanceStatus::Failed);
        }

        if instance
            .node_states
            .values()
            .any(|s| s.status.is_in_flight())
        {
            return Ok(instance.status);
        }

        let any_resolved = instance
            .node_states
            .values()
            .any(|s| s.status.is_resolved());
        if !any_resolved {
            // Nothing has run yet; there is nothing to conclude.
            return Ok(instance.status);
        }

        let updated = self
            .with_instance(id, |instance| {
                for state in instance.node_states.values_mut() {
                    if state.status == NodeStatus::Pending {
                        state.status = NodeStatus::Skipped;
                        state.completed_at = Some(Utc::now());
                    }
                }
                transition_instance(instance, InstanceStatus::Completed)?;
                instance.completed_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        tracing::info!(instance_id = %id, "instance completed");
        Ok(updated.status)
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    /// Load, mutate, stamp `updated_at`, and persist in one step. Returns
    /// the updated instance.
    async fn with_instance<F>(
        &self,
        id: Uuid,
        mutate: F,
    ) -> Result<WorkflowInstance, StateError>
    where
        F: FnOnce(&mut WorkflowInstance) -> Result<(), StateError>,
    {
        let mut instance = self.get_instance(id).await?;
        mutate(&mut instance)?;
        instance.updated_at = Utc::now();
        self.repo.save_instance(&instance).await?;
        Ok(instance)
    }
}

/// Validate and apply a node status transition, returning the mutable state.
fn transition_node<'a>(
    instance: &'a mut WorkflowInstance,
    node_id: &str,
    to: NodeStatus,
) -> Result<&'a mut gantry_types::instance::NodeState, StateError> {
    let instance_id = instance.id;
    let state = instance
        .node_states
        .get_mut(node_id)
        .ok_or_else(|| StateError::NodeNotFound {
            instance: instance_id,
            node: node_id.to_string(),
        })?;
    if !state.status.can_transition_to(to) {
        return Err(StateError::InvalidNodeTransition {
            node: node_id.to_string(),
            from: state.status,
            to,
        });
    }
    state.status = to;
    Ok(state)
}

/// Validate and apply an instance status transition.
fn transition_instance(
    instance: &mut WorkflowInstance,
    to: InstanceStatus,
) -> Result<(), StateError> {
    if !instance.status.can_transition_to(to) {
        return Err(StateError::InvalidInstanceTransition {
            from: instance.status,
            to,
        });
    }
    instance.status = to;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
