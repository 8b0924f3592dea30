//! Transition engine: decides which nodes become runnable when a node
//! completes.
//!
//! Handles plain edges, conditional edges, switch label routing, parallel
//! fan-out, join synchronization, bounded loops, and human-approval gates.
//! Propagation rules:
//!
//! - An outgoing edge is *traversed* when its condition passes (switch nodes
//!   route on label equality first) and its `max_loops` cap, if any, has
//!   budget left. Traversal increments the instance's per-edge counter -- the
//!   sole loop-termination guard.
//! - A traversed edge's target becomes ready once its join is satisfied:
//!   every non-cycle inbound edge's source has resolved (done or skipped).
//! - A blocked edge's target is skipped when no inbound edge has ever been
//!   traversed, its join is satisfied, and no inbound source sits inside a
//!   loop that could still reach it; the skip cascades through descendants.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use gantry_types::graph::{Edge, Node, NodeKind, Workflow};
use gantry_types::instance::{NodeStatus, WorkflowInstance};
use gantry_types::job::JobPayload;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::repository::job::JobRepository;
use crate::repository::workflow::WorkflowRepository;

use super::context::{EvalContext, LoopScope};
use super::expression::{ExpressionError, ExpressionEvaluator, coerce_to_string};
use super::graph::{GraphError, GraphIndex, validate_workflow};
use super::queue::{EnqueueOptions, JobQueue, QueueError};
use super::state::{StateError, StateManager};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the transition engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("invalid expression: {0}")]
    Expression(#[from] ExpressionError),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("node '{node}' is {status:?}, not waiting for approval")]
    NotWaiting { node: String, status: NodeStatus },
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Readiness propagation over a workflow graph, backed by the state manager
/// and job queue.
pub struct WorkflowEngine<R: WorkflowRepository, J: JobRepository> {
    state: Arc<StateManager<R>>,
    queue: Arc<JobQueue<J>>,
    evaluator: ExpressionEvaluator,
}

impl<R: WorkflowRepository, J: JobRepository> WorkflowEngine<R, J> {
    pub fn new(state: Arc<StateManager<R>>, queue: Arc<JobQueue<J>>) -> Self {
        Self {
            state,
            queue,
            evaluator: ExpressionEvaluator::new(),
        }
    }

    pub fn state(&self) -> &Arc<StateManager<R>> {
        &self.state
    }

    pub fn queue(&self) -> &Arc<JobQueue<J>> {
        &self.queue
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    // -----------------------------------------------------------------------
    // Instance bootstrap
    // -----------------------------------------------------------------------

    /// Validate the workflow, create an instance, resolve the start
    /// sentinel, and enqueue its successors. The returned instance is
    /// `Running` with the first real nodes queued.
    pub async fn start_instance(
        &self,
        workflow: &Workflow,
    ) -> Result<WorkflowInstance, EngineError> {
        validate_workflow(workflow, &self.evaluator)?;

        let instance = self.state.create_instance(workflow).await?;
        let id = instance.id;
        self.state.mark_instance_running(id).await?;

        let start = workflow
            .start_node()
            .ok_or_else(|| EngineError::UnknownNode("start".to_string()))?;

        // The start sentinel resolves inline; it is never dispatched.
        self.state.mark_node_ready(id, &start.id).await?;
        self.state.mark_node_running(id, &start.id).await?;
        self.state.mark_node_done(id, &start.id, Value::Null).await?;

        let ready = self.advance(workflow, id, &start.id).await?;
        self.enqueue_ready_nodes(workflow, id, &ready).await?;
        self.state.check_workflow_completion(id).await?;

        tracing::info!(
            instance_id = %id,
            workflow = workflow.name.as_str(),
            queued = ready.len(),
            "instance started"
        );
        self.state.get_instance(id).await.map_err(EngineError::from)
    }

    // -----------------------------------------------------------------------
    // Readiness propagation
    // -----------------------------------------------------------------------

    /// For each outgoing edge of the completed node, evaluate its condition
    /// (unconditional edges always pass) and its `max_loops` budget;
    /// traversed edges have their counters incremented. Returns the targets
    /// of traversed edges, without join gating.
    pub async fn get_next_nodes(
        &self,
        workflow: &Workflow,
        instance_id: Uuid,
        completed_node_id: &str,
    ) -> Result<Vec<String>, EngineError> {
        let index = GraphIndex::new(workflow);
        let instance = self.state.get_instance(instance_id).await?;
        let (traversed, _blocked) = self
            .evaluate_out_edges(&index, &instance, completed_node_id)
            .await?;
        let mut targets: Vec<String> = Vec::new();
        for edge in traversed {
            self.state
                .record_edge_traversal(instance_id, &edge.id)
                .await?;
            if !targets.iter().any(|t| t == &edge.to) {
                targets.push(edge.to.clone());
            }
        }
        Ok(targets)
    }

    /// Join semantics: a node with multiple predecessors only becomes ready
    /// once every non-cycle inbound edge's source has resolved (done or
    /// skipped), not just the first.
    pub fn can_execute_node(
        &self,
        workflow: &Workflow,
        instance: &WorkflowInstance,
        node_id: &str,
    ) -> bool {
        let index = GraphIndex::new(workflow);
        join_satisfied(&index, instance, node_id)
    }

    /// Full propagation for one completed node: traverse edges, skip
    /// untaken branches (cascading), and mark join-satisfied targets ready.
    /// Returns the node ids marked ready, for the caller to enqueue.
    pub async fn advance(
        &self,
        workflow: &Workflow,
        instance_id: Uuid,
        completed_node_id: &str,
    ) -> Result<Vec<String>, EngineError> {
        let index = GraphIndex::new(workflow);
        let instance = self.state.get_instance(instance_id).await?;
        let (traversed, blocked) = self
            .evaluate_out_edges(&index, &instance, completed_node_id)
            .await?;

        // Record traversals before any readiness decisions.
        for edge in &traversed {
            self.state
                .record_edge_traversal(instance_id, &edge.id)
                .await?;
        }

        let mut work: VecDeque<(String, bool)> = VecDeque::new();
        for edge in &traversed {
            work.push_back((edge.to.clone(), true));
        }
        for edge in &blocked {
            work.push_back((edge.to.clone(), false));
        }

        let mut ready = Vec::new();
        while let Some((node_id, traversed_now)) = work.pop_front() {
            let instance = self.state.get_instance(instance_id).await?;
            let Some(node_state) = instance.node_state(&node_id) else {
                return Err(EngineError::UnknownNode(node_id));
            };

            match node_state.status {
                // In flight or terminally resolved; nothing to do. A `Done`
                // node only re-activates on an actual traversal (loops).
                NodeStatus::Ready
                | NodeStatus::Running
                | NodeStatus::Waiting
                | NodeStatus::Failed
                | NodeStatus::Skipped => continue,
                NodeStatus::Done if !traversed_now => continue,
                NodeStatus::Pending | NodeStatus::Done => {}
            }

            if !join_satisfied(&index, &instance, &node_id) {
                // Another branch will resolve this node later.
                continue;
            }

            let has_traversal = index
                .incoming(&node_id)
                .iter()
                .any(|e| instance.traversals(&e.id) > 0);

            if traversed_now || has_traversal {
                self.state.mark_node_ready(instance_id, &node_id).await?;
                ready.push(node_id);
            } else if !index
                .incoming(&node_id)
                .iter()
                .any(|e| index.cycle_may_continue(&instance, &e.from))
            {
                // No path ever reached this node and none still can: an
                // unreached branch. Skip it and cascade to its descendants.
                self.state.mark_node_skipped(instance_id, &node_id).await?;
                for edge in index.outgoing(&node_id) {
                    work.push_back((edge.to.clone(), false));
                }
            }
        }

        Ok(ready)
    }

    /// Enqueue jobs for ready nodes. Delay/schedule nodes are enqueued with
    /// their visibility delay so a restart does not lose the wait.
    pub async fn enqueue_ready_nodes(
        &self,
        workflow: &Workflow,
        instance_id: Uuid,
        ready: &[String],
    ) -> Result<Vec<Uuid>, EngineError> {
        let instance = self.state.get_instance(instance_id).await?;
        let mut job_ids = Vec::with_capacity(ready.len());
        for node_id in ready {
            let node = workflow
                .node(node_id)
                .ok_or_else(|| EngineError::UnknownNode(node_id.clone()))?;
            let delay = enqueue_delay(node);
            let attempt = instance
                .node_state(node_id)
                .map(|s| s.attempts + 1)
                .unwrap_or(1);
            let job_id = self
                .queue
                .enqueue(
                    JobPayload {
                        workflow_id: workflow.id,
                        instance_id,
                        node_id: node_id.clone(),
                        attempt,
                    },
                    EnqueueOptions {
                        delay,
                        priority: 0,
                    },
                )
                .await?;
            job_ids.push(job_id);
        }
        Ok(job_ids)
    }

    // -----------------------------------------------------------------------
    // Built-in node execution
    // -----------------------------------------------------------------------

    /// Execute an engine-internal node kind and return its output. Returns
    /// `None` for externally processed kinds (task, suspending human gates).
    pub async fn execute_builtin(
        &self,
        workflow: &Workflow,
        instance_id: Uuid,
        node: &Node,
    ) -> Result<Option<Value>, EngineError> {
        let instance = self.state.get_instance(instance_id).await?;
        let ctx = self.eval_context_for(workflow, &instance, &node.id);

        match &node.kind {
            NodeKind::Task { .. } => Ok(None),
            NodeKind::Human { auto_approve, .. } => {
                if *auto_approve {
                    Ok(Some(json!({ "approved": true, "auto": true })))
                } else {
                    Ok(None)
                }
            }
            NodeKind::Start | NodeKind::End => Ok(Some(Value::Null)),
            NodeKind::Delay { .. } | NodeKind::Schedule { .. } => {
                // The wait itself happened at the queue level.
                Ok(Some(Value::Null))
            }
            NodeKind::Condition { expression } => {
                Ok(Some(json!(self.evaluator.evaluate_condition(expression, &ctx))))
            }
            NodeKind::Loop { condition } => {
                Ok(Some(json!(self.evaluator.evaluate_condition(condition, &ctx))))
            }
            NodeKind::Switch { expression } => {
                let value = self.evaluator.evaluate(expression, &ctx)?;
                Ok(Some(value))
            }
            NodeKind::Assign { assignments } => {
                let mut ctx = ctx;
                let mut written = serde_json::Map::new();
                for assignment in assignments {
                    let value = self.evaluator.evaluate(&assignment.expression, &ctx)?;
                    self.state
                        .set_variable(instance_id, &assignment.variable, value.clone())
                        .await?;
                    // Later assignments see earlier writes.
                    ctx.variables
                        .insert(assignment.variable.clone(), value.clone());
                    written.insert(assignment.variable.clone(), value);
                }
                Ok(Some(Value::Object(written)))
            }
            NodeKind::Script {
                expression,
                assign_to,
            } => {
                let value = self.evaluator.evaluate(expression, &ctx)?;
                if let Some(variable) = assign_to {
                    self.state
                        .set_variable(instance_id, variable, value.clone())
                        .await?;
                }
                Ok(Some(value))
            }
            NodeKind::Foreach { items } => {
                let cursor = if instance.loops.contains_key(&node.id) {
                    self.state.advance_foreach(instance_id, &node.id, None).await?
                } else {
                    let value = self.evaluator.evaluate(items, &ctx)?;
                    let items = value.as_array().cloned().unwrap_or_default();
                    self.state
                        .advance_foreach(instance_id, &node.id, Some(items))
                        .await?
                };
                Ok(Some(json!({
                    "index": cursor.index,
                    "item": cursor.current(),
                    "total": cursor.total(),
                    "done": cursor.exhausted(),
                })))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Human gates
    // -----------------------------------------------------------------------

    /// Approve a node left in `Waiting`: the node completes with an approval
    /// marker in its output, the suspended job resolves, and downstream
    /// propagation resumes.
    pub async fn approve_human_node(
        &self,
        workflow: &Workflow,
        instance_id: Uuid,
        node_id: &str,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        self.expect_waiting(instance_id, node_id).await?;

        if let Some(job) = self.find_suspended_job(instance_id, node_id).await? {
            self.queue.complete_suspended(job.id).await?;
        }

        self.state
            .mark_node_done(
                instance_id,
                node_id,
                json!({ "approved": true, "reason": reason }),
            )
            .await?;

        let ready = self.advance(workflow, instance_id, node_id).await?;
        self.enqueue_ready_nodes(workflow, instance_id, &ready).await?;
        self.state.check_workflow_completion(instance_id).await?;

        tracing::info!(instance_id = %instance_id, node_id, "human node approved");
        Ok(())
    }

    /// Reject a node left in `Waiting`: the node fails with the given
    /// reason, the instance fails, and its remaining jobs are purged.
    pub async fn reject_human_node(
        &self,
        instance_id: Uuid,
        node_id: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.expect_waiting(instance_id, node_id).await?;

        if let Some(job) = self.find_suspended_job(instance_id, node_id).await? {
            self.queue.mark_failed(job.id, reason).await?;
        }

        self.state.mark_node_failed(instance_id, node_id, reason).await?;
        self.state.check_workflow_completion(instance_id).await?;
        self.queue.remove_jobs_for_instance(instance_id).await?;

        tracing::info!(instance_id = %instance_id, node_id, reason, "human node rejected");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Instance-level operations
    // -----------------------------------------------------------------------

    /// Cancel an instance and purge its queued jobs so no orphaned job later
    /// mutates it.
    pub async fn cancel_instance(&self, instance_id: Uuid) -> Result<(), EngineError> {
        self.state.cancel_instance(instance_id).await?;
        self.queue.remove_jobs_for_instance(instance_id).await?;
        Ok(())
    }

    /// Fail an instance on behalf of a node and purge its remaining jobs.
    pub async fn fail_instance(
        &self,
        instance_id: Uuid,
        node_id: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        self.state.fail_instance(instance_id, node_id, error).await?;
        self.queue.remove_jobs_for_instance(instance_id).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    /// Evaluate every outgoing edge of a completed node. Returns
    /// (traversed, blocked) edges; counters are NOT yet incremented.
    async fn evaluate_out_edges<'a>(
        &self,
        index: &GraphIndex<'a>,
        instance: &WorkflowInstance,
        completed_node_id: &str,
    ) -> Result<(Vec<&'a Edge>, Vec<&'a Edge>), EngineError> {
        let node = index
            .node(completed_node_id)
            .ok_or_else(|| EngineError::UnknownNode(completed_node_id.to_string()))?;
        let ctx = self.eval_context_for_index(index, instance, completed_node_id);

        // Switch nodes route on label equality with the stringified output.
        let switch_value = match &node.kind {
            NodeKind::Switch { .. } => instance
                .outputs
                .get(completed_node_id)
                .map(coerce_to_string),
            _ => None,
        };

        let mut traversed = Vec::new();
        let mut blocked = Vec::new();
        for edge in index.outgoing(completed_node_id) {
            let passes = match (&switch_value, &edge.label) {
                (Some(value), Some(label)) => label == value,
                _ => {
                    edge.is_unconditional()
                        || self.evaluator.evaluate_condition(
                            edge.condition.as_deref().unwrap_or_default(),
                            &ctx,
                        )
                }
            };
            let under_cap = edge
                .max_loops
                .is_none_or(|cap| instance.traversals(&edge.id) < cap);

            if passes && under_cap {
                traversed.push(*edge);
            } else {
                tracing::debug!(
                    edge_id = edge.id.as_str(),
                    passes,
                    under_cap,
                    "edge not traversed"
                );
                blocked.push(*edge);
            }
        }
        Ok((traversed, blocked))
    }

    /// Evaluation context for expressions attached to a node: instance
    /// snapshot plus loop count (inbound cycle-edge traversals) and the
    /// foreach scope when one exists.
    fn eval_context_for(
        &self,
        workflow: &Workflow,
        instance: &WorkflowInstance,
        node_id: &str,
    ) -> EvalContext {
        let index = GraphIndex::new(workflow);
        self.eval_context_for_index(&index, instance, node_id)
    }

    fn eval_context_for_index(
        &self,
        index: &GraphIndex<'_>,
        instance: &WorkflowInstance,
        node_id: &str,
    ) -> EvalContext {
        let loop_count = index
            .incoming(node_id)
            .iter()
            .filter(|e| index.is_cycle_edge(&e.id))
            .map(|e| instance.traversals(&e.id))
            .max()
            .unwrap_or(0);

        let mut ctx = EvalContext::from_instance(instance).with_loop_count(loop_count);
        if let Some(cursor) = instance.loops.get(node_id) {
            ctx = ctx.with_scope(LoopScope {
                index: cursor.index,
                item: cursor.current().cloned().unwrap_or(Value::Null),
                total: cursor.total(),
            });
        }
        ctx
    }

    async fn expect_waiting(&self, instance_id: Uuid, node_id: &str) -> Result<(), EngineError> {
        let instance = self.state.get_instance(instance_id).await?;
        let node_state = instance
            .node_state(node_id)
            .ok_or_else(|| EngineError::UnknownNode(node_id.to_string()))?;
        if node_state.status != NodeStatus::Waiting {
            return Err(EngineError::NotWaiting {
                node: node_id.to_string(),
                status: node_state.status,
            });
        }
        Ok(())
    }

    async fn find_suspended_job(
        &self,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<Option<gantry_types::job::Job>, EngineError> {
        let jobs = self.queue.waiting_human_jobs(Some(instance_id)).await?;
        Ok(jobs.into_iter().find(|j| j.payload.node_id == node_id))
    }
}

/// Every non-cycle inbound edge's source has resolved (done or skipped).
fn join_satisfied(index: &GraphIndex<'_>, instance: &WorkflowInstance, node_id: &str) -> bool {
    index.incoming(node_id).iter().all(|edge| {
        if index.is_cycle_edge(&edge.id) {
            return true;
        }
        instance
            .node_state(&edge.from)
            .map(|s| s.status.is_resolved())
            .unwrap_or(false)
    })
}

/// Queue visibility delay for delay/schedule nodes.
fn enqueue_delay(node: &Node) -> Option<Duration> {
    match &node.kind {
        NodeKind::Delay { duration_ms } => Some(Duration::from_millis(*duration_ms)),
        NodeKind::Schedule { at } => {
            let until = (*at - chrono::Utc::now()).num_milliseconds().max(0);
            Some(Duration::from_millis(until as u64))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
