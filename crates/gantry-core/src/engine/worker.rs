//! Concurrency-bounded polling worker.
//!
//! The worker repeatedly pulls eligible jobs from the queue (up to N in
//! flight), dispatches each on its own task, and feeds results back through
//! the transition engine. The poll loop never blocks on a job: a semaphore
//! enforces the concurrency cap and each dispatched task returns its permit
//! on completion.
//!
//! Worker state is an explicit [`WorkerHandle`] owned by whoever started it
//! -- never a process-global. One handle per instance lets several instances
//! run concurrently under independent workers without cross-talk, because a
//! bound worker only ever claims its own instance's jobs.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use gantry_types::graph::{Node, Workflow};
use gantry_types::job::{Job, JobPayload};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::job::JobRepository;
use crate::repository::workflow::WorkflowRepository;

use super::retry::RetryPolicy;
use super::state::StateError;
use super::transition::{EngineError, WorkflowEngine};

// ---------------------------------------------------------------------------
// Processor contract
// ---------------------------------------------------------------------------

/// Reserved error string meaning "suspend, do not retry, await external
/// resume". Kept for processors that signal suspension through the failure
/// path instead of [`ProcessorOutcome::Suspended`].
pub const WAITING_SENTINEL: &str = "WAITING_FOR_APPROVAL";

/// What the injected processor reports back for one dispatched node.
#[derive(Debug, Clone)]
pub enum ProcessorOutcome {
    /// The node produced this output.
    Success(Value),
    /// Waiting for external approval; no retry scheduling, resumption only
    /// via the engine's approve/reject path.
    Suspended,
    /// The node failed; the message feeds the retry policy.
    Failure(String),
}

impl ProcessorOutcome {
    /// Map the legacy waiting sentinel onto [`ProcessorOutcome::Suspended`].
    fn normalized(self) -> Self {
        match self {
            ProcessorOutcome::Failure(message) if message == WAITING_SENTINEL => {
                ProcessorOutcome::Suspended
            }
            other => other,
        }
    }
}

/// What the processor receives for one dispatched node.
#[derive(Debug, Clone)]
pub struct ProcessorRequest {
    pub payload: JobPayload,
    pub node: Node,
}

/// The injected node-body executor. Opaque to the engine; it only knows the
/// three-way outcome.
pub type NodeProcessor =
    Arc<dyn Fn(ProcessorRequest) -> BoxFuture<'static, ProcessorOutcome> + Send + Sync>;

/// Wrap an async closure as a [`NodeProcessor`].
pub fn processor_fn<F, Fut>(f: F) -> NodeProcessor
where
    F: Fn(ProcessorRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ProcessorOutcome> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum jobs in flight at once.
    pub concurrency: usize,
    /// How long the loop sleeps when no job is available or the cap is
    /// reached.
    pub poll_interval: Duration,
    /// When set, this worker only claims jobs for the given instance.
    pub instance: Option<Uuid>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            instance: None,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeWorker
// ---------------------------------------------------------------------------

/// Polling dispatcher over the job queue.
pub struct NodeWorker<R: WorkflowRepository + 'static, J: JobRepository + 'static> {
    engine: Arc<WorkflowEngine<R, J>>,
    processor: NodeProcessor,
    retry: RetryPolicy,
    config: WorkerConfig,
    /// Workflow definitions by id, fetched once per worker.
    workflows: DashMap<Uuid, Arc<Workflow>>,
}

impl<R: WorkflowRepository + 'static, J: JobRepository + 'static> NodeWorker<R, J> {
    pub fn new(
        engine: Arc<WorkflowEngine<R, J>>,
        processor: NodeProcessor,
        retry: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            engine,
            processor,
            retry,
            config,
            workflows: DashMap::new(),
        }
    }

    /// Start the poll loop. The returned handle owns the worker's lifetime.
    pub fn start(self) -> WorkerHandle {
        let concurrency = self.config.concurrency.max(1);
        let token = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let worker = Arc::new(self);
        let loop_token = token.clone();
        let loop_semaphore = Arc::clone(&semaphore);
        let handle = tokio::spawn(async move {
            worker.run_loop(loop_token, loop_semaphore).await;
        });

        WorkerHandle {
            token,
            handle,
            semaphore,
            concurrency,
        }
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken, semaphore: Arc<Semaphore>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::debug!(
            concurrency = self.config.concurrency,
            instance = ?self.config.instance,
            "worker loop started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    Self::drain_available(&self, &semaphore).await;
                }
            }
        }

        tracing::debug!("worker loop stopped");
    }

    /// Claim and dispatch jobs until the cap is reached or the queue has
    /// nothing eligible. Dispatched jobs are fire-and-forget from the
    /// loop's perspective; each returns its permit when done.
    async fn drain_available(worker: &Arc<Self>, semaphore: &Arc<Semaphore>) {
        loop {
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                break;
            };
            match worker.engine.queue().get_next_job(worker.config.instance).await {
                Ok(Some(job)) => {
                    let worker = Arc::clone(worker);
                    tokio::spawn(async move {
                        worker.dispatch(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "queue poll failed");
                    break;
                }
            }
        }
    }

    async fn dispatch(self: Arc<Self>, job: Job) {
        let job_id = job.id;
        let node_id = job.payload.node_id.clone();
        if let Err(err) = self.process_job(job).await {
            tracing::error!(%job_id, node_id = node_id.as_str(), %err, "job processing failed internally");
        }
    }

    async fn process_job(&self, job: Job) -> Result<(), EngineError> {
        let payload = job.payload.clone();
        let instance_id = payload.instance_id;
        let state = self.engine.state();
        let queue = self.engine.queue();

        let Some(workflow) = self.workflow(payload.workflow_id).await? else {
            queue.mark_failed(job.id, "workflow definition not found").await?;
            return Ok(());
        };

        let instance = state.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            queue
                .mark_failed(job.id, "instance is no longer running")
                .await?;
            return Ok(());
        }

        let Some(node) = workflow.node(&payload.node_id) else {
            queue.mark_failed(job.id, "node not in workflow").await?;
            return Ok(());
        };

        // The attempt ceiling is enforced against the instance's node state,
        // never the job payload: a re-enqueued job is new, the node's
        // history is not.
        let attempts = instance
            .node_state(&node.id)
            .map(|s| s.attempts)
            .unwrap_or(0);
        let ceiling = self.retry.hard_ceiling(node.retry.as_ref());
        if attempts >= ceiling {
            let error = instance
                .node_state(&node.id)
                .and_then(|s| s.error.clone())
                .unwrap_or_else(|| {
                    format!("node '{}' exhausted its {ceiling} allowed attempts", node.id)
                });
            tracing::warn!(
                instance_id = %instance_id,
                node_id = node.id.as_str(),
                attempts,
                ceiling,
                "attempt ceiling reached, failing instance"
            );
            queue.mark_failed(job.id, &error).await?;
            state.mark_node_failed(instance_id, &node.id, &error).await?;
            state.check_workflow_completion(instance_id).await?;
            queue.remove_jobs_for_instance(instance_id).await?;
            return Ok(());
        }

        let attempt = state.mark_node_running(instance_id, &node.id).await?;
        tracing::debug!(
            instance_id = %instance_id,
            node_id = node.id.as_str(),
            kind = node.kind.name(),
            attempt,
            "dispatching node"
        );

        // Built-in kinds run in-engine; task and suspending human gates go
        // to the injected processor.
        let outcome = match self
            .engine
            .execute_builtin(&workflow, instance_id, node)
            .await
        {
            Ok(Some(value)) => ProcessorOutcome::Success(value),
            Ok(None) => {
                (self.processor)(ProcessorRequest {
                    payload: payload.clone(),
                    node: node.clone(),
                })
                .await
            }
            Err(err) => ProcessorOutcome::Failure(err.to_string()),
        };

        match outcome.normalized() {
            ProcessorOutcome::Success(value) => {
                state.mark_node_done(instance_id, &node.id, value).await?;
                queue.complete(job.id).await?;
                let ready = self.engine.advance(&workflow, instance_id, &node.id).await?;
                self.engine
                    .enqueue_ready_nodes(&workflow, instance_id, &ready)
                    .await?;
                state.check_workflow_completion(instance_id).await?;
            }
            ProcessorOutcome::Suspended => {
                queue.mark_waiting(job.id).await?;
                state.mark_node_waiting(instance_id, &node.id).await?;
                tracing::info!(
                    instance_id = %instance_id,
                    node_id = node.id.as_str(),
                    "node suspended awaiting approval"
                );
            }
            ProcessorOutcome::Failure(error) => {
                let decision = self.retry.should_retry(&error, attempt, node.retry.as_ref());
                if decision.retry && attempt < ceiling {
                    tracing::warn!(
                        instance_id = %instance_id,
                        node_id = node.id.as_str(),
                        attempt,
                        delay_ms = decision.delay_ms,
                        error = error.as_str(),
                        "node failed, scheduling retry"
                    );
                    state.mark_node_ready(instance_id, &node.id).await?;
                    queue
                        .fail(
                            job.id,
                            &error,
                            Some(Duration::from_millis(decision.delay_ms)),
                        )
                        .await?;
                } else {
                    tracing::warn!(
                        instance_id = %instance_id,
                        node_id = node.id.as_str(),
                        attempt,
                        reason = decision.reason.as_str(),
                        error = error.as_str(),
                        "node failed terminally"
                    );
                    queue.mark_failed(job.id, &error).await?;
                    state.mark_node_failed(instance_id, &node.id, &error).await?;
                    state.check_workflow_completion(instance_id).await?;
                    queue.remove_jobs_for_instance(instance_id).await?;
                }
            }
        }

        Ok(())
    }

    async fn workflow(&self, id: Uuid) -> Result<Option<Arc<Workflow>>, EngineError> {
        if let Some(cached) = self.workflows.get(&id) {
            return Ok(Some(Arc::clone(&cached)));
        }
        let loaded = self
            .engine
            .state()
            .repo()
            .get_workflow(&id)
            .await
            .map_err(StateError::from)?;
        Ok(loaded.map(|workflow| {
            let shared = Arc::new(workflow);
            self.workflows.insert(id, Arc::clone(&shared));
            shared
        }))
    }
}

// ---------------------------------------------------------------------------
// WorkerHandle
// ---------------------------------------------------------------------------

/// Handle to a running worker. Closing stops the poll loop, waits for
/// in-flight jobs to finish, and releases all resources; callers that need a
/// grace bound wrap `close` in a timeout.
pub struct WorkerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl WorkerHandle {
    /// Stop accepting new polls and drain in-flight jobs.
    pub async fn close(self) {
        self.token.cancel();
        let _ = self.handle.await;
        // Every permit back means every dispatched job has finished.
        let _ = self.semaphore.acquire_many(self.concurrency as u32).await;
    }

    /// Stop immediately without draining.
    pub fn abort(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
