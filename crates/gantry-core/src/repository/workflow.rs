//! Workflow and instance repository trait definition.
//!
//! Defines the storage interface for workflow definitions and execution
//! instances. Supports partial-id lookup and listing by status so operators
//! can reference entities by id prefix.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use gantry_types::error::RepositoryError;
use gantry_types::graph::Workflow;
use gantry_types::instance::{InstanceStatus, WorkflowInstance};
use uuid::Uuid;

/// Repository trait for workflow definitions and instances.
///
/// Two entity families:
/// - **Definitions:** immutable workflow graphs, keyed by UUID.
/// - **Instances:** one record per execution attempt; `save_instance` is the
///   atomic persistence point for every state transition, so an
///   implementation must replace the full record in one write.
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by id).
    fn save_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// Find a workflow by id prefix. Returns `Conflict` if the prefix is
    /// ambiguous.
    fn find_workflow(
        &self,
        id_prefix: &str,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// List all workflow definitions.
    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Delete a workflow definition by id. Returns `true` if it existed.
    fn delete_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Persist the full instance record (insert or replace by id).
    fn save_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an instance by its UUID.
    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Find an instance by id prefix. Returns `Conflict` if the prefix is
    /// ambiguous.
    fn find_instance(
        &self,
        id_prefix: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// List instances, optionally filtered by status, newest first.
    fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Delete an instance by id. Returns `true` if it existed. Callers are
    /// responsible for purging the instance's queued jobs.
    fn delete_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
