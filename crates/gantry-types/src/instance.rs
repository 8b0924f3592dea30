//! Workflow instance and node runtime state.
//!
//! A [`WorkflowInstance`] is one execution attempt of a workflow: the unit of
//! persistence and the unit a worker is bound to. It owns every
//! [`NodeState`], the mutable variables, accumulated outputs, and the
//! per-edge traversal counters that enforce loop limits.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::graph::Workflow;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        match self {
            InstanceStatus::Pending => matches!(
                next,
                InstanceStatus::Running | InstanceStatus::Cancelled | InstanceStatus::Failed
            ),
            InstanceStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Status of a single node within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Waiting,
    Done,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// Done, Failed, or Skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Failed | NodeStatus::Skipped)
    }

    /// Resolved successfully for join purposes (Done or Skipped).
    pub fn is_resolved(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Skipped)
    }

    /// Enqueued, executing, or suspended; blocks instance completion.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, NodeStatus::Ready | NodeStatus::Running | NodeStatus::Waiting)
    }

    /// Whether `next` is a legal transition from `self`.
    ///
    /// `Done -> Ready` is permitted: a cyclic edge re-activates its target
    /// while the node's attempt history persists. `Running -> Ready` is the
    /// retry re-queue, and `Ready -> Failed` is dispatch-time rejection at
    /// the attempt ceiling. Any non-terminal state may become `Skipped` (an
    /// unreached branch).
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        if next == NodeStatus::Skipped {
            return !self.is_terminal();
        }
        match self {
            NodeStatus::Pending => next == NodeStatus::Ready,
            NodeStatus::Ready => matches!(next, NodeStatus::Running | NodeStatus::Failed),
            NodeStatus::Running => matches!(
                next,
                NodeStatus::Done | NodeStatus::Failed | NodeStatus::Waiting | NodeStatus::Ready
            ),
            NodeStatus::Waiting => matches!(next, NodeStatus::Done | NodeStatus::Failed),
            NodeStatus::Done => next == NodeStatus::Ready,
            NodeStatus::Failed | NodeStatus::Skipped => false,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Runtime state of one node within an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Current status.
    pub status: NodeStatus,
    /// Dispatch count. Monotonically non-decreasing; the single source of
    /// truth for attempt ceilings. Read from the instance, never from a
    /// queue job -- a job may be re-enqueued with a fresh id while the node's
    /// history persists.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            error: None,
            duration_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Foreach cursor
// ---------------------------------------------------------------------------

/// Iteration cursor for a `foreach` node, stored on the instance so a
/// process restart resumes mid-iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    /// The materialized items, evaluated once on first entry.
    pub items: Vec<Value>,
    /// Index of the current item.
    pub index: usize,
}

impl LoopState {
    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn current(&self) -> Option<&Value> {
        self.items.get(self.index)
    }

    pub fn exhausted(&self) -> bool {
        self.index >= self.items.len()
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One execution attempt of a workflow, holding all mutable runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance id.
    pub id: Uuid,
    /// The workflow definition being executed.
    pub workflow_id: Uuid,
    /// Overall status.
    pub status: InstanceStatus,
    /// Per-node runtime state, keyed by node id.
    pub node_states: HashMap<String, NodeState>,
    /// Mutable variables, seeded from the workflow's initial variables and
    /// writable by `assign`/`script` nodes.
    pub variables: HashMap<String, Value>,
    /// Accumulated node outputs, keyed by node id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, Value>,
    /// Per-edge traversal counters for loop-limit enforcement.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub edge_traversals: HashMap<String, u32>,
    /// Foreach cursors, keyed by node id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub loops: HashMap<String, LoopState>,
    /// Error of the node that failed the instance, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Create a fresh instance for a workflow: all nodes `Pending`, variables
    /// seeded from the definition.
    pub fn for_workflow(workflow: &Workflow) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow.id,
            status: InstanceStatus::Pending,
            node_states: workflow
                .nodes
                .iter()
                .map(|n| (n.id.clone(), NodeState::default()))
                .collect(),
            variables: workflow.variables.clone(),
            outputs: HashMap::new(),
            edge_traversals: HashMap::new(),
            loops: HashMap::new(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Runtime state of a node, if the node exists.
    pub fn node_state(&self, node_id: &str) -> Option<&NodeState> {
        self.node_states.get(node_id)
    }

    /// How many times an edge has been traversed in this instance.
    pub fn traversals(&self, edge_id: &str) -> u32 {
        self.edge_traversals.get(edge_id).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Node, NodeKind};
    use serde_json::json;

    fn two_node_workflow() -> Workflow {
        Workflow {
            id: Uuid::now_v7(),
            name: "test-wf".into(),
            description: None,
            version: "1.0.0".into(),
            nodes: vec![
                Node {
                    id: "start".into(),
                    name: "Start".into(),
                    kind: NodeKind::Start,
                    retry: None,
                },
                Node {
                    id: "end".into(),
                    name: "End".into(),
                    kind: NodeKind::End,
                    retry: None,
                },
            ],
            edges: vec![Edge {
                id: "e1".into(),
                from: "start".into(),
                to: "end".into(),
                condition: None,
                max_loops: None,
                label: None,
            }],
            variables: HashMap::from([("count".to_string(), json!(0))]),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_instance_seeded_from_workflow() {
        let wf = two_node_workflow();
        let instance = WorkflowInstance::for_workflow(&wf);

        assert_eq!(instance.workflow_id, wf.id);
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.node_states.len(), 2);
        assert_eq!(
            instance.node_state("start").unwrap().status,
            NodeStatus::Pending
        );
        assert_eq!(instance.variables.get("count"), Some(&json!(0)));
        assert_eq!(instance.traversals("e1"), 0);
    }

    #[test]
    fn test_node_status_transitions() {
        use NodeStatus::*;

        assert!(Pending.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Done));
        assert!(Waiting.can_transition_to(Failed));
        // Loop re-entry and retry re-queue
        assert!(Done.can_transition_to(Ready));
        assert!(Running.can_transition_to(Ready));
        // Dispatch-time rejection at the attempt ceiling
        assert!(Ready.can_transition_to(Failed));
        // Unreached branches may be skipped from any non-terminal state
        assert!(Pending.can_transition_to(Skipped));
        assert!(Waiting.can_transition_to(Skipped));
        assert!(!Done.can_transition_to(Skipped));
        assert!(!Failed.can_transition_to(Skipped));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Ready.can_transition_to(Done));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Skipped.can_transition_to(Ready));
    }

    #[test]
    fn test_instance_status_transitions() {
        use InstanceStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_node_status_predicates() {
        assert!(NodeStatus::Done.is_resolved());
        assert!(NodeStatus::Skipped.is_resolved());
        assert!(!NodeStatus::Failed.is_resolved());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(NodeStatus::Waiting.is_in_flight());
        assert!(!NodeStatus::Pending.is_in_flight());
    }

    #[test]
    fn test_loop_state_cursor() {
        let mut cursor = LoopState {
            items: vec![json!("a"), json!("b")],
            index: 0,
        };
        assert_eq!(cursor.total(), 2);
        assert_eq!(cursor.current(), Some(&json!("a")));
        assert!(!cursor.exhausted());

        cursor.index = 2;
        assert!(cursor.exhausted());
        assert_eq!(cursor.current(), None);
    }

    #[test]
    fn test_instance_json_roundtrip() {
        let wf = two_node_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.outputs.insert("start".into(), json!(null));
        instance.edge_traversals.insert("e1".into(), 1);

        let encoded = serde_json::to_string(&instance).unwrap();
        let decoded: WorkflowInstance = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, instance.id);
        assert_eq!(decoded.traversals("e1"), 1);
        assert_eq!(decoded.node_states.len(), 2);
    }
}
