//! Workflow graph types for Gantry.
//!
//! A workflow is an immutable directed graph of [`Node`]s connected by
//! [`Edge`]s. Edges may carry a boolean condition expression and a traversal
//! cap (`max_loops`), which is what turns a cyclic edge into a bounded loop.
//! YAML files and programmatic builders both produce this representation; it
//! is the single source of truth for a workflow's shape.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// An immutable workflow definition.
///
/// Never mutated after creation; one [`crate::instance::WorkflowInstance`] is
/// created per execution attempt and holds all mutable runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable workflow name (alphanumeric and hyphens).
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Version string (e.g. "1.0.0").
    pub version: String,
    /// Ordered list of nodes forming the workflow graph.
    pub nodes: Vec<Node>,
    /// Directed edges between nodes.
    pub edges: Vec<Edge>,
    /// Initial variables seeded into every instance.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Value>,
    /// When the definition was created.
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up an edge by id.
    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// The start node, if the graph has one.
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Start))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A unit of work or control-flow construct in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// User-defined node id (e.g. "gather-news"). Unique within a workflow.
    pub id: String,
    /// Human-readable node name.
    pub name: String,
    /// The kind of node, with its type-specific payload.
    pub kind: NodeKind,
    /// Per-node retry overrides. A node-level `max_attempts` always wins
    /// over the error-category default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOverrides>,
}

/// The kind of node, tagged by `type` to match the on-disk YAML shape:
///
/// ```yaml
/// kind:
///   type: task
///   prompt: "Summarize the findings"
///   agent: researcher
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Structural entry sentinel. No payload; never dispatched.
    Start,
    /// Structural exit sentinel.
    End,
    /// Delegated work item, executed by the injected node processor.
    Task {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
    /// Human approval gate. The node suspends in `Waiting` until an external
    /// actor approves or rejects it, unless `auto_approve` is set.
    Human {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default)]
        auto_approve: bool,
    },
    /// Evaluates a boolean expression; downstream edge conditions route on
    /// the stored output.
    Condition { expression: String },
    /// Evaluates an expression to a value; outgoing labeled edges route on
    /// the stringified result.
    Switch { expression: String },
    /// Writes instance variables, in order.
    Assign { assignments: Vec<Assignment> },
    /// Evaluates a single expression; stores the value as the node output
    /// and optionally into a variable.
    Script {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assign_to: Option<String>,
    },
    /// Loop guard: evaluates its condition (with loop context) into a
    /// boolean output. The cycle itself is formed by edges.
    Loop { condition: String },
    /// Iterates over the array produced by `items`, exposing
    /// `index`/`item`/`total` to expressions in the body.
    Foreach { items: String },
    /// Relative delay, realized as queue-level visibility delay so a process
    /// restart does not lose it.
    Delay { duration_ms: u64 },
    /// Absolute-time variant of `Delay`.
    Schedule { at: DateTime<Utc> },
}

impl NodeKind {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Task { .. } => "task",
            NodeKind::Human { .. } => "human",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Switch { .. } => "switch",
            NodeKind::Assign { .. } => "assign",
            NodeKind::Script { .. } => "script",
            NodeKind::Loop { .. } => "loop",
            NodeKind::Foreach { .. } => "foreach",
            NodeKind::Delay { .. } => "delay",
            NodeKind::Schedule { .. } => "schedule",
        }
    }

    /// Whether this kind is executed by the external node processor rather
    /// than by the engine's built-in handlers.
    pub fn is_external(&self) -> bool {
        matches!(self, NodeKind::Task { .. } | NodeKind::Human { .. })
    }
}

/// One variable write performed by an `Assign` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    /// Variable name to write.
    pub variable: String,
    /// Expression producing the value.
    pub expression: String,
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// A directed, optionally conditional and loop-bounded link between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Edge id, unique within the workflow.
    pub id: String,
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Boolean condition expression. Absent means unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Maximum traversals of this edge per instance. The sole
    /// loop-termination guard on a cyclic edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loops: Option<u32>,
    /// Optional label; switch nodes route on label equality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    /// Whether this edge has no condition attached.
    pub fn is_unconditional(&self) -> bool {
        self.condition.as_deref().is_none_or(|c| c.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Retry overrides
// ---------------------------------------------------------------------------

/// Per-node overrides for the retry policy's category defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryOverrides {
    /// Hard attempt ceiling for this node. Always wins over the category
    /// default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Base backoff delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    /// Backoff multiplier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
