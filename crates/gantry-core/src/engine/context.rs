//! Evaluation context exposed to workflow expressions.
//!
//! `EvalContext` is a typed struct rather than a loose map: the loop fields
//! exist only inside loop/foreach bodies, and everything else is read-only
//! snapshot data from the instance. The expression language itself stays
//! dynamically typed over `serde_json::Value`.

use std::collections::HashMap;

use gantry_types::instance::{NodeStatus, WorkflowInstance};
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// LoopScope
// ---------------------------------------------------------------------------

/// Iteration scope present only inside a loop/foreach body.
#[derive(Debug, Clone)]
pub struct LoopScope {
    /// Zero-based index of the current item.
    pub index: usize,
    /// The current item.
    pub item: Value,
    /// Total number of items.
    pub total: usize,
}

// ---------------------------------------------------------------------------
// EvalContext
// ---------------------------------------------------------------------------

/// Read-only data surface for expression evaluation.
///
/// Serializes to the JSON object expressions evaluate against:
///
/// ```json
/// {
///   "outputs": { "<node_id>": <value>, ... },
///   "variables": { ... },
///   "nodeStates": { "<node_id>": "done", ... },
///   "loopCount": 0,
///   "index": 0, "item": ..., "total": 3   // only inside loop bodies
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Accumulated node outputs keyed by node id.
    pub outputs: HashMap<String, Value>,
    /// Instance variables.
    pub variables: HashMap<String, Value>,
    /// Node statuses keyed by node id.
    pub node_states: HashMap<String, NodeStatus>,
    /// Completed loop iterations at the point of evaluation.
    pub loop_count: u32,
    /// Present only inside a loop/foreach body.
    pub scope: Option<LoopScope>,
}

impl EvalContext {
    /// Snapshot the expression-visible parts of an instance.
    pub fn from_instance(instance: &WorkflowInstance) -> Self {
        Self {
            outputs: instance.outputs.clone(),
            variables: instance.variables.clone(),
            node_states: instance
                .node_states
                .iter()
                .map(|(id, state)| (id.clone(), state.status))
                .collect(),
            loop_count: 0,
            scope: None,
        }
    }

    /// Attach a loop iteration count.
    pub fn with_loop_count(mut self, loop_count: u32) -> Self {
        self.loop_count = loop_count;
        self
    }

    /// Attach a foreach iteration scope.
    pub fn with_scope(mut self, scope: LoopScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Build the JSON object that expressions evaluate against.
    pub fn to_expression_context(&self) -> Value {
        let node_states: serde_json::Map<String, Value> = self
            .node_states
            .iter()
            .map(|(id, status)| {
                (
                    id.clone(),
                    serde_json::to_value(status).unwrap_or(Value::Null),
                )
            })
            .collect();

        let mut context = json!({
            "outputs": self.outputs,
            "variables": self.variables,
            "nodeStates": node_states,
            "loopCount": self.loop_count,
        });

        if let (Some(scope), Some(obj)) = (&self.scope, context.as_object_mut()) {
            obj.insert("index".to_string(), json!(scope.index));
            obj.insert("item".to_string(), scope.item.clone());
            obj.insert("total".to_string(), json!(scope.total));
        }

        context
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_context_shape() {
        let ctx = EvalContext::default().to_expression_context();
        assert_eq!(ctx["loopCount"], json!(0));
        assert!(ctx["outputs"].as_object().unwrap().is_empty());
        assert!(ctx.get("index").is_none(), "no loop scope outside loops");
    }

    #[test]
    fn test_loop_scope_merged_at_top_level() {
        let ctx = EvalContext::default()
            .with_loop_count(2)
            .with_scope(LoopScope {
                index: 1,
                item: json!("b"),
                total: 3,
            })
            .to_expression_context();

        assert_eq!(ctx["loopCount"], json!(2));
        assert_eq!(ctx["index"], json!(1));
        assert_eq!(ctx["item"], json!("b"));
        assert_eq!(ctx["total"], json!(3));
    }

    #[test]
    fn test_node_states_serialized_as_strings() {
        let mut ctx = EvalContext::default();
        ctx.node_states.insert("gather".into(), NodeStatus::Done);
        ctx.node_states.insert("review".into(), NodeStatus::Waiting);
        let value = ctx.to_expression_context();
        assert_eq!(value["nodeStates"]["gather"], json!("done"));
        assert_eq!(value["nodeStates"]["review"], json!("waiting"));
    }
}
