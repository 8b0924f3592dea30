//! Workflow graph validation and topology index.
//!
//! Uses `petgraph` to model the node graph. Unlike a plain DAG, workflow
//! graphs may contain cycles -- but only bounded ones: validation rejects any
//! cycle that has no `max_loops`-capped edge, since such a cycle could only
//! be stopped by livelock. [`GraphIndex`] precomputes the edge maps and the
//! cycle-member edge set the transition engine needs on every completion.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use gantry_types::graph::{Edge, Node, NodeKind, Workflow};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use super::expression::ExpressionEvaluator;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from workflow graph validation and definition files.
#[derive(Debug, Error)]
pub enum GraphError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// An edge references a node that does not exist.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A cycle exists with no loop-bounded edge to terminate it.
    #[error("unbounded cycle involving node '{0}': every cycle needs an edge with max_loops")]
    UnboundedCycle(String),

    /// An edge condition failed syntax validation.
    #[error("invalid condition on edge '{edge}': {message}")]
    InvalidCondition { edge: String, message: String },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a workflow definition.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters and hyphens
/// - At least one node exists; node and edge ids are unique
/// - Every edge references existing nodes
/// - Exactly one `start` node and at least one `end` node
/// - `max_loops >= 1` when present
/// - Every edge condition parses
/// - Every cycle contains at least one `max_loops`-bounded edge
pub fn validate_workflow(
    workflow: &Workflow,
    evaluator: &ExpressionEvaluator,
) -> Result<(), GraphError> {
    if workflow.name.is_empty() {
        return Err(GraphError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !workflow
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(GraphError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric and hyphens allowed)",
            workflow.name
        )));
    }

    if workflow.nodes.is_empty() {
        return Err(GraphError::ValidationError(
            "workflow must have at least one node".to_string(),
        ));
    }

    let mut node_ids = HashSet::new();
    for node in &workflow.nodes {
        if !node_ids.insert(node.id.as_str()) {
            return Err(GraphError::ValidationError(format!(
                "duplicate node id: '{}'",
                node.id
            )));
        }
    }

    let mut edge_ids = HashSet::new();
    for edge in &workflow.edges {
        if !edge_ids.insert(edge.id.as_str()) {
            return Err(GraphError::ValidationError(format!(
                "duplicate edge id: '{}'",
                edge.id
            )));
        }
        for endpoint in [&edge.from, &edge.to] {
            if !node_ids.contains(endpoint.as_str()) {
                return Err(GraphError::UnknownNode(format!(
                    "edge '{}' references unknown node '{}'",
                    edge.id, endpoint
                )));
            }
        }
        if edge.max_loops == Some(0) {
            return Err(GraphError::ValidationError(format!(
                "edge '{}' has max_loops 0; a loop edge must allow at least one traversal",
                edge.id
            )));
        }
        if let Some(condition) = &edge.condition {
            evaluator
                .validate(condition)
                .map_err(|e| GraphError::InvalidCondition {
                    edge: edge.id.clone(),
                    message: e.to_string(),
                })?;
        }
    }

    let starts = workflow
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Start))
        .count();
    if starts != 1 {
        return Err(GraphError::ValidationError(format!(
            "workflow must have exactly one start node, found {starts}"
        )));
    }
    if !workflow
        .nodes
        .iter()
        .any(|n| matches!(n.kind, NodeKind::End))
    {
        return Err(GraphError::ValidationError(
            "workflow must have at least one end node".to_string(),
        ));
    }

    validate_cycles_bounded(workflow)?;

    Ok(())
}

/// Every strongly connected component that contains a cycle must include at
/// least one edge with `max_loops` -- that cap is the sole loop-termination
/// guard.
fn validate_cycles_bounded(workflow: &Workflow) -> Result<(), GraphError> {
    let (graph, index_of) = build_petgraph(workflow);
    let components = tarjan_scc(&graph);

    for component in components {
        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let is_cycle = component.len() > 1
            || component.iter().any(|&n| {
                workflow.edges.iter().any(|e| {
                    e.from == graph[n] && e.to == graph[n]
                })
            });
        if !is_cycle {
            continue;
        }

        let bounded = workflow.edges.iter().any(|e| {
            e.max_loops.is_some()
                && members.contains(&index_of[e.from.as_str()])
                && members.contains(&index_of[e.to.as_str()])
        });
        if !bounded {
            let name = graph[component[0]].to_string();
            return Err(GraphError::UnboundedCycle(name));
        }
    }

    Ok(())
}

/// Build the petgraph representation: node weights are node ids.
fn build_petgraph<'a>(
    workflow: &'a Workflow,
) -> (DiGraph<&'a str, ()>, HashMap<&'a str, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut index_of = HashMap::new();
    for node in &workflow.nodes {
        let idx = graph.add_node(node.id.as_str());
        index_of.insert(node.id.as_str(), idx);
    }
    for edge in &workflow.edges {
        if let (Some(&from), Some(&to)) = (
            index_of.get(edge.from.as_str()),
            index_of.get(edge.to.as_str()),
        ) {
            graph.add_edge(from, to, ());
        }
    }
    (graph, index_of)
}

// ---------------------------------------------------------------------------
// GraphIndex
// ---------------------------------------------------------------------------

/// Precomputed topology for one workflow: edge maps, node lookup, and the
/// set of cycle-member edges (exempt from join gating -- inside a cycle,
/// re-activation drives readiness rather than predecessor resolution).
pub struct GraphIndex<'a> {
    nodes: HashMap<&'a str, &'a Node>,
    outgoing: HashMap<&'a str, Vec<&'a Edge>>,
    incoming: HashMap<&'a str, Vec<&'a Edge>>,
    cycle_edges: HashSet<&'a str>,
    /// Strongly connected component id per node.
    scc_of: HashMap<&'a str, usize>,
    /// For each cyclic SCC, the edges that form its cycles.
    scc_cycle_edges: HashMap<usize, Vec<&'a Edge>>,
}

impl<'a> GraphIndex<'a> {
    pub fn new(workflow: &'a Workflow) -> Self {
        let mut nodes = HashMap::new();
        for node in &workflow.nodes {
            nodes.insert(node.id.as_str(), node);
        }

        let mut outgoing: HashMap<&str, Vec<&Edge>> = HashMap::new();
        let mut incoming: HashMap<&str, Vec<&Edge>> = HashMap::new();
        for edge in &workflow.edges {
            outgoing.entry(edge.from.as_str()).or_default().push(edge);
            incoming.entry(edge.to.as_str()).or_default().push(edge);
        }

        // An edge is a cycle member when both endpoints share a strongly
        // connected component that actually contains a cycle.
        let (graph, _) = build_petgraph(workflow);
        let mut scc_of: HashMap<&str, usize> = HashMap::new();
        let mut cyclic_sccs: HashSet<usize> = HashSet::new();
        for (scc_id, component) in tarjan_scc(&graph).into_iter().enumerate() {
            let has_self_loop = component.iter().any(|&n| {
                workflow
                    .edges
                    .iter()
                    .any(|e| e.from == graph[n] && e.to == graph[n])
            });
            if component.len() > 1 || has_self_loop {
                cyclic_sccs.insert(scc_id);
            }
            for idx in component {
                scc_of.insert(graph[idx], scc_id);
            }
        }
        let mut cycle_edges = HashSet::new();
        let mut scc_cycle_edges: HashMap<usize, Vec<&Edge>> = HashMap::new();
        for edge in &workflow.edges {
            let same_scc = scc_of.get(edge.from.as_str()) == scc_of.get(edge.to.as_str());
            if let Some(&scc_id) = scc_of.get(edge.from.as_str()) {
                if same_scc && cyclic_sccs.contains(&scc_id) {
                    cycle_edges.insert(edge.id.as_str());
                    scc_cycle_edges.entry(scc_id).or_default().push(edge);
                }
            }
        }

        Self {
            nodes,
            outgoing,
            incoming,
            cycle_edges,
            scc_of,
            scc_cycle_edges,
        }
    }

    pub fn node(&self, id: &str) -> Option<&'a Node> {
        self.nodes.get(id).copied()
    }

    pub fn outgoing(&self, node_id: &str) -> &[&'a Edge] {
        self.outgoing.get(node_id).map_or(&[], |v| v.as_slice())
    }

    pub fn incoming(&self, node_id: &str) -> &[&'a Edge] {
        self.incoming.get(node_id).map_or(&[], |v| v.as_slice())
    }

    /// Whether an edge is part of a cycle (exempt from join gating).
    pub fn is_cycle_edge(&self, edge_id: &str) -> bool {
        self.cycle_edges.contains(edge_id)
    }

    /// Whether a node sits inside a cycle that may still be traversed for
    /// the given instance: some cycle edge of its component has loop budget
    /// remaining. A node outside any cycle never "continues".
    ///
    /// Used by the skip cascade: a branch fed from a still-live loop must
    /// not be skipped early -- the loop may yet traverse into it.
    pub fn cycle_may_continue(
        &self,
        instance: &gantry_types::instance::WorkflowInstance,
        node_id: &str,
    ) -> bool {
        let Some(scc_id) = self.scc_of.get(node_id) else {
            return false;
        };
        let Some(edges) = self.scc_cycle_edges.get(scc_id) else {
            return false;
        };
        edges.iter().any(|e| match e.max_loops {
            Some(cap) => instance.traversals(&e.id) < cap,
            None => true,
        })
    }
}

// ---------------------------------------------------------------------------
// Definition files
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated workflow definition.
pub fn parse_workflow_yaml(
    yaml: &str,
    evaluator: &ExpressionEvaluator,
) -> Result<Workflow, GraphError> {
    let workflow: Workflow =
        serde_yaml_ng::from_str(yaml).map_err(|e| GraphError::ParseError(e.to_string()))?;
    validate_workflow(&workflow, evaluator)?;
    Ok(workflow)
}

/// Serialize a workflow definition to YAML.
pub fn serialize_workflow_yaml(workflow: &Workflow) -> Result<String, GraphError> {
    serde_yaml_ng::to_string(workflow).map_err(|e| GraphError::ParseError(e.to_string()))
}

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(
    path: &Path,
    evaluator: &ExpressionEvaluator,
) -> Result<Workflow, GraphError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content, evaluator)
}

/// Save a workflow definition to a YAML file, creating parent directories.
pub fn save_workflow_file(path: &Path, workflow: &Workflow) -> Result<(), GraphError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(workflow)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`. Files that fail to
/// parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
    evaluator: &ExpressionEvaluator,
) -> Result<Vec<(PathBuf, Workflow)>, GraphError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, evaluator, &mut results)?;
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    evaluator: &ExpressionEvaluator,
    results: &mut Vec<(PathBuf, Workflow)>,
) -> Result<(), GraphError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, evaluator, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_workflow_file(&path, evaluator) {
                    Ok(workflow) => results.push((path, workflow)),
                    Err(_) => {
                        tracing::warn!(?path, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;
    use uuid::Uuid;

    fn node(id: &str, kind: NodeKind) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            retry: None,
        }
    }

    fn task(id: &str) -> Node {
        node(
            id,
            NodeKind::Task {
                prompt: format!("run {id}"),
                agent: None,
            },
        )
    }

    fn edge(id: &str, from: &str, to: &str) -> Edge {
        Edge {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
            max_loops: None,
            label: None,
        }
    }

    fn workflow(nodes: Vec<Node>, edges: Vec<Edge>) -> Workflow {
        Workflow {
            id: Uuid::now_v7(),
            name: "test-wf".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            nodes,
            edges,
            variables: StdHashMap::new(),
            created_at: Utc::now(),
        }
    }

    fn linear() -> Workflow {
        workflow(
            vec![node("start", NodeKind::Start), task("a"), node("end", NodeKind::End)],
            vec![edge("e1", "start", "a"), edge("e2", "a", "end")],
        )
    }

    // -------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------

    #[test]
    fn test_validate_accepts_linear_workflow() {
        let eval = ExpressionEvaluator::new();
        assert!(validate_workflow(&linear(), &eval).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_node_ids() {
        let eval = ExpressionEvaluator::new();
        let wf = workflow(
            vec![node("start", NodeKind::Start), task("a"), task("a"), node("end", NodeKind::End)],
            vec![],
        );
        let err = validate_workflow(&wf, &eval).unwrap_err();
        assert!(err.to_string().contains("duplicate node id"), "got: {err}");
    }

    #[test]
    fn test_validate_rejects_unknown_edge_endpoint() {
        let eval = ExpressionEvaluator::new();
        let mut wf = linear();
        wf.edges.push(edge("e3", "a", "ghost"));
        let err = validate_workflow(&wf, &eval).unwrap_err();
        assert!(err.to_string().contains("unknown node"), "got: {err}");
    }

    #[test]
    fn test_validate_requires_exactly_one_start() {
        let eval = ExpressionEvaluator::new();
        let wf = workflow(vec![task("a"), node("end", NodeKind::End)], vec![]);
        let err = validate_workflow(&wf, &eval).unwrap_err();
        assert!(err.to_string().contains("exactly one start"), "got: {err}");

        let wf = workflow(
            vec![
                node("s1", NodeKind::Start),
                node("s2", NodeKind::Start),
                node("end", NodeKind::End),
            ],
            vec![],
        );
        assert!(validate_workflow(&wf, &eval).is_err());
    }

    #[test]
    fn test_validate_rejects_invalid_name() {
        let eval = ExpressionEvaluator::new();
        let mut wf = linear();
        wf.name = "has spaces!".to_string();
        let err = validate_workflow(&wf, &eval).unwrap_err();
        assert!(err.to_string().contains("invalid characters"), "got: {err}");
    }

    #[test]
    fn test_validate_rejects_malformed_condition() {
        let eval = ExpressionEvaluator::new();
        let mut wf = linear();
        wf.edges[1].condition = Some("1 +".to_string());
        let err = validate_workflow(&wf, &eval).unwrap_err();
        assert!(matches!(err, GraphError::InvalidCondition { .. }), "got: {err}");
    }

    #[test]
    fn test_validate_rejects_unbounded_cycle() {
        let eval = ExpressionEvaluator::new();
        let mut wf = linear();
        // a -> a with no max_loops
        wf.edges.push(edge("loop", "a", "a"));
        let err = validate_workflow(&wf, &eval).unwrap_err();
        assert!(matches!(err, GraphError::UnboundedCycle(_)), "got: {err}");

        // Bounding the edge makes it valid
        wf.edges.last_mut().unwrap().max_loops = Some(3);
        assert!(validate_workflow(&wf, &eval).is_ok());
    }

    #[test]
    fn test_validate_rejects_unbounded_multi_node_cycle() {
        let eval = ExpressionEvaluator::new();
        let mut wf = workflow(
            vec![
                node("start", NodeKind::Start),
                task("a"),
                task("b"),
                node("end", NodeKind::End),
            ],
            vec![
                edge("e1", "start", "a"),
                edge("e2", "a", "b"),
                edge("e3", "b", "a"),
                edge("e4", "b", "end"),
            ],
        );
        assert!(matches!(
            validate_workflow(&wf, &eval).unwrap_err(),
            GraphError::UnboundedCycle(_)
        ));

        wf.edges[2].max_loops = Some(2);
        assert!(validate_workflow(&wf, &eval).is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_max_loops() {
        let eval = ExpressionEvaluator::new();
        let mut wf = linear();
        wf.edges[0].max_loops = Some(0);
        let err = validate_workflow(&wf, &eval).unwrap_err();
        assert!(err.to_string().contains("max_loops 0"), "got: {err}");
    }

    // -------------------------------------------------------------------
    // GraphIndex
    // -------------------------------------------------------------------

    #[test]
    fn test_index_edge_maps() {
        let wf = linear();
        let index = GraphIndex::new(&wf);
        assert_eq!(index.outgoing("start").len(), 1);
        assert_eq!(index.outgoing("a")[0].to, "end");
        assert_eq!(index.incoming("end").len(), 1);
        assert!(index.outgoing("end").is_empty());
        assert!(index.node("a").is_some());
        assert!(index.node("ghost").is_none());
    }

    #[test]
    fn test_index_marks_cycle_edges() {
        let mut wf = linear();
        let mut loop_edge = edge("loop", "a", "a");
        loop_edge.max_loops = Some(2);
        wf.edges.push(loop_edge);

        let index = GraphIndex::new(&wf);
        assert!(index.is_cycle_edge("loop"));
        assert!(!index.is_cycle_edge("e1"));
        assert!(!index.is_cycle_edge("e2"));
    }

    #[test]
    fn test_index_marks_multi_node_cycle_edges() {
        let mut wf = workflow(
            vec![
                node("start", NodeKind::Start),
                task("a"),
                task("b"),
                node("end", NodeKind::End),
            ],
            vec![
                edge("e1", "start", "a"),
                edge("e2", "a", "b"),
                edge("e3", "b", "a"),
                edge("e4", "b", "end"),
            ],
        );
        wf.edges[2].max_loops = Some(2);
        let index = GraphIndex::new(&wf);
        assert!(index.is_cycle_edge("e2"), "a->b closes the a/b cycle");
        assert!(index.is_cycle_edge("e3"), "b->a closes the a/b cycle");
        assert!(!index.is_cycle_edge("e1"));
        assert!(!index.is_cycle_edge("e4"));
    }

    #[test]
    fn test_cycle_may_continue_tracks_loop_budget() {
        use gantry_types::instance::WorkflowInstance;

        let mut wf = linear();
        let mut loop_edge = edge("back", "a", "a");
        loop_edge.max_loops = Some(2);
        wf.edges.push(loop_edge);

        let index = GraphIndex::new(&wf);
        let mut instance = WorkflowInstance::for_workflow(&wf);

        assert!(index.cycle_may_continue(&instance, "a"));
        assert!(!index.cycle_may_continue(&instance, "start"), "not in a cycle");

        instance.edge_traversals.insert("back".into(), 2);
        assert!(
            !index.cycle_may_continue(&instance, "a"),
            "exhausted loop budget"
        );
    }

    // -------------------------------------------------------------------
    // Definition files
    // -------------------------------------------------------------------

    #[test]
    fn test_save_and_load_roundtrip() {
        let eval = ExpressionEvaluator::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows/test.yaml");

        let wf = linear();
        save_workflow_file(&path, &wf).expect("should save");

        let loaded = load_workflow_file(&path, &eval).expect("should load");
        assert_eq!(loaded.name, "test-wf");
        assert_eq!(loaded.nodes.len(), 3);
    }

    #[test]
    fn test_discover_skips_invalid_files() {
        let eval = ExpressionEvaluator::new();
        let dir = tempfile::tempdir().unwrap();

        save_workflow_file(&dir.path().join("good.yaml"), &linear()).unwrap();
        std::fs::write(dir.path().join("junk.yaml"), "not: [a, workflow").unwrap();

        let found = discover_workflows(dir.path(), &eval).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.name, "test-wf");
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let eval = ExpressionEvaluator::new();
        let found = discover_workflows(Path::new("/nonexistent/path"), &eval).unwrap();
        assert!(found.is_empty());
    }
}
