use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::error::DagFlowError;
use crate::model::Workflow;

/// Structural validation result. `valid` is redundant with `errors.is_empty()` but kept
/// explicit since callers frequently only want the boolean.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Validates step id uniqueness, dependency references, and overall graph acyclicity.
/// Does not build layers — use `topological_layers` for that once a workflow validates.
pub fn validate(workflow: &Workflow) -> ValidationReport {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for step in &workflow.steps {
        if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
    }

    let ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                errors.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ));
            }
        }
    }

    if workflow.steps.is_empty() {
        errors.push("workflow has no steps".to_string());
    } else if workflow.steps.iter().all(|s| !s.depends_on.is_empty()) {
        errors.push("workflow has no root step (every step has a dependency)".to_string());
    }

    if errors.is_empty() {
        if let Err(e) = topological_layers(workflow) {
            errors.push(e.to_string());
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

fn build_graph(workflow: &Workflow) -> (DiGraph<String, ()>, HashMap<String, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::new();

    for step in &workflow.steps {
        let idx = graph.add_node(step.id.clone());
        indices.insert(step.id.clone(), idx);
    }

    for step in &workflow.steps {
        let Some(&to) = indices.get(&step.id) else {
            continue;
        };
        for dep in &step.depends_on {
            if let Some(&from) = indices.get(dep) {
                graph.add_edge(from, to, ());
            }
        }
    }

    (graph, indices)
}

/// Kahn's algorithm: partitions steps into layers where every step's dependencies are
/// satisfied by earlier layers. Returns a cycle witness path if the graph is cyclic.
pub fn topological_layers(workflow: &Workflow) -> Result<Vec<Vec<String>>, DagFlowError> {
    let (graph, indices) = build_graph(workflow);

    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in graph.node_indices() {
        in_degree.insert(idx, graph.neighbors_directed(idx, petgraph::Incoming).count());
    }

    let mut layers = Vec::new();
    let mut remaining = in_degree.clone();
    let mut emitted = 0usize;

    loop {
        let mut layer: Vec<NodeIndex> = remaining
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&idx, _)| idx)
            .collect();

        if layer.is_empty() {
            break;
        }

        layer.sort_by_key(|idx| graph[*idx].clone());
        for idx in &layer {
            remaining.remove(idx);
        }
        for idx in &layer {
            for succ in graph.neighbors_directed(*idx, petgraph::Outgoing) {
                if let Some(deg) = remaining.get_mut(&succ) {
                    *deg -= 1;
                }
            }
        }

        emitted += layer.len();
        layers.push(layer.iter().map(|idx| graph[*idx].clone()).collect());
    }

    if emitted < graph.node_count() {
        let cycle = find_cycle_witness(&graph, &indices);
        return Err(DagFlowError::CycleDetected {
            workflow_id: workflow.id.clone(),
            cycle,
        });
    }

    debug!(workflow_id = %workflow.id, layers = layers.len(), "computed topological layers");
    Ok(layers)
}

/// Depth-first cycle recovery, used only for error reporting once Kahn's algorithm has
/// already determined the graph is cyclic.
fn find_cycle_witness(
    graph: &DiGraph<String, ()>,
    _indices: &HashMap<String, NodeIndex>,
) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InStack,
        Done,
    }

    let mut marks: HashMap<NodeIndex, Mark> = graph
        .node_indices()
        .map(|idx| (idx, Mark::Unvisited))
        .collect();
    let mut stack = Vec::new();

    fn visit(
        graph: &DiGraph<String, ()>,
        node: NodeIndex,
        marks: &mut HashMap<NodeIndex, Mark>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        marks.insert(node, Mark::InStack);
        stack.push(node);

        for succ in graph.neighbors_directed(node, petgraph::Outgoing) {
            match marks.get(&succ).copied().unwrap_or(Mark::Unvisited) {
                Mark::Unvisited => {
                    if let Some(cycle) = visit(graph, succ, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::InStack => {
                    let start = stack.iter().position(|&n| n == succ).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(succ);
                    return Some(cycle);
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    for start in graph.node_indices() {
        if marks.get(&start) == Some(&Mark::Unvisited) {
            if let Some(cycle) = visit(graph, start, &mut marks, &mut stack) {
                return cycle.into_iter().map(|idx| graph[idx].clone()).collect();
            }
        }
    }

    Vec::new()
}

/// All step ids that `step_id` transitively depends on.
pub fn transitive_dependencies(workflow: &Workflow, step_id: &str) -> HashSet<String> {
    let by_id: HashMap<&str, &Vec<String>> = workflow
        .steps
        .iter()
        .map(|s| (s.id.as_str(), &s.depends_on))
        .collect();

    let mut result = HashSet::new();
    let mut queue = VecDeque::new();
    if let Some(deps) = by_id.get(step_id) {
        queue.extend(deps.iter().cloned());
    }

    while let Some(id) = queue.pop_front() {
        if result.insert(id.clone()) {
            if let Some(deps) = by_id.get(id.as_str()) {
                queue.extend(deps.iter().cloned());
            }
        }
    }

    result
}

/// All step ids that transitively depend on `step_id`.
pub fn transitive_dependents(workflow: &Workflow, step_id: &str) -> HashSet<String> {
    let mut result = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(step_id.to_string());

    while let Some(id) = queue.pop_front() {
        for step in &workflow.steps {
            if step.depends_on.iter().any(|d| d == &id) && result.insert(step.id.clone()) {
                queue.push_back(step.id.clone());
            }
        }
    }

    result
}
