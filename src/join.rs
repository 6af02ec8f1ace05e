//! Parallel Fan-out/Join Controller (§4.C). Operates on `Case` under the
//! case-level lock during the drive loop's reconcile phase — never concurrent
//! with a worker's view of the path it owns (§5). Generalized from the
//! teacher's `join_counters: HashMap<(Uuid, JoinId), u16>` counting-latch
//! idea in `store_memory.rs`, re-keyed to `(pathName, nodeName)` strings.

use crate::config::{EngineConfig, END_NODE};
use crate::error::EngineError;
use crate::model::{Case, ExecPath, Journey, JoinExpectation, Node, PathStatus, join_expectation_key};

/// Moves `path` onto `next`, matching `worker::advance_or_complete`'s
/// convention: landing on `end` marks the path `Completed` immediately so it
/// never gets resubmitted to a worker with no corresponding node.
fn advance_or_complete(path: &mut ExecPath, next: &str) {
    path.step = next.to_string();
    path.status = if next == END_NODE { PathStatus::Completed } else { PathStatus::Started };
}

/// §4.C fan-out: `parent_path_name` just executed `fanout_node` and produced
/// `labels`. The caller has already written the worker's returned path (with
/// `status = Completed` at `fanout_node`) back into `case.exec_paths`.
pub fn apply_fanout(
    case: &mut Case,
    journey: &Journey,
    config: &EngineConfig,
    parent_path_name: &str,
    fanout_node: &str,
    labels: &[String],
) -> Result<(), EngineError> {
    let node = journey
        .nodes
        .get(fanout_node)
        .ok_or_else(|| EngineError::InvariantViolation(format!("unknown fan-out node '{fanout_node}'")))?;
    let join = journey.fanout_joins.get(fanout_node).cloned().flatten();

    if labels.is_empty() {
        // §8 boundary: no children to join on. Either resume the parent past
        // the (otherwise unreachable) join, or leave it completed.
        if let Some(join_name) = join {
            let join_next = match journey.nodes.get(&join_name) {
                Some(Node::Join { next, .. }) => next.clone(),
                _ => {
                    return Err(EngineError::InvariantViolation(format!(
                        "fanout_joins points '{fanout_node}' at non-join node '{join_name}'"
                    )))
                }
            };
            let parent = case.exec_paths.get_mut(parent_path_name).ok_or_else(|| {
                EngineError::InvariantViolation(format!("unknown parent path '{parent_path_name}'"))
            })?;
            advance_or_complete(parent, &join_next);
        }
        return Ok(());
    }

    let resolve_start = |label: &str| -> Result<String, EngineError> {
        match node {
            Node::PRoute { branches, .. } => branches.get(label).cloned().ok_or_else(|| {
                EngineError::InvariantViolation(format!("fan-out '{fanout_node}' has no branch '{label}'"))
            }),
            Node::PRouteDynamic { next, .. } => Ok(next.clone()),
            _ => Err(EngineError::InvariantViolation(format!(
                "node '{fanout_node}' is not a parallel fan-out"
            ))),
        }
    };

    for label in labels {
        let start_node = resolve_start(label)?;
        let child = ExecPath::child(parent_path_name, label, &start_node, config.path_separator);
        if case.exec_paths.contains_key(&child.name) {
            return Err(EngineError::InvariantViolation(format!(
                "duplicate execution path name '{}'",
                child.name
            )));
        }
        case.exec_paths.insert(child.name.clone(), child);
    }

    if let Some(join_name) = join {
        let key = join_expectation_key(parent_path_name, &join_name);
        case.join_expectations.insert(
            key,
            JoinExpectation { expected_arity: labels.len(), collected: Vec::new() },
        );
    }

    Ok(())
}

/// §4.C join: `child_path_name` just landed on `join_node`. The caller has
/// already written the worker's returned path back into `case.exec_paths`.
pub fn apply_join_arrival(
    case: &mut Case,
    journey: &Journey,
    config: &EngineConfig,
    child_path_name: &str,
    join_node: &str,
) -> Result<(), EngineError> {
    if let Some(child) = case.exec_paths.get_mut(child_path_name) {
        child.status = PathStatus::Completed;
    }

    let Some(parent_path_name) = child_path_name_parent(child_path_name, config.path_separator) else {
        return Ok(());
    };
    let key = join_expectation_key(&parent_path_name, join_node);

    let Some(expectation) = case.join_expectations.get_mut(&key) else {
        // Expectation missing: either a ticket discarded it, or this join has
        // no owning fan-out recorded (already converged, or orphaned arrival).
        return Ok(());
    };
    expectation.collected.push(child_path_name.to_string());
    if expectation.collected.len() < expectation.expected_arity {
        return Ok(());
    }

    let expectation = case.join_expectations.remove(&key).expect("just matched above");
    debug_assert_eq!(expectation.collected.len(), expectation.expected_arity);

    let join_next = match journey.nodes.get(join_node) {
        Some(Node::Join { next, .. }) => next.clone(),
        _ => {
            return Err(EngineError::InvariantViolation(format!(
                "path arrived at '{join_node}' which is not a Join node"
            )))
        }
    };
    let parent = case
        .exec_paths
        .get_mut(&parent_path_name)
        .ok_or_else(|| EngineError::InvariantViolation(format!("unknown parent path '{parent_path_name}'")))?;
    advance_or_complete(parent, &join_next);
    Ok(())
}

fn child_path_name_parent(name: &str, sep: char) -> Option<String> {
    name.rfind(sep).map(|idx| name[..idx].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use std::collections::HashMap;

    fn journey_static_parallel() -> Journey {
        let mut nodes = IndexMap::new();
        nodes.insert(
            "fork".to_string(),
            Node::PRoute {
                name: "fork".to_string(),
                component_name: "c".to_string(),
                user_data: None,
                branches: IndexMap::from([
                    ("a1".to_string(), "a1".to_string()),
                    ("a2".to_string(), "a2".to_string()),
                ]),
            },
        );
        nodes.insert("a1".to_string(), Node::Task { name: "a1".to_string(), component_name: "c".to_string(), next: "join".to_string(), user_data: None });
        nodes.insert("a2".to_string(), Node::Task { name: "a2".to_string(), component_name: "c".to_string(), next: "join".to_string(), user_data: None });
        nodes.insert("join".to_string(), Node::Join { name: "join".to_string(), next: "end".to_string() });
        let mut fanout_joins = HashMap::new();
        fanout_joins.insert("fork".to_string(), Some("join".to_string()));
        Journey {
            name: "j".to_string(),
            nodes,
            variables: IndexMap::new(),
            tickets: HashMap::new(),
            start: "fork".to_string(),
            fanout_joins,
        }
    }

    #[test]
    fn fanout_creates_children_and_registers_expectation() {
        let journey = journey_static_parallel();
        let config = EngineConfig::default();
        let mut case = Case::new("c1".to_string(), &journey, IndexMap::new());
        case.exec_paths.get_mut(".").unwrap().status = PathStatus::Completed;
        apply_fanout(&mut case, &journey, &config, ".", "fork", &["a1".to_string(), "a2".to_string()]).unwrap();
        assert!(case.exec_paths.contains_key(".-a1"));
        assert!(case.exec_paths.contains_key(".-a2"));
        let key = join_expectation_key(".", "join");
        assert_eq!(case.join_expectations[&key].expected_arity, 2);
    }

    #[test]
    fn join_advances_parent_only_once_arity_met() {
        let journey = journey_static_parallel();
        let config = EngineConfig::default();
        let mut case = Case::new("c1".to_string(), &journey, IndexMap::new());
        case.exec_paths.get_mut(".").unwrap().status = PathStatus::Completed;
        apply_fanout(&mut case, &journey, &config, ".", "fork", &["a1".to_string(), "a2".to_string()]).unwrap();

        case.exec_paths.get_mut(".-a1").unwrap().step = "join".to_string();
        apply_join_arrival(&mut case, &journey, &config, ".-a1", "join").unwrap();
        assert_eq!(case.exec_paths["."].step, "fork");

        case.exec_paths.get_mut(".-a2").unwrap().step = "join".to_string();
        apply_join_arrival(&mut case, &journey, &config, ".-a2", "join").unwrap();
        assert_eq!(case.exec_paths["."].step, "end");
        assert_eq!(case.exec_paths["."].status, PathStatus::Completed);
        assert!(!case.join_expectations.contains_key(&join_expectation_key(".", "join")));
    }

    #[test]
    fn empty_labels_with_join_advances_parent_directly() {
        let journey = journey_static_parallel();
        let config = EngineConfig::default();
        let mut case = Case::new("c1".to_string(), &journey, IndexMap::new());
        case.exec_paths.get_mut(".").unwrap().status = PathStatus::Completed;
        apply_fanout(&mut case, &journey, &config, ".", "fork", &[]).unwrap();
        assert_eq!(case.exec_paths["."].step, "end");
        assert_eq!(case.exec_paths["."].status, PathStatus::Completed);
    }

    #[test]
    fn empty_labels_without_join_leaves_parent_completed() {
        let mut journey = journey_static_parallel();
        journey.fanout_joins.insert("fork".to_string(), None);
        let config = EngineConfig::default();
        let mut case = Case::new("c1".to_string(), &journey, IndexMap::new());
        case.exec_paths.get_mut(".").unwrap().status = PathStatus::Completed;
        apply_fanout(&mut case, &journey, &config, ".", "fork", &[]).unwrap();
        assert_eq!(case.exec_paths["."].status, PathStatus::Completed);
    }
}
