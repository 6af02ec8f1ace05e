//! Journey JSON parsing (§6) and load-time validation (§3) — generalized from
//! the teacher's petgraph-based IR verifier (`compiler/verifier.rs`: single
//! start, reachability, fork/join arity) from BPMN elements to the spec's named
//! node graph, with no bytecode-compiler step in between.

use indexmap::IndexMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde::Deserialize;
use std::collections::HashMap;

use crate::config::END_NODE;
use crate::error::EngineError;
use crate::model::{Journey, Node, ScalarValue, VarType, VariableDef};

// ─── Wire DTOs (§6 "Journey JSON") ──────────────────────────────

#[derive(Deserialize)]
struct JourneyDoc {
    journey: JourneyDto,
}

#[derive(Deserialize)]
struct JourneyDto {
    name: String,
    #[serde(default)]
    process_variables: Vec<VariableDto>,
    #[serde(default)]
    tickets: Vec<TicketDto>,
    flow: Vec<NodeDto>,
}

#[derive(Deserialize)]
struct VariableDto {
    name: String,
    #[serde(rename = "type")]
    var_type: String,
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct TicketDto {
    name: String,
    step: String,
}

#[derive(Deserialize)]
struct BranchDto {
    name: String,
    next: String,
}

#[derive(Deserialize)]
struct NodeDto {
    #[serde(rename = "type")]
    node_type: String,
    name: String,
    #[serde(default)]
    component: Option<String>,
    #[serde(default)]
    user_data: Option<serde_json::Value>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    branches: Option<Vec<BranchDto>>,
}

fn parse_var_type(s: &str) -> Result<VarType, EngineError> {
    match s {
        "string" => Ok(VarType::String),
        "long" => Ok(VarType::Long),
        "integer" => Ok(VarType::Integer),
        "boolean" => Ok(VarType::Boolean),
        other => Err(EngineError::DefinitionInvalid(format!(
            "unknown variable type '{other}'"
        ))),
    }
}

fn scalar_from_json(var_type: VarType, value: &serde_json::Value) -> Result<ScalarValue, EngineError> {
    let invalid = || {
        EngineError::DefinitionInvalid(format!(
            "value {value} does not match declared type {var_type:?}"
        ))
    };
    match var_type {
        VarType::String => value.as_str().map(|s| ScalarValue::String(s.to_string())).ok_or_else(invalid),
        VarType::Long => value.as_i64().map(ScalarValue::Long).ok_or_else(invalid),
        VarType::Integer => value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(ScalarValue::Integer)
            .ok_or_else(invalid),
        VarType::Boolean => value.as_bool().map(ScalarValue::Boolean).ok_or_else(invalid),
    }
}

fn branches_to_map(branches: Vec<BranchDto>, node_name: &str) -> Result<IndexMap<String, String>, EngineError> {
    let mut map = IndexMap::new();
    for b in branches {
        if map.insert(b.name.clone(), b.next).is_some() {
            return Err(EngineError::DefinitionInvalid(format!(
                "node '{node_name}': duplicate branch label '{}'",
                b.name
            )));
        }
    }
    Ok(map)
}

fn dto_to_node(dto: NodeDto) -> Result<Node, EngineError> {
    let name = dto.name.clone();
    let need_next = || {
        dto.next.clone().ok_or_else(|| {
            EngineError::DefinitionInvalid(format!("node '{name}' requires 'next'"))
        })
    };
    let need_component = || {
        dto.component.clone().ok_or_else(|| {
            EngineError::DefinitionInvalid(format!("node '{name}' requires 'component'"))
        })
    };
    match dto.node_type.as_str() {
        "TASK" => Ok(Node::Task {
            name: name.clone(),
            component_name: need_component()?,
            next: need_next()?,
            user_data: dto.user_data,
        }),
        "PAUSE" => Ok(Node::Pause {
            name: name.clone(),
            next: need_next()?,
        }),
        "PERSIST" => Ok(Node::Persist {
            name: name.clone(),
            next: need_next()?,
        }),
        "S_ROUTE" => Ok(Node::SRoute {
            name: name.clone(),
            component_name: need_component()?,
            user_data: dto.user_data,
            branches: branches_to_map(dto.branches.unwrap_or_default(), &name)?,
        }),
        "P_ROUTE" => {
            if dto.next.is_some() {
                return Err(EngineError::InvariantViolation(format!(
                    "node '{name}': P_ROUTE must not define 'next'"
                )));
            }
            Ok(Node::PRoute {
                name: name.clone(),
                component_name: need_component()?,
                user_data: dto.user_data,
                branches: branches_to_map(dto.branches.unwrap_or_default(), &name)?,
            })
        }
        "P_ROUTE_DYNAMIC" => {
            if dto.branches.is_some() {
                return Err(EngineError::InvariantViolation(format!(
                    "node '{name}': P_ROUTE_DYNAMIC must not define 'branches'"
                )));
            }
            Ok(Node::PRouteDynamic {
                name: name.clone(),
                component_name: need_component()?,
                user_data: dto.user_data,
                next: need_next()?,
            })
        }
        "P_JOIN" => Ok(Node::Join {
            name: name.clone(),
            next: need_next()?,
        }),
        other => Err(EngineError::DefinitionInvalid(format!(
            "node '{name}': unknown type '{other}'"
        ))),
    }
}

/// Parse and validate a Journey JSON document (§6). This is the only place
/// `serde_json` touches journey authoring — the host owns everything upstream
/// of handing the engine a document (§1 Non-goals: "JSON parsing... out of
/// scope" means the engine does the minimum parsing needed to consume its own
/// wire format, not a general-purpose authoring pipeline).
pub fn parse(json: &str) -> Result<Journey, EngineError> {
    let doc: JourneyDoc = serde_json::from_str(json)
        .map_err(|e| EngineError::DefinitionInvalid(format!("invalid journey JSON: {e}")))?;
    let dto = doc.journey;

    let mut variables = IndexMap::new();
    for v in dto.process_variables {
        let var_type = parse_var_type(&v.var_type)?;
        let default = scalar_from_json(var_type, &v.value)?;
        variables.insert(
            v.name.clone(),
            VariableDef {
                name: v.name,
                var_type,
                default,
            },
        );
    }

    let mut tickets = HashMap::new();
    for t in dto.tickets {
        tickets.insert(t.name, t.step);
    }

    let mut nodes = IndexMap::new();
    let mut order = Vec::new();
    for node_dto in dto.flow {
        let node = dto_to_node(node_dto)?;
        let name = node.name().to_string();
        if nodes.insert(name.clone(), node).is_some() {
            return Err(EngineError::DefinitionInvalid(format!(
                "duplicate node name '{name}'"
            )));
        }
        order.push(name);
    }
    let start = order
        .first()
        .cloned()
        .ok_or_else(|| EngineError::DefinitionInvalid("journey has no nodes".to_string()))?;

    let journey = Journey {
        name: dto.name,
        nodes,
        variables,
        tickets,
        start,
        fanout_joins: HashMap::new(),
    };
    build(journey)
}

/// Validates a journey (built via `parse` or constructed programmatically by a
/// host) and populates `fanout_joins`. The entry point for anything that did
/// not come through `parse`.
pub fn build(mut journey: Journey) -> Result<Journey, EngineError> {
    validate(&journey)?;
    journey.fanout_joins = compute_fanout_joins(&journey);
    Ok(journey)
}

/// Static fan-out → Join lookup (§4.C), computed once so the fan-out/join
/// controller never re-walks the graph per fan-out event.
fn compute_fanout_joins(journey: &Journey) -> HashMap<String, Option<String>> {
    let mut result = HashMap::new();
    for node in journey.nodes.values() {
        let starts: Vec<&str> = match node {
            Node::PRoute { branches, .. } => branches.values().map(String::as_str).collect(),
            Node::PRouteDynamic { next, .. } => vec![next.as_str()],
            _ => continue,
        };
        let join = starts.first().and_then(|s| first_join_by_name(journey, s));
        result.insert(node.name().to_string(), join);
    }
    result
}

fn first_join_by_name(journey: &Journey, start: &str) -> Option<String> {
    use std::collections::{HashSet, VecDeque};

    if let Some(Node::Join { name, .. }) = journey.nodes.get(start) {
        return Some(name.clone());
    }
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(start.to_string());
    queue.push_back(start.to_string());
    while let Some(cur) = queue.pop_front() {
        let node = journey.nodes.get(&cur)?;
        for target in forward_targets(node) {
            if target == END_NODE {
                continue;
            }
            if let Some(Node::Join { name, .. }) = journey.nodes.get(target) {
                return Some(name.clone());
            }
            if visited.insert(target.to_string()) {
                queue.push_back(target.to_string());
            }
        }
    }
    None
}

fn forward_targets(node: &Node) -> Vec<&str> {
    match node {
        Node::Task { next, .. }
        | Node::Pause { next, .. }
        | Node::Persist { next, .. }
        | Node::Join { next, .. }
        | Node::PRouteDynamic { next, .. } => vec![next.as_str()],
        Node::SRoute { branches, .. } | Node::PRoute { branches, .. } => {
            branches.values().map(String::as_str).collect()
        }
    }
}

/// §3 validation rules, run at load time. Rejects with `DefinitionInvalid`
/// (or `InvariantViolation` for the P_ROUTE/P_ROUTE_DYNAMIC shape rules, which
/// `parse` already enforces at DTO-conversion time for the JSON path — this
/// function re-checks them so a journey built programmatically is covered too).
pub fn validate(journey: &Journey) -> Result<(), EngineError> {
    if journey.nodes.contains_key(END_NODE) {
        return Err(EngineError::DefinitionInvalid(format!(
            "node name '{END_NODE}' is reserved"
        )));
    }

    let resolves = |target: &str| target == END_NODE || journey.nodes.contains_key(target);

    for node in journey.nodes.values() {
        match node {
            Node::Task { next, name, .. } | Node::Pause { next, name, .. } | Node::Persist { next, name, .. } | Node::Join { next, name, .. } => {
                if !resolves(next) {
                    return Err(EngineError::DefinitionInvalid(format!(
                        "node '{name}': next '{next}' does not resolve"
                    )));
                }
            }
            Node::SRoute { branches, name, .. } | Node::PRoute { branches, name, .. } => {
                if branches.is_empty() {
                    return Err(EngineError::DefinitionInvalid(format!(
                        "node '{name}': route has no branches"
                    )));
                }
                for (label, target) in branches {
                    if !resolves(target) {
                        return Err(EngineError::DefinitionInvalid(format!(
                            "node '{name}': branch '{label}' target '{target}' does not resolve"
                        )));
                    }
                }
            }
            Node::PRouteDynamic { next, name, .. } => {
                if !resolves(next) {
                    return Err(EngineError::DefinitionInvalid(format!(
                        "node '{name}': next '{next}' does not resolve"
                    )));
                }
            }
        }
    }

    for (ticket_name, target) in &journey.tickets {
        if !resolves(target) {
            return Err(EngineError::DefinitionInvalid(format!(
                "ticket '{ticket_name}': target '{target}' does not resolve"
            )));
        }
    }

    check_fanout_convergence(journey)?;
    Ok(())
}

/// §4.C: every parallel fan-out's branches must converge on a single, common
/// Join (or none at all — fire-and-forget fan-out, §8 boundary behavior).
fn check_fanout_convergence(journey: &Journey) -> Result<(), EngineError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
    for name in journey.nodes.keys() {
        let idx = graph.add_node(name.as_str());
        index_of.insert(name.as_str(), idx);
    }
    let mut add_edge = |from: &str, to: &str| {
        if to != END_NODE {
            if let (Some(&a), Some(&b)) = (index_of.get(from), index_of.get(to)) {
                graph.add_edge(a, b, ());
            }
        }
    };
    for node in journey.nodes.values() {
        match node {
            Node::Task { name, next, .. }
            | Node::Pause { name, next, .. }
            | Node::Persist { name, next, .. }
            | Node::Join { name, next, .. }
            | Node::PRouteDynamic { name, next, .. } => add_edge(name, next),
            Node::SRoute { name, branches, .. } | Node::PRoute { name, branches, .. } => {
                for target in branches.values() {
                    add_edge(name, target);
                }
            }
        }
    }

    let first_join_from = |start: &str| -> Option<String> {
        let &start_idx = index_of.get(start)?;
        let mut bfs = Bfs::new(&graph, start_idx);
        bfs.next(&graph); // skip the start node itself
        while let Some(idx) = bfs.next(&graph) {
            let name = graph[idx];
            if matches!(journey.nodes.get(name), Some(Node::Join { .. })) {
                return Some(name.to_string());
            }
        }
        None
    };

    for node in journey.nodes.values() {
        let (name, starts): (&str, Vec<&str>) = match node {
            Node::PRoute { name, branches, .. } => {
                (name.as_str(), branches.values().map(String::as_str).collect())
            }
            Node::PRouteDynamic { name, next, .. } => (name.as_str(), vec![next.as_str()]),
            _ => continue,
        };

        let mut joins: Vec<Option<String>> = starts.iter().map(|s| first_join_from(s)).collect();
        // A branch whose start node IS itself a Join counts as converging there.
        for (s, j) in starts.iter().zip(joins.iter_mut()) {
            if matches!(journey.nodes.get(*s), Some(Node::Join { .. })) {
                *j = Some((*s).to_string());
            }
        }

        let first = &joins[0];
        if !joins.iter().all(|j| j == first) {
            return Err(EngineError::DefinitionInvalid(format!(
                "node '{name}': parallel branches do not converge on a common join"
            )));
        }
    }

    Ok(())
}
