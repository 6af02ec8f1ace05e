//! Data model (§3): Journey (definition), Case (instance), ExecPath, Milestones.
//!
//! Generalized from the teacher's `types.rs` (`ProcessInstance`/`Fiber`/`WaitState`):
//! same split between an immutable shared definition and a mutable, exclusively-owned
//! instance, but keyed and addressed by name instead of bytecode offset.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ErrorInfo;

// ─── Scalar values (§3 variables) ──────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarType {
    String,
    Long,
    Integer,
    Boolean,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    String(String),
    Long(i64),
    Integer(i32),
    Boolean(bool),
}

impl ScalarValue {
    pub fn var_type(&self) -> VarType {
        match self {
            ScalarValue::String(_) => VarType::String,
            ScalarValue::Long(_) => VarType::Long,
            ScalarValue::Integer(_) => VarType::Integer,
            ScalarValue::Boolean(_) => VarType::Boolean,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableDef {
    pub name: String,
    pub var_type: VarType,
    pub default: ScalarValue,
}

// ─── Journey (definition) ──────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Node {
    Task {
        name: String,
        component_name: String,
        next: String,
        user_data: Option<serde_json::Value>,
    },
    Pause {
        name: String,
        next: String,
    },
    Persist {
        name: String,
        next: String,
    },
    SRoute {
        name: String,
        component_name: String,
        user_data: Option<serde_json::Value>,
        branches: IndexMap<String, String>,
    },
    PRoute {
        name: String,
        component_name: String,
        user_data: Option<serde_json::Value>,
        branches: IndexMap<String, String>,
    },
    PRouteDynamic {
        name: String,
        component_name: String,
        user_data: Option<serde_json::Value>,
        next: String,
    },
    Join {
        name: String,
        next: String,
    },
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Task { name, .. }
            | Node::Pause { name, .. }
            | Node::Persist { name, .. }
            | Node::SRoute { name, .. }
            | Node::PRoute { name, .. }
            | Node::PRouteDynamic { name, .. }
            | Node::Join { name, .. } => name,
        }
    }
}

/// Immutable after `Journey::load`. Shared/read-only across cases and paths.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Journey {
    pub name: String,
    pub nodes: IndexMap<String, Node>,
    pub variables: IndexMap<String, VariableDef>,
    pub tickets: HashMap<String, String>,
    /// First node in `nodes` — where a root path starts.
    pub start: String,
    /// Fan-out node name → the single Join its branches converge on, if any
    /// (§4.C). Computed once at load time so the fan-out/join controller never
    /// re-walks the graph at runtime.
    #[serde(default)]
    pub fanout_joins: HashMap<String, Option<String>>,
}

// ─── Execution path ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathStatus {
    Started,
    Running,
    Completed,
}

/// The response type that most recently parked or advanced a path. Drives pend
/// detection (§4.A) and the EOR idempotency contract (§8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitResponseType {
    OkProceed,
    OkPend,
    OkPendEor,
    ErrorPend,
}

impl UnitResponseType {
    pub fn is_pend(self) -> bool {
        matches!(
            self,
            UnitResponseType::OkPend | UnitResponseType::OkPendEor | UnitResponseType::ErrorPend
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecPath {
    pub name: String,
    pub status: PathStatus,
    pub step: String,
    pub pend_work_basket: Option<String>,
    pub prev_pend_work_basket: Option<String>,
    pub tbc_sla_work_basket: Option<String>,
    pub pend_error: Option<ErrorInfo>,
    pub unit_response_type: Option<UnitResponseType>,
    pub ticket: Option<String>,
}

impl ExecPath {
    pub fn root(start_node: &str) -> Self {
        Self {
            name: ROOT_PATH.to_string(),
            status: PathStatus::Started,
            step: start_node.to_string(),
            pend_work_basket: None,
            prev_pend_work_basket: None,
            tbc_sla_work_basket: None,
            pend_error: None,
            unit_response_type: None,
            ticket: None,
        }
    }

    pub fn child(parent: &str, label: &str, start_node: &str, sep: char) -> Self {
        Self {
            name: format!("{parent}{sep}{label}"),
            status: PathStatus::Started,
            step: start_node.to_string(),
            pend_work_basket: None,
            prev_pend_work_basket: None,
            tbc_sla_work_basket: None,
            pend_error: None,
            unit_response_type: None,
            ticket: None,
        }
    }

    /// The parent path name, derived by stripping the last separator-delimited
    /// segment — no back-pointers, no cycles (§9 Design Notes).
    pub fn parent_name(&self, sep: char) -> Option<&str> {
        self.name.rfind(sep).map(|idx| &self.name[..idx])
    }

    pub fn is_pended(&self) -> bool {
        self.status != PathStatus::Completed
            && self
                .unit_response_type
                .map(UnitResponseType::is_pend)
                .unwrap_or(false)
            && self.pend_work_basket.is_some()
    }
}

pub const ROOT_PATH: &str = ".";

// ─── Case (instance) ────────────────────────────────────────────

/// A counting latch for one fan-out, keyed by `(parentPathName, joinNodeName)`
/// (§4.C, §9 Design Notes — generalized from the teacher's
/// `join_counters: HashMap<(Uuid, JoinId), u16>`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinExpectation {
    pub expected_arity: usize,
    pub collected: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    pub journey_name: String,
    pub variables: IndexMap<String, (VarType, ScalarValue)>,
    pub exec_paths: IndexMap<String, ExecPath>,
    pub pend_exec_path: Option<String>,
    pub ticket: Option<String>,
    pub last_unit_executed: Option<(String, String)>,
    pub is_complete: bool,
    /// Bumped every time a ticket pre-empts siblings. Workers racing a cancelled
    /// path check this before writing results back (§9 Design Notes).
    pub ticket_generation: u64,
    /// Keyed by `join_expectation_key(parent_path_name, join_node_name)` —
    /// `serde_json` map keys must be strings, so the pair is joined rather than
    /// used as a tuple key directly.
    #[serde(default)]
    pub join_expectations: HashMap<String, JoinExpectation>,
    /// Milestone definitions captured at `StartCase` time (§4.F enrichment) —
    /// `WorkBasketEntry`-scoped ones are (de)queued by `sla::SlaCollaborator` as
    /// paths pend/resume into/out of their named basket.
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

/// Composite key for `Case::join_expectations`. `\u{1}` cannot appear in a path
/// name or node name parsed from journey JSON, so the join is unambiguous.
pub fn join_expectation_key(parent_path_name: &str, join_node_name: &str) -> String {
    format!("{parent_path_name}\u{1}{join_node_name}")
}

impl Case {
    pub fn new(case_id: String, journey: &Journey, initial: IndexMap<String, ScalarValue>) -> Self {
        let mut variables = IndexMap::new();
        for (name, def) in &journey.variables {
            let value = initial.get(name).cloned().unwrap_or_else(|| def.default.clone());
            variables.insert(name.clone(), (def.var_type, value));
        }
        let mut exec_paths = IndexMap::new();
        exec_paths.insert(ROOT_PATH.to_string(), ExecPath::root(&journey.start));
        Self {
            case_id,
            journey_name: journey.name.clone(),
            variables,
            exec_paths,
            pend_exec_path: None,
            ticket: None,
            last_unit_executed: None,
            is_complete: false,
            ticket_generation: 0,
            join_expectations: HashMap::new(),
            milestones: Vec::new(),
        }
    }

    /// §4.A completion detection: every path `Completed`. A path retired by a
    /// join or a fire-and-forget fan-out is marked `Completed` sitting on the
    /// join/fan-out node's own name rather than `end` (only the path that
    /// keeps running past the join ever reaches `end` itself), so `step` is
    /// not part of this check — `status` alone tells whether a path still has
    /// work to do.
    pub fn all_paths_terminal(&self) -> bool {
        self.exec_paths.values().all(|p| p.status == PathStatus::Completed)
    }

    pub fn runnable_paths(&self) -> Vec<String> {
        self.exec_paths
            .values()
            .filter(|p| p.status == PathStatus::Started && !p.is_pended())
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn pended_paths(&self) -> Vec<String> {
        self.exec_paths
            .values()
            .filter(|p| p.is_pended())
            .map(|p| p.name.clone())
            .collect()
    }

    /// Milestones set up on entry to `basket` (§4.F), enqueued whenever a path
    /// pends there and dequeued when it leaves.
    pub fn milestones_for_basket(&self, basket: &str) -> Vec<Milestone> {
        self.milestones
            .iter()
            .filter(|m| m.setup_on == SetupOn::WorkBasketEntry && m.work_basket_name.as_deref() == Some(basket))
            .cloned()
            .collect()
    }

    /// Milestones set up once at case start (§4.F), independent of basket.
    pub fn case_level_milestones(&self) -> Vec<Milestone> {
        self.milestones.iter().filter(|m| m.setup_on == SetupOn::CaseStart).cloned().collect()
    }
}

// ─── Milestones (SLA) ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupOn {
    CaseStart,
    WorkBasketEntry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MilestoneType {
    CaseLevel,
    WorkBasket,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockStarts {
    Immediately,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Deadline {
    /// `dDDhHH:mm` style age offset, kept opaque (host/SLA collaborator interprets it).
    Age(String),
    /// Absolute epoch-millisecond timestamp.
    Absolute(i64),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FutureMilestone {
    pub offset: String,
    pub repeat: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Milestone {
    pub name: String,
    pub setup_on: SetupOn,
    pub milestone_type: MilestoneType,
    pub work_basket_name: Option<String>,
    pub deadline: Deadline,
    pub clock_starts: ClockStarts,
    pub action_code: String,
    pub user_data: Option<serde_json::Value>,
    pub future_milestones: Vec<FutureMilestone>,
}

// ─── Incidents (enrichment, grounded on teacher `types.rs::Incident`) ──

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: uuid::Uuid,
    pub case_id: String,
    pub path_name: String,
    pub step: String,
    pub error: ErrorInfo,
    pub created_at: i64,
}
