//! Component factory and the two invocation contracts (§6 "Component factory").
//!
//! The host supplies a `ComponentFactory`; the engine never constructs task/route
//! objects itself — same separation of concerns as the teacher's `ProcessStore`
//! trait-object boundary (`store.rs`), just on the "user code" side instead of the
//! persistence side.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::error::ErrorInfo;
use crate::model::{ScalarValue, VarType};

/// What kind of node is asking the factory for an invokable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Task,
    SRoute,
    PRoute,
    PRouteDynamic,
}

/// Read-only view over a case's variables, handed to user code. Cloned cheaply
/// per invocation — the engine never lets user code hold a live reference into
/// case state across an `.await` point.
#[derive(Clone, Debug)]
pub struct VariablesView(pub IndexMap<String, (VarType, ScalarValue)>);

impl VariablesView {
    pub fn get(&self, name: &str) -> Option<&ScalarValue> {
        self.0.get(name).map(|(_, v)| v)
    }
}

/// Context passed to the component factory for every node dispatch (§6).
#[derive(Clone, Debug)]
pub struct StepContext {
    pub case_id: String,
    pub path_name: String,
    pub node_name: String,
    pub component_name: String,
    pub node_kind: NodeKind,
    pub user_data: Option<Json>,
    pub variables: VariablesView,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskResponseType {
    OkProceed,
    OkPend,
    /// Park after advancing (§4.B). The engine does not re-invoke `execute_step`
    /// on resume; the caller must make the step idempotent if it can be retried
    /// any other way.
    OkPendEor,
    ErrorPend,
}

#[derive(Clone, Debug, Default)]
pub struct TaskResponse {
    pub response_type: Option<TaskResponseType>,
    pub ticket: Option<String>,
    pub work_basket: Option<String>,
    pub error: Option<ErrorInfo>,
}

impl TaskResponse {
    pub fn ok_proceed() -> Self {
        Self {
            response_type: Some(TaskResponseType::OkProceed),
            ..Default::default()
        }
    }

    pub fn ok_pend(work_basket: impl Into<String>) -> Self {
        Self {
            response_type: Some(TaskResponseType::OkPend),
            work_basket: Some(work_basket.into()),
            ..Default::default()
        }
    }

    pub fn ok_pend_eor(work_basket: impl Into<String>) -> Self {
        Self {
            response_type: Some(TaskResponseType::OkPendEor),
            work_basket: Some(work_basket.into()),
            ..Default::default()
        }
    }

    pub fn with_ticket(mut self, ticket: impl Into<String>) -> Self {
        self.ticket = Some(ticket.into());
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct RouteResponse {
    pub response_type: Option<TaskResponseType>,
    pub branches: Vec<String>,
    pub ticket: Option<String>,
    pub work_basket: Option<String>,
    pub error: Option<ErrorInfo>,
}

impl RouteResponse {
    pub fn proceed(branches: Vec<String>) -> Self {
        Self {
            response_type: Some(TaskResponseType::OkProceed),
            branches,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait InvokableTask: Send + Sync {
    async fn execute_step(&self, ctx: &StepContext) -> anyhow::Result<TaskResponse>;
}

#[async_trait]
pub trait InvokableRoute: Send + Sync {
    async fn execute_route(&self, ctx: &StepContext) -> anyhow::Result<RouteResponse>;
}

pub enum Invokable {
    Task(Box<dyn InvokableTask>),
    Route(Box<dyn InvokableRoute>),
}

/// Supplied by the host. `Pause`, `Persist`, and `Join` never call this (§6).
#[async_trait]
pub trait ComponentFactory: Send + Sync {
    async fn create(&self, ctx: &StepContext) -> anyhow::Result<Invokable>;
}
