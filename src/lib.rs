//! `journey-engine` — an embeddable workflow orchestration engine.
//!
//! A host parses a journey definition, starts a case against it, and drives
//! that case to completion through pend/resume cycles, handing control back
//! whenever execution parks at a work basket. See `engine::Engine` for the
//! three host-facing operations.

pub mod component;
pub mod config;
pub mod engine;
pub mod error;
pub mod join;
pub mod journey;
pub mod model;
pub mod repository;
pub mod sla;
pub mod snapshot;
pub mod ticket;
pub mod worker;

pub use component::{
    ComponentFactory, Invokable, InvokableRoute, InvokableTask, NodeKind, RouteResponse,
    StepContext, TaskResponse, TaskResponseType, VariablesView,
};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, ErrorInfo};
pub use model::{
    Case, ExecPath, Incident, Journey, Milestone, Node, PathStatus, ScalarValue, UnitResponseType,
    VarType,
};
pub use repository::Repository;
pub use sla::{EventHandler, EventKind, EventPayload, SlaCollaborator};
