//! SLA Notifier & Work-basket Admin (§4.F). The host callback surfaces
//! (`EventHandler`, `SlaCollaborator`) are trait-object boundaries in the same
//! spirit as `component::ComponentFactory` — user code the core never
//! constructs, only calls through. The admin state-mutation (`change_work_basket`)
//! is a pure function over `Case`, mirroring `ticket::apply_ticket` and
//! `join::apply_fanout`'s shape so `engine.rs` composes all three the same way
//! under the case lock.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::model::{Case, Milestone};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    ProcessStart,
    ProcessResume,
    ProcessPend,
    ProcessComplete,
    StepEntry,
    StepExit,
}

/// Uniform payload for all six events (§6 "Event handler (host callback)").
/// Fields not meaningful to a given `EventKind` are left at their defaults.
#[derive(Clone, Debug, Default)]
pub struct EventPayload {
    pub case_id: String,
    pub path_name: String,
    pub component_name: String,
    pub work_basket: String,
    pub is_pend_at_same_step: bool,
}

/// Runs synchronously on the engine thread (§6); must not call back into the
/// engine for the same case. Errors are caught and logged by the caller — they
/// never alter case state (§7 propagation rules).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, kind: EventKind, payload: &EventPayload) -> anyhow::Result<()>;
}

/// Three methods, idempotent composition (§6): repeated enqueues for the same
/// `(case, basket)` are permitted; the collaborator is expected to dedup.
#[async_trait]
pub trait SlaCollaborator: Send + Sync {
    async fn enqueue(&self, case_id: &str, milestones: &[Milestone]) -> anyhow::Result<()>;
    async fn dequeue(&self, case_id: &str, work_basket: &str) -> anyhow::Result<()>;
    async fn dequeue_all(&self, case_id: &str) -> anyhow::Result<()>;
}

pub struct ChangeWorkBasketEffect {
    pub path_name: String,
    pub old_basket: String,
    pub new_basket: String,
}

/// §4.F admin entry point body, run under the same case-level lock as
/// `Engine::start_case`/`resume_case`. Requires the case pended on exactly one
/// path; chained calls compose (each swap records the previous basket in
/// `prevPendWorkBasket`), matching the §8 law
/// `ChangeWorkBasket(b1); ChangeWorkBasket(b2)` → `dequeue(old), enqueue(b1), dequeue(b1), enqueue(b2)`.
pub fn change_work_basket(case: &mut Case, new_basket: &str) -> Result<ChangeWorkBasketEffect, EngineError> {
    let pended = case.pended_paths();
    if pended.len() != 1 {
        return Err(EngineError::InvariantViolation(format!(
            "change_work_basket requires the case pended on exactly one path, found {}",
            pended.len()
        )));
    }
    let path_name = pended.into_iter().next().expect("len checked above");
    let path = case
        .exec_paths
        .get_mut(&path_name)
        .ok_or_else(|| EngineError::InvariantViolation(format!("unknown path '{path_name}'")))?;
    let old_basket = path
        .pend_work_basket
        .clone()
        .ok_or_else(|| EngineError::InvariantViolation(format!("path '{path_name}' is not pended")))?;
    path.prev_pend_work_basket = Some(old_basket.clone());
    path.pend_work_basket = Some(new_basket.to_string());
    Ok(ChangeWorkBasketEffect { path_name, old_basket, new_basket: new_basket.to_string() })
}
