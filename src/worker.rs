//! Execution Path Worker (§4.B) — advances one path until it ends, pends,
//! reaches a fan-out, or reaches a join. Generalized from the teacher's
//! `vm.rs` fetch-dispatch-execute loop (`Fiber::run`), minus the bytecode
//! program counter: dispatch is by `Node` variant instead of opcode.
//!
//! A worker owns a private clone of its `ExecPath` for the duration of one
//! invocation (§5: "fields owned exclusively by the single worker that holds
//! the path") and never touches `Case` directly — the drive loop reconciles
//! the returned `WorkerOutput` back into shared state under the case lock.

use std::sync::Arc;

use crate::component::{
    ComponentFactory, Invokable, NodeKind, StepContext, TaskResponseType, VariablesView,
};
use crate::config::{EngineConfig, PAUSE_WORK_BASKET};
use crate::error::ErrorInfo;
use crate::model::{ExecPath, Journey, Node, PathStatus, UnitResponseType};

#[derive(Debug)]
pub enum StopReason {
    /// Reached `end`; the path is done.
    Completed,
    /// Parked at a work basket. `ExecPath`'s pend fields are already set.
    Pended,
    /// Landed on a `PRoute`/`PRouteDynamic` node with the given response labels.
    FanOut { fanout_node: String, labels: Vec<String> },
    /// Landed on a `Join` node.
    JoinArrived { join_node: String },
}

/// Carries what a ticket-bearing response *would* have done locally, so the
/// Ticket Pre-emption Controller (§4.D point 5) can decide whether the
/// raising path pends at its target or continues immediately.
#[derive(Debug)]
pub struct TicketRaise {
    pub ticket: String,
    pub would_pend: bool,
    pub work_basket: Option<String>,
    pub error: Option<ErrorInfo>,
}

pub struct WorkerOutput {
    pub path: ExecPath,
    pub stop: StopReason,
    pub ticket: Option<TicketRaise>,
    /// True if a `Persist` node was crossed during this invocation — forces a
    /// snapshot write regardless of `writeProcessInfoAfterEachStep` (§4.B).
    pub forced_persist: bool,
}

/// Advances `path` (owned) until a stopping condition. `journey` and
/// `variables` are read-only and may be shared freely across concurrently
/// running workers (§5).
pub async fn advance_path(
    case_id: &str,
    mut path: ExecPath,
    journey: &Journey,
    variables: &VariablesView,
    factory: &Arc<dyn ComponentFactory>,
    config: &EngineConfig,
) -> anyhow::Result<WorkerOutput> {
    let mut forced_persist = false;

    loop {
        let node = journey
            .nodes
            .get(&path.step)
            .ok_or_else(|| anyhow::anyhow!("path '{}' sits on unknown node '{}'", path.name, path.step))?;

        match node {
            Node::Task { name, component_name, next, user_data } => {
                let ctx = step_context(case_id, &path, name, component_name, NodeKind::Task, user_data, variables);
                let outcome: anyhow::Result<_> = async {
                    let invokable = factory.create(&ctx).await?;
                    let task = match invokable {
                        Invokable::Task(t) => t,
                        Invokable::Route(_) => {
                            anyhow::bail!("component factory returned a route for task node '{name}'")
                        }
                    };
                    let resp = task.execute_step(&ctx).await?;
                    let response_type = resp
                        .response_type
                        .ok_or_else(|| anyhow::anyhow!("task '{name}' returned no response type"))?;
                    Ok((resp, response_type))
                }
                .await;
                let (resp, response_type) = match outcome {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(path = %path.name, step = %name, error = %e, "task threw, converting to ERROR_PEND");
                        apply_pend(&mut path, UnitResponseType::ErrorPend, Some(config.error_workbasket.clone()), Some(ErrorInfo::user_step_threw(e.to_string())));
                        return Ok(WorkerOutput { path, stop: StopReason::Pended, ticket: None, forced_persist });
                    }
                };

                if let Some(ticket) = resp.ticket {
                    tracing::debug!(path = %path.name, step = %name, ticket = %ticket, "task raised ticket");
                    let would_pend = response_type != TaskResponseType::OkProceed;
                    apply_local_pend_fields(&mut path, response_type, resp.work_basket.clone(), resp.error.clone());
                    return Ok(WorkerOutput {
                        path,
                        stop: StopReason::Pended,
                        ticket: Some(TicketRaise {
                            ticket,
                            would_pend,
                            work_basket: resp.work_basket,
                            error: resp.error,
                        }),
                        forced_persist,
                    });
                }

                match response_type {
                    TaskResponseType::OkProceed => {
                        path.unit_response_type = Some(UnitResponseType::OkProceed);
                        if advance_or_complete(&mut path, next) {
                            return Ok(WorkerOutput { path, stop: StopReason::Completed, ticket: None, forced_persist });
                        }
                    }
                    TaskResponseType::OkPend => {
                        apply_pend(&mut path, UnitResponseType::OkPend, resp.work_basket, resp.error);
                        return Ok(WorkerOutput { path, stop: StopReason::Pended, ticket: None, forced_persist });
                    }
                    TaskResponseType::OkPendEor => {
                        path.step = next.clone();
                        apply_pend(&mut path, UnitResponseType::OkPendEor, resp.work_basket, resp.error);
                        return Ok(WorkerOutput { path, stop: StopReason::Pended, ticket: None, forced_persist });
                    }
                    TaskResponseType::ErrorPend => {
                        let error = resp.error.unwrap_or_else(|| ErrorInfo::user_step_threw("task signalled ERROR_PEND with no detail"));
                        apply_pend(
                            &mut path,
                            UnitResponseType::ErrorPend,
                            Some(resp.work_basket.unwrap_or_else(|| config.error_workbasket.clone())),
                            Some(error),
                        );
                        return Ok(WorkerOutput { path, stop: StopReason::Pended, ticket: None, forced_persist });
                    }
                }
            }

            Node::SRoute { name, component_name, user_data, branches } => {
                let ctx = step_context(case_id, &path, name, component_name, NodeKind::SRoute, user_data, variables);
                let resp = match invoke_route(&ctx, name, factory).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(path = %path.name, step = %name, error = %e, "route threw, converting to ERROR_PEND");
                        apply_pend(&mut path, UnitResponseType::ErrorPend, Some(config.error_workbasket.clone()), Some(ErrorInfo::user_step_threw(e.to_string())));
                        return Ok(WorkerOutput { path, stop: StopReason::Pended, ticket: None, forced_persist });
                    }
                };

                if let Some(ticket) = resp.ticket {
                    let response_type = resp.response_type.unwrap_or(TaskResponseType::OkProceed);
                    let would_pend = response_type != TaskResponseType::OkProceed;
                    apply_local_pend_fields(&mut path, response_type, resp.work_basket.clone(), resp.error.clone());
                    return Ok(WorkerOutput {
                        path,
                        stop: StopReason::Pended,
                        ticket: Some(TicketRaise { ticket, would_pend, work_basket: resp.work_basket, error: resp.error }),
                        forced_persist,
                    });
                }

                if resp.branches.len() != 1 {
                    anyhow::bail!(
                        "sequential route '{name}' must return exactly one label, got {}",
                        resp.branches.len()
                    );
                }
                let label = &resp.branches[0];
                let target = branches.get(label).ok_or_else(|| {
                    anyhow::anyhow!("sequential route '{name}' returned undefined branch '{label}'")
                })?;
                path.unit_response_type = Some(UnitResponseType::OkProceed);
                if advance_or_complete(&mut path, target) {
                    return Ok(WorkerOutput { path, stop: StopReason::Completed, ticket: None, forced_persist });
                }
            }

            Node::PRoute { name, component_name, user_data, branches } => {
                let ctx = step_context(case_id, &path, name, component_name, NodeKind::PRoute, user_data, variables);
                let resp = match invoke_route(&ctx, name, factory).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(path = %path.name, step = %name, error = %e, "fan-out route threw, converting to ERROR_PEND");
                        apply_pend(&mut path, UnitResponseType::ErrorPend, Some(config.error_workbasket.clone()), Some(ErrorInfo::user_step_threw(e.to_string())));
                        return Ok(WorkerOutput { path, stop: StopReason::Pended, ticket: None, forced_persist });
                    }
                };

                if let Some(ticket) = resp.ticket {
                    let response_type = resp.response_type.unwrap_or(TaskResponseType::OkProceed);
                    let would_pend = response_type != TaskResponseType::OkProceed;
                    apply_local_pend_fields(&mut path, response_type, resp.work_basket.clone(), resp.error.clone());
                    return Ok(WorkerOutput {
                        path,
                        stop: StopReason::Pended,
                        ticket: Some(TicketRaise { ticket, would_pend, work_basket: resp.work_basket, error: resp.error }),
                        forced_persist,
                    });
                }

                for label in &resp.branches {
                    if !branches.contains_key(label) {
                        anyhow::bail!("parallel route '{name}' returned undefined branch '{label}'");
                    }
                }
                path.unit_response_type = Some(UnitResponseType::OkProceed);
                path.status = PathStatus::Completed;
                return Ok(WorkerOutput {
                    path,
                    stop: StopReason::FanOut { fanout_node: name.clone(), labels: resp.branches },
                    ticket: None,
                    forced_persist,
                });
            }

            Node::PRouteDynamic { name, component_name, user_data, .. } => {
                let ctx = step_context(case_id, &path, name, component_name, NodeKind::PRouteDynamic, user_data, variables);
                let resp = match invoke_route(&ctx, name, factory).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(path = %path.name, step = %name, error = %e, "dynamic fan-out route threw, converting to ERROR_PEND");
                        apply_pend(&mut path, UnitResponseType::ErrorPend, Some(config.error_workbasket.clone()), Some(ErrorInfo::user_step_threw(e.to_string())));
                        return Ok(WorkerOutput { path, stop: StopReason::Pended, ticket: None, forced_persist });
                    }
                };

                if let Some(ticket) = resp.ticket {
                    let response_type = resp.response_type.unwrap_or(TaskResponseType::OkProceed);
                    let would_pend = response_type != TaskResponseType::OkProceed;
                    apply_local_pend_fields(&mut path, response_type, resp.work_basket.clone(), resp.error.clone());
                    return Ok(WorkerOutput {
                        path,
                        stop: StopReason::Pended,
                        ticket: Some(TicketRaise { ticket, would_pend, work_basket: resp.work_basket, error: resp.error }),
                        forced_persist,
                    });
                }

                path.unit_response_type = Some(UnitResponseType::OkProceed);
                path.status = PathStatus::Completed;
                return Ok(WorkerOutput {
                    path,
                    stop: StopReason::FanOut { fanout_node: name.clone(), labels: resp.branches },
                    ticket: None,
                    forced_persist,
                });
            }

            Node::Pause { .. } => {
                path.unit_response_type = Some(UnitResponseType::OkPend);
                path.prev_pend_work_basket = path.pend_work_basket.take();
                path.pend_work_basket = Some(PAUSE_WORK_BASKET.to_string());
                return Ok(WorkerOutput { path, stop: StopReason::Pended, ticket: None, forced_persist });
            }

            Node::Persist { next, .. } => {
                forced_persist = true;
                path.unit_response_type = Some(UnitResponseType::OkProceed);
                if advance_or_complete(&mut path, next) {
                    return Ok(WorkerOutput { path, stop: StopReason::Completed, ticket: None, forced_persist });
                }
            }

            Node::Join { name, .. } => {
                return Ok(WorkerOutput {
                    path,
                    stop: StopReason::JoinArrived { join_node: name.clone() },
                    ticket: None,
                    forced_persist,
                });
            }
        }
    }
}

async fn invoke_route(
    ctx: &StepContext,
    name: &str,
    factory: &Arc<dyn ComponentFactory>,
) -> anyhow::Result<crate::component::RouteResponse> {
    let invokable = factory.create(ctx).await?;
    let route = match invokable {
        Invokable::Route(r) => r,
        Invokable::Task(_) => anyhow::bail!("component factory returned a task for route node '{name}'"),
    };
    route.execute_route(ctx).await
}

fn step_context(
    case_id: &str,
    path: &ExecPath,
    node_name: &str,
    component_name: &str,
    node_kind: NodeKind,
    user_data: &Option<serde_json::Value>,
    variables: &VariablesView,
) -> StepContext {
    StepContext {
        case_id: case_id.to_string(),
        path_name: path.name.clone(),
        node_name: node_name.to_string(),
        component_name: component_name.to_string(),
        node_kind,
        user_data: user_data.clone(),
        variables: variables.clone(),
    }
}

fn apply_pend(
    path: &mut ExecPath,
    response_type: UnitResponseType,
    work_basket: Option<String>,
    error: Option<ErrorInfo>,
) {
    path.unit_response_type = Some(response_type);
    path.prev_pend_work_basket = path.pend_work_basket.take();
    path.pend_work_basket = work_basket;
    path.pend_error = error;
}

fn apply_local_pend_fields(
    path: &mut ExecPath,
    response_type: TaskResponseType,
    work_basket: Option<String>,
    error: Option<ErrorInfo>,
) {
    let mapped = match response_type {
        TaskResponseType::OkProceed => UnitResponseType::OkProceed,
        TaskResponseType::OkPend => UnitResponseType::OkPend,
        TaskResponseType::OkPendEor => UnitResponseType::OkPendEor,
        TaskResponseType::ErrorPend => UnitResponseType::ErrorPend,
    };
    path.unit_response_type = Some(mapped);
    if response_type != TaskResponseType::OkProceed {
        path.prev_pend_work_basket = path.pend_work_basket.take();
        path.pend_work_basket = work_basket;
        path.pend_error = error;
    }
}

/// Moves `step` forward; returns true if that lands on `end`.
fn advance_or_complete(path: &mut ExecPath, next: &str) -> bool {
    path.step = next.to_string();
    if next == crate::config::END_NODE {
        path.status = PathStatus::Completed;
        true
    } else {
        false
    }
}
