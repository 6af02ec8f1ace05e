//! Case Interpreter (§4.A) — the engine's only host-facing surface:
//! `start_case`, `resume_case`, `change_work_basket`, plus the read-only
//! `inspect_case`. Generalized from the teacher's `BpmnLiteEngine` (`vm.rs`),
//! replacing its bytecode fetch-decode-execute loop with the drive loop below,
//! which repeatedly submits every runnable `ExecPath` to the worker pool and
//! reconciles results back into `Case` under a per-case lock.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;

use crate::component::{ComponentFactory, VariablesView};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::join;
use crate::journey;
use crate::model::{Case, ExecPath, Incident, Journey, Milestone, PathStatus, ScalarValue};
use crate::repository::Repository;
use crate::sla::{self, EventHandler, EventKind, EventPayload, SlaCollaborator};
use crate::snapshot;
use crate::ticket;
use crate::worker::{self, StopReason, WorkerOutput};

/// Host-assembled collaborators, constructor-injected (§9 "Global service
/// state" — no singleton, mirrors the teacher's `Arc<dyn ProcessStore>`
/// injection into `BpmnLiteEngine::new`).
pub struct Engine {
    config: EngineConfig,
    repository: Arc<dyn Repository>,
    component_factory: Arc<dyn ComponentFactory>,
    event_handler: Arc<dyn EventHandler>,
    sla: Arc<dyn SlaCollaborator>,
    /// `None` when `max_threads == 0`: every runnable path is then driven
    /// inline on the calling task instead of through the pool.
    semaphore: Option<Arc<Semaphore>>,
    case_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn Repository>,
        component_factory: Arc<dyn ComponentFactory>,
        event_handler: Arc<dyn EventHandler>,
        sla: Arc<dyn SlaCollaborator>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::DefinitionInvalid)?;
        let semaphore = (config.max_threads > 0).then(|| Arc::new(Semaphore::new(config.max_threads)));
        Ok(Self {
            config,
            repository,
            component_factory,
            event_handler,
            sla,
            semaphore,
            case_locks: RwLock::new(HashMap::new()),
        })
    }

    async fn lock_for(&self, case_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.case_locks.read().await.get(case_id) {
            return lock.clone();
        }
        self.case_locks
            .write()
            .await
            .entry(case_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Parses and validates `journey_json`, creates the case at its start
    /// node, and drives it until it pends or completes (§4.A point 1).
    /// Re-entrant per §9's resolved Open Question: if no snapshot exists the
    /// case is treated as never started, even if a prior crash happened
    /// mid-`StartCase` before the first snapshot write landed.
    pub async fn start_case(
        &self,
        case_id: &str,
        journey_json: &str,
        initial_variables: IndexMap<String, ScalarValue>,
        milestones: Vec<Milestone>,
    ) -> Result<Case, EngineError> {
        let lock = self.lock_for(case_id).await;
        let _guard = lock.lock().await;

        if snapshot::load_case(self.repository.as_ref(), case_id).await?.is_some() {
            return Err(EngineError::CaseAlreadyExists(case_id.to_string()));
        }

        let journey = journey::parse(journey_json)?;
        let mut case = Case::new(case_id.to_string(), &journey, initial_variables);
        case.milestones = milestones;

        snapshot::save_journey(self.repository.as_ref(), case_id, &journey).await?;
        tracing::info!(case_id, journey = %journey.name, "case started");
        self.emit(EventKind::ProcessStart, EventPayload { case_id: case_id.to_string(), ..Default::default() })
            .await;
        let case_level = case.case_level_milestones();
        if !case_level.is_empty() {
            self.sla_enqueue(case_id, &case_level).await;
        }

        self.drive(case_id, &mut case, &journey).await?;
        snapshot::save_case(self.repository.as_ref(), &case, &self.config).await?;
        self.emit_terminal_events(case_id, &case).await;
        Ok(case)
    }

    /// Lifts every pended path back to runnable and drives the case until it
    /// pends or completes again (§4.A point 2). The host is responsible for
    /// `OK_PEND_EOR` idempotency (§9): the engine never re-invokes a step
    /// whose pend already advanced `step` past it.
    pub async fn resume_case(&self, case_id: &str) -> Result<Case, EngineError> {
        let lock = self.lock_for(case_id).await;
        let _guard = lock.lock().await;

        let mut case = snapshot::load_case(self.repository.as_ref(), case_id)
            .await?
            .ok_or_else(|| EngineError::CaseNotFound(case_id.to_string()))?;
        if case.is_complete {
            return Err(EngineError::CaseAlreadyComplete(case_id.to_string()));
        }
        let journey = snapshot::load_journey(self.repository.as_ref(), case_id)
            .await?
            .ok_or_else(|| EngineError::InvariantViolation(format!("case '{case_id}' has no journey snapshot")))?;

        let lifted = snapshot::lift_pends(&mut case, &journey);
        for (path_name, basket) in &lifted {
            self.sla_dequeue(case_id, basket).await;
            tracing::debug!(case_id, path = %path_name, basket, "pend lifted");
            self.emit(
                EventKind::ProcessResume,
                EventPayload {
                    case_id: case_id.to_string(),
                    path_name: path_name.clone(),
                    work_basket: basket.clone(),
                    ..Default::default()
                },
            )
            .await;
        }

        self.drive(case_id, &mut case, &journey).await?;
        snapshot::save_case(self.repository.as_ref(), &case, &self.config).await?;
        self.emit_terminal_events(case_id, &case).await;
        Ok(case)
    }

    /// Administrative basket move without resuming execution (§4.F): requires
    /// the case pended on exactly one path. Ordering between a racing
    /// `resume_case`/`change_work_basket` pair is FIFO over the case lock
    /// (§9's resolved Open Question) — tokio's mutex grants roughly in
    /// arrival order; callers needing a hard guarantee must serialize
    /// externally.
    pub async fn change_work_basket(&self, case_id: &str, new_basket: &str) -> Result<Case, EngineError> {
        let lock = self.lock_for(case_id).await;
        let _guard = lock.lock().await;

        let mut case = snapshot::load_case(self.repository.as_ref(), case_id)
            .await?
            .ok_or_else(|| EngineError::CaseNotFound(case_id.to_string()))?;
        if case.is_complete {
            return Err(EngineError::CaseAlreadyComplete(case_id.to_string()));
        }

        let new_milestones = case.milestones_for_basket(new_basket);
        let effect = sla::change_work_basket(&mut case, new_basket)?;
        self.sla_dequeue(case_id, &effect.old_basket).await;
        if !new_milestones.is_empty() {
            self.sla_enqueue(case_id, &new_milestones).await;
        }
        tracing::info!(case_id, path = %effect.path_name, from = %effect.old_basket, to = %effect.new_basket, "work basket changed");

        snapshot::save_case(self.repository.as_ref(), &case, &self.config).await?;
        Ok(case)
    }

    /// Read-only diagnostic snapshot (§4 supplement, grounded in the
    /// teacher's `BpmnLiteEngine::inspect`). Never mutates case state.
    pub async fn inspect_case(&self, case_id: &str) -> Result<Case, EngineError> {
        snapshot::load_case(self.repository.as_ref(), case_id)
            .await?
            .ok_or_else(|| EngineError::CaseNotFound(case_id.to_string()))
    }

    /// The drive loop (§4.A point 3): submit every runnable path to the
    /// worker pool, await them all, reconcile results in path-name
    /// lexicographic order, then repeat until nothing is runnable. Tickets
    /// are applied strictly before fan-out/join reconciliation so a sibling
    /// racing a ticket-raising step never survives to affect the outcome.
    async fn drive(&self, case_id: &str, case: &mut Case, journey: &Journey) -> Result<(), EngineError> {
        loop {
            let mut runnable = case.runnable_paths();
            if runnable.is_empty() {
                break;
            }
            runnable.sort();

            let variables = VariablesView(case.variables.clone());
            for name in &runnable {
                let Some(path) = case.exec_paths.get_mut(name) else { continue };
                path.status = PathStatus::Running;
                let entry_node = journey.nodes.get(&path.step).map(|n| n.name().to_string()).unwrap_or_default();
                self.emit(
                    EventKind::StepEntry,
                    EventPayload { case_id: case_id.to_string(), path_name: name.clone(), component_name: entry_node, ..Default::default() },
                )
                .await;
            }

            let generation = case.ticket_generation;
            let mut results: Vec<anyhow::Result<WorkerOutput>> = Vec::with_capacity(runnable.len());

            if let Some(semaphore) = &self.semaphore {
                let mut join_set: JoinSet<anyhow::Result<WorkerOutput>> = JoinSet::new();
                for name in &runnable {
                    let path = case.exec_paths[name].clone();
                    let journey = journey.clone();
                    let variables = variables.clone();
                    let factory = self.component_factory.clone();
                    let config = self.config.clone();
                    let case_id = case_id.to_string();
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| EngineError::ExecutorSaturated)?;
                    join_set.spawn(async move {
                        let _permit = permit;
                        worker::advance_path(&case_id, path, &journey, &variables, &factory, &config).await
                    });
                }
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok(result) => results.push(result),
                        Err(e) => results.push(Err(anyhow::anyhow!("worker task panicked: {e}"))),
                    }
                }
            } else {
                for name in &runnable {
                    let path = case.exec_paths[name].clone();
                    let out = worker::advance_path(case_id, path, journey, &variables, &self.component_factory, &self.config).await;
                    results.push(out);
                }
            }

            if generation != case.ticket_generation {
                // A concurrent admin call pre-empted this case mid-flight; the
                // results below describe paths that may no longer exist.
                // Discard the batch and let the next iteration re-read
                // `runnable_paths()` from the post-ticket state.
                continue;
            }

            results.sort_by(|a, b| {
                let ka = a.as_ref().map(|o| o.path.name.as_str()).unwrap_or("");
                let kb = b.as_ref().map(|o| o.path.name.as_str()).unwrap_or("");
                ka.cmp(kb)
            });

            // A valid ticket strictly pre-empts the rest of this round (§4.A
            // point 3): every other result in this same batch describes a
            // path about to be discarded by `ticket::apply_ticket`, so it
            // must never be reconciled back into `case.exec_paths` — doing
            // so would resurrect a sibling the ticket just cancelled. Ties
            // among multiple simultaneous raisers break lexicographically.
            let valid_ticket_idx = results.iter().position(|r| {
                r.as_ref()
                    .ok()
                    .and_then(|o| o.ticket.as_ref())
                    .is_some_and(|t| journey.tickets.contains_key(&t.ticket))
            });

            let mut force_persist = false;
            if let Some(idx) = valid_ticket_idx {
                if results.iter().enumerate().any(|(i, r)| i != idx && r.is_err()) {
                    return Err(EngineError::Other(anyhow::anyhow!("a worker failed in the same round as a ticket raise")));
                }
                let output = results.into_iter().nth(idx).unwrap().map_err(EngineError::Other)?;
                force_persist |= output.forced_persist;
                self.reconcile(case_id, case, journey, output).await?;
            } else {
                for result in results {
                    let output = result.map_err(EngineError::Other)?;
                    force_persist |= output.forced_persist;
                    self.reconcile(case_id, case, journey, output).await?;
                }
            }

            // §4.B: a `Persist` node forces a snapshot write regardless of
            // `write_process_info_after_each_step`.
            if self.config.write_process_info_after_each_step || force_persist {
                snapshot::save_case(self.repository.as_ref(), case, &self.config).await?;
            }
        }
        case.is_complete = case.all_paths_terminal();
        Ok(())
    }

    /// Folds one worker's output back into `Case` (§4.A point 3 sub-steps):
    /// ticket pre-emption first, then fan-out/join, then plain
    /// completion/pend. Each sub-step mutates `case` directly under the
    /// caller's lock.
    async fn reconcile(&self, case_id: &str, case: &mut Case, journey: &Journey, output: WorkerOutput) -> Result<(), EngineError> {
        let path_name = output.path.name.clone();
        let stop = output.stop;
        let ticket_raise = output.ticket;
        let exit_step = output.path.step.clone();
        case.last_unit_executed = Some((path_name.clone(), exit_step.clone()));
        case.exec_paths.insert(path_name.clone(), output.path);
        self.emit(
            EventKind::StepExit,
            EventPayload { case_id: case_id.to_string(), path_name: path_name.clone(), component_name: exit_step, ..Default::default() },
        )
        .await;

        if let Some(raise) = ticket_raise {
            ticket::apply_ticket(case, journey, &self.config, &path_name, raise);
            if let Some(path) = case.exec_paths.get(&path_name).cloned() {
                if let Some(error) = path.pend_error.clone() {
                    self.record_incident(case_id, &path_name, &path.step, error).await;
                    self.emit_pend(case_id, &path_name, &path).await;
                }
            }
            return Ok(());
        }

        match stop {
            StopReason::Completed => {}
            StopReason::Pended => {
                if let Some(path) = case.exec_paths.get(&path_name).cloned() {
                    if let Some(error) = path.pend_error.clone() {
                        self.record_incident(case_id, &path_name, &path.step, error).await;
                    }
                    self.emit_pend(case_id, &path_name, &path).await;
                }
            }
            StopReason::FanOut { fanout_node, labels } => {
                join::apply_fanout(case, journey, &self.config, &path_name, &fanout_node, &labels)?;
            }
            StopReason::JoinArrived { join_node } => {
                join::apply_join_arrival(case, journey, &self.config, &path_name, &join_node)?;
            }
        }
        Ok(())
    }

    async fn record_incident(&self, case_id: &str, path_name: &str, step: &str, error: crate::error::ErrorInfo) {
        let incident = Incident {
            incident_id: uuid::Uuid::now_v7(),
            case_id: case_id.to_string(),
            path_name: path_name.to_string(),
            step: step.to_string(),
            error,
            created_at: now_millis(),
        };
        tracing::warn!(case_id, path = path_name, step, code = %incident.error.code, "incident recorded");
        if let Err(e) = self.repository.save_incident(&incident).await {
            tracing::error!(case_id, error = %e, "failed to persist incident");
        }
    }

    async fn emit_pend(&self, case_id: &str, path_name: &str, path: &ExecPath) {
        let Some(basket) = path.pend_work_basket.clone() else { return };
        let is_pend_at_same_step = path.pend_work_basket == path.prev_pend_work_basket;
        self.emit(
            EventKind::ProcessPend,
            EventPayload {
                case_id: case_id.to_string(),
                path_name: path_name.to_string(),
                work_basket: basket.clone(),
                is_pend_at_same_step,
                ..Default::default()
            },
        )
        .await;
    }

    async fn emit_terminal_events(&self, case_id: &str, case: &Case) {
        if case.is_complete {
            tracing::info!(case_id, "case complete");
            self.sla_dequeue_all(case_id).await;
            self.emit(EventKind::ProcessComplete, EventPayload { case_id: case_id.to_string(), ..Default::default() })
                .await;
            return;
        }
        for path_name in case.pended_paths() {
            let Some(path) = case.exec_paths.get(&path_name) else { continue };
            let Some(basket) = path.pend_work_basket.clone() else { continue };
            let milestones = case.milestones_for_basket(&basket);
            if !milestones.is_empty() {
                self.sla_enqueue(case_id, &milestones).await;
            }
        }
    }

    async fn emit(&self, kind: EventKind, payload: EventPayload) {
        if let Err(e) = self.event_handler.handle(kind, &payload).await {
            tracing::warn!(case_id = %payload.case_id, error = %e, "event handler failed");
        }
    }

    async fn sla_enqueue(&self, case_id: &str, milestones: &[Milestone]) {
        if let Err(e) = self.sla.enqueue(case_id, milestones).await {
            tracing::warn!(case_id, error = %e, "sla enqueue failed");
        }
    }

    async fn sla_dequeue(&self, case_id: &str, work_basket: &str) {
        if let Err(e) = self.sla.dequeue(case_id, work_basket).await {
            tracing::warn!(case_id, work_basket, error = %e, "sla dequeue failed");
        }
    }

    async fn sla_dequeue_all(&self, case_id: &str) {
        if let Err(e) = self.sla.dequeue_all(case_id).await {
            tracing::warn!(case_id, error = %e, "sla dequeue_all failed");
        }
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}
