//! Snapshot & Recovery Manager (§4.E). Generalized from the teacher's
//! `ProcessStore::save_snapshot`/`load_snapshot` pair (`store.rs`) to the
//! leaner `Repository` contract — one document per case under a
//! `"workflow_process_info:{caseId}"` key, the journey definition persisted
//! once under `"workflow_journey:{caseId}"`.
//!
//! Key separator note: §4.E specifies `workflow_process_info + SEP + caseId`
//! using the process-wide path separator. This crate instead uses a literal
//! `:` for document-key namespacing, independent of `EngineConfig::path_separator`
//! (which only governs execution-path names) — consistent with
//! `Repository::get_all`'s `"{type}:"` prefix convention in `repository/memory.rs`.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{Case, Journey, Node, PathStatus, ROOT_PATH};
use crate::repository::Repository;

pub fn process_info_key(case_id: &str) -> String {
    format!("workflow_process_info:{case_id}")
}

pub fn journey_key(case_id: &str) -> String {
    format!("workflow_journey:{case_id}")
}

fn audit_counter_key(case_id: &str) -> String {
    format!("workflow_process_info_audit_counter:{case_id}")
}

fn audit_key(case_id: &str, seq: i64) -> String {
    format!("workflow_process_info_audit:{case_id}:{seq}")
}

fn persist_failed(e: anyhow::Error) -> EngineError {
    EngineError::PersistFailed(e.to_string())
}

/// Persists the journey definition once, at `StartCase` time.
pub async fn save_journey(repo: &dyn Repository, case_id: &str, journey: &Journey) -> Result<(), EngineError> {
    let doc = serde_json::to_value(journey)
        .map_err(|e| EngineError::PersistFailed(format!("serializing journey: {e}")))?;
    repo.save(&journey_key(case_id), doc).await.map_err(persist_failed)
}

pub async fn load_journey(repo: &dyn Repository, case_id: &str) -> Result<Option<Journey>, EngineError> {
    let doc = repo.get(&journey_key(case_id)).await.map_err(persist_failed)?;
    match doc {
        Some(doc) => {
            let journey = serde_json::from_value(doc)
                .map_err(|e| EngineError::PersistFailed(format!("deserializing journey: {e}")))?;
            Ok(Some(journey))
        }
        None => Ok(None),
    }
}

/// §4.E write policy: atomic per-key document write, optionally copied to a
/// sequenced audit key.
pub async fn save_case(repo: &dyn Repository, case: &Case, config: &EngineConfig) -> Result<(), EngineError> {
    let doc = serde_json::to_value(case).map_err(|e| EngineError::PersistFailed(format!("serializing case: {e}")))?;
    repo.save_or_update(&process_info_key(&case.case_id), doc.clone())
        .await
        .map_err(persist_failed)?;

    if config.write_audit_log {
        let seq = repo
            .incr_counter(&audit_counter_key(&case.case_id))
            .await
            .map_err(persist_failed)?;
        repo.save_or_update(&audit_key(&case.case_id, seq), doc)
            .await
            .map_err(persist_failed)?;
    }
    Ok(())
}

/// Loads and recovers a case snapshot. Returns `None` if no snapshot exists
/// (per §9's resolved Open Question: treated as "case never started").
pub async fn load_case(repo: &dyn Repository, case_id: &str) -> Result<Option<Case>, EngineError> {
    let doc = repo.get(&process_info_key(case_id)).await.map_err(persist_failed)?;
    let Some(doc) = doc else { return Ok(None) };
    let mut case: Case = serde_json::from_value(doc)
        .map_err(|e| EngineError::PersistFailed(format!("deserializing case: {e}")))?;
    recover(&mut case)?;
    Ok(Some(case))
}

/// §4.E recovery rule: any path caught mid-advance (`running`) at crash time
/// is re-classified as `started`, re-executable on the next drive loop pass.
/// `OK_PEND_EOR` paths need no special handling here — the worker already
/// advanced `step` to `next` before pending, so lifting the pend later (see
/// `lift_pends`) resumes correctly without re-invoking the step.
fn recover(case: &mut Case) -> Result<(), EngineError> {
    if !case.exec_paths.contains_key(ROOT_PATH) {
        return Err(EngineError::InvariantViolation(format!(
            "case '{}' snapshot has no root path",
            case.case_id
        )));
    }
    for path in case.exec_paths.values_mut() {
        if path.status == PathStatus::Running {
            path.status = PathStatus::Started;
        }
    }
    Ok(())
}

/// Lifts every pended path back to runnable at the start of `ResumeCase`.
/// Returns `(pathName, basketLeft)` for each lifted path, for F's basket
/// dequeue emission. A `Pause` node's `next` is applied here — the one place
/// a pause's step moves, since `Pause` never calls the component factory.
pub fn lift_pends(case: &mut Case, journey: &Journey) -> Vec<(String, String)> {
    let mut left = Vec::new();
    for path in case.exec_paths.values_mut() {
        if !path.is_pended() {
            continue;
        }
        let basket = path.pend_work_basket.take().expect("is_pended implies Some");
        path.prev_pend_work_basket = Some(basket.clone());
        left.push((path.name.clone(), basket));
        if let Some(Node::Pause { next, .. }) = journey.nodes.get(&path.step) {
            path.step = next.clone();
        }
        path.status = PathStatus::Started;
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnitResponseType;
    use crate::repository::memory::MemoryRepository;
    use indexmap::IndexMap;
    use std::collections::HashMap;

    fn journey_with_pause() -> Journey {
        let mut nodes = IndexMap::new();
        nodes.insert("pause".to_string(), Node::Pause { name: "pause".to_string(), next: "after".to_string() });
        nodes.insert("after".to_string(), Node::Task { name: "after".to_string(), component_name: "c".to_string(), next: "end".to_string(), user_data: None });
        Journey {
            name: "j".to_string(),
            nodes,
            variables: IndexMap::new(),
            tickets: HashMap::new(),
            start: "pause".to_string(),
            fanout_joins: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_a_case() {
        let repo = MemoryRepository::new();
        let journey = journey_with_pause();
        let config = EngineConfig::default();
        let case = Case::new("c1".to_string(), &journey, IndexMap::new());
        save_journey(&repo, "c1", &journey).await.unwrap();
        save_case(&repo, &case, &config).await.unwrap();

        let loaded = load_case(&repo, "c1").await.unwrap().unwrap();
        assert_eq!(loaded.case_id, "c1");
        assert_eq!(loaded.exec_paths[ROOT_PATH].step, "pause");
    }

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let repo = MemoryRepository::new();
        assert!(load_case(&repo, "missing").await.unwrap().is_none());
    }

    #[test]
    fn recover_reclassifies_running_paths_as_started() {
        let mut case = Case::new("c1".to_string(), &journey_with_pause(), IndexMap::new());
        case.exec_paths.get_mut(ROOT_PATH).unwrap().status = PathStatus::Running;
        recover(&mut case).unwrap();
        assert_eq!(case.exec_paths[ROOT_PATH].status, PathStatus::Started);
    }

    #[test]
    fn lift_pends_advances_a_pause_node_past_itself() {
        let journey = journey_with_pause();
        let mut case = Case::new("c1".to_string(), &journey, IndexMap::new());
        {
            let root = case.exec_paths.get_mut(ROOT_PATH).unwrap();
            root.unit_response_type = Some(UnitResponseType::OkPend);
            root.pend_work_basket = Some("workflow_pause".to_string());
        }
        let left = lift_pends(&mut case, &journey);
        assert_eq!(left, vec![(ROOT_PATH.to_string(), "workflow_pause".to_string())]);
        let root = &case.exec_paths[ROOT_PATH];
        assert_eq!(root.step, "after");
        assert_eq!(root.status, PathStatus::Started);
        assert!(root.pend_work_basket.is_none());
        assert_eq!(root.prev_pend_work_basket.as_deref(), Some("workflow_pause"));
    }

    #[test]
    fn lift_pends_leaves_non_pause_step_unchanged() {
        let journey = journey_with_pause();
        let mut case = Case::new("c1".to_string(), &journey, IndexMap::new());
        {
            let root = case.exec_paths.get_mut(ROOT_PATH).unwrap();
            root.step = "after".to_string();
            root.unit_response_type = Some(UnitResponseType::OkPendEor);
            root.pend_work_basket = Some("park".to_string());
        }
        lift_pends(&mut case, &journey);
        assert_eq!(case.exec_paths[ROOT_PATH].step, "after");
    }
}
