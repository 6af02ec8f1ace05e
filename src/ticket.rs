//! Ticket Pre-emption Controller (§4.D) — the engine's only non-local control
//! transfer. Runs under the case lock, strictly before fan-out/join
//! reconciliation in the drive loop (§4.A point 3), so a sibling racing a
//! ticket-raising step never survives to affect the outcome.

use crate::config::EngineConfig;
use crate::error::ErrorInfo;
use crate::model::{Case, PathStatus};
use crate::worker::TicketRaise;

/// `raising_path_name` just produced `raise`. The caller has already written
/// the worker's returned path (with pend fields applied, if any) back into
/// `case.exec_paths`.
pub fn apply_ticket(case: &mut Case, journey: &crate::model::Journey, config: &EngineConfig, raising_path_name: &str, raise: TicketRaise) {
    let Some(target) = journey.tickets.get(&raise.ticket).cloned() else {
        tracing::warn!(case_id = %case.case_id, ticket = %raise.ticket, "unknown ticket raised");
        if let Some(path) = case.exec_paths.get_mut(raising_path_name) {
            path.prev_pend_work_basket = path.pend_work_basket.take();
            path.pend_work_basket = Some(config.error_workbasket.clone());
            path.pend_error = Some(ErrorInfo::unknown_ticket(&raise.ticket));
            path.unit_response_type = Some(crate::model::UnitResponseType::ErrorPend);
        }
        return;
    };

    tracing::info!(case_id = %case.case_id, ticket = %raise.ticket, target = %target, "ticket pre-empts siblings");
    case.ticket = Some(raise.ticket.clone());
    case.ticket_generation += 1;

    // Every other path is discarded, including ancestors of the raising path:
    // an ancestor sitting `Completed` at a fan-out node with its join
    // expectation now cleared below would otherwise never be reactivated,
    // permanently stuck short of `end`. §8 explicitly allows either outcome
    // ("marked completed... or cancelled") for a ticket's non-surviving
    // paths, so pruning the whole rest of the tree is spec-sanctioned.
    let cancelled: Vec<String> = case
        .exec_paths
        .keys()
        .filter(|name| *name != raising_path_name)
        .cloned()
        .collect();
    for name in cancelled {
        case.exec_paths.shift_remove(&name);
    }
    case.join_expectations.clear();

    if let Some(path) = case.exec_paths.get_mut(raising_path_name) {
        path.step = target;
        path.status = PathStatus::Started;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Case, ExecPath, Journey, Node};
    use indexmap::IndexMap;
    use std::collections::HashMap;

    fn journey_with_ticket() -> Journey {
        let mut nodes = IndexMap::new();
        nodes.insert("start".to_string(), Node::Task { name: "start".to_string(), component_name: "c".to_string(), next: "end".to_string(), user_data: None });
        nodes.insert("cleanup".to_string(), Node::Task { name: "cleanup".to_string(), component_name: "c".to_string(), next: "end".to_string(), user_data: None });
        let mut tickets = HashMap::new();
        tickets.insert("abort".to_string(), "cleanup".to_string());
        Journey {
            name: "j".to_string(),
            nodes,
            variables: IndexMap::new(),
            tickets,
            start: "start".to_string(),
            fanout_joins: HashMap::new(),
        }
    }

    #[test]
    fn valid_ticket_cancels_siblings_and_reseats_raiser() {
        let journey = journey_with_ticket();
        let config = EngineConfig::default();
        let mut case = Case::new("c1".to_string(), &journey, IndexMap::new());
        case.exec_paths.insert(".-a2".to_string(), ExecPath::child(".", "a2", "start", '-'));
        let raise = TicketRaise { ticket: "abort".to_string(), would_pend: false, work_basket: None, error: None };
        apply_ticket(&mut case, &journey, &config, ".", raise);

        assert_eq!(case.ticket.as_deref(), Some("abort"));
        assert_eq!(case.ticket_generation, 1);
        assert!(!case.exec_paths.contains_key(".-a2"));
        assert_eq!(case.exec_paths["."].step, "cleanup");
        assert_eq!(case.exec_paths["."].status, PathStatus::Started);
    }

    #[test]
    fn unknown_ticket_becomes_error_pend_without_cancelling_siblings() {
        let journey = journey_with_ticket();
        let config = EngineConfig::default();
        let mut case = Case::new("c1".to_string(), &journey, IndexMap::new());
        case.exec_paths.insert(".-a2".to_string(), ExecPath::child(".", "a2", "start", '-'));
        let raise = TicketRaise { ticket: "nope".to_string(), would_pend: false, work_basket: None, error: None };
        apply_ticket(&mut case, &journey, &config, ".", raise);

        assert!(case.ticket.is_none());
        assert!(case.exec_paths.contains_key(".-a2"));
        let path = &case.exec_paths["."];
        assert_eq!(path.pend_work_basket.as_deref(), Some(config.error_workbasket.as_str()));
        assert_eq!(path.pend_error.as_ref().unwrap().code, "UNKNOWN_TICKET");
    }
}
