//! End-to-end case-driving scenarios, run against a real `Engine` with a
//! scripted component factory instead of a mocked engine internals. Each test
//! plays out one lifecycle shape named in the data model docs: a linear run,
//! a single pend/resume, a static parallel fan-out with a mid-flight pend, a
//! ticket pre-empting siblings mid-fan-out, `OK_PEND_EOR` crash-recovery
//! idempotency, and an admin basket move with no resume in between.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use indexmap::IndexMap;

use journey_engine::component::{
    ComponentFactory, Invokable, InvokableRoute, InvokableTask, RouteResponse, StepContext,
    TaskResponse,
};
use journey_engine::model::{ClockStarts, Deadline, Milestone, MilestoneType, SetupOn};
use journey_engine::repository::memory::MemoryRepository;
use journey_engine::sla::{EventHandler, EventKind, EventPayload, SlaCollaborator};
use journey_engine::{Engine, EngineConfig, PathStatus};

enum Scripted {
    Task(TaskResponse),
    Route(RouteResponse),
}

/// Per-node-name queue of canned responses, popped one at a time on each
/// `create()` call for that node — lets a test script a node differently
/// across a pend/resume pair without the node knowing it was ever paused.
struct ScriptedFactory {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
}

impl ScriptedFactory {
    fn new() -> Self {
        Self { scripts: Mutex::new(HashMap::new()) }
    }

    fn push_task(&self, node: &str, resp: TaskResponse) {
        self.scripts.lock().unwrap().entry(node.to_string()).or_default().push_back(Scripted::Task(resp));
    }

    fn push_route(&self, node: &str, resp: RouteResponse) {
        self.scripts.lock().unwrap().entry(node.to_string()).or_default().push_back(Scripted::Route(resp));
    }
}

#[async_trait]
impl ComponentFactory for ScriptedFactory {
    async fn create(&self, ctx: &StepContext) -> anyhow::Result<Invokable> {
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&ctx.node_name)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow::anyhow!("no scripted response left for node '{}'", ctx.node_name))?;
        match scripted {
            Scripted::Task(resp) => Ok(Invokable::Task(Box::new(FixedTask(resp)))),
            Scripted::Route(resp) => Ok(Invokable::Route(Box::new(FixedRoute(resp)))),
        }
    }
}

struct FixedTask(TaskResponse);
#[async_trait]
impl InvokableTask for FixedTask {
    async fn execute_step(&self, _ctx: &StepContext) -> anyhow::Result<TaskResponse> {
        Ok(self.0.clone())
    }
}

struct FixedRoute(RouteResponse);
#[async_trait]
impl InvokableRoute for FixedRoute {
    async fn execute_route(&self, _ctx: &StepContext) -> anyhow::Result<RouteResponse> {
        Ok(self.0.clone())
    }
}

struct EventRecorder {
    kinds: Mutex<Vec<EventKind>>,
}

impl EventRecorder {
    fn new() -> Self {
        Self { kinds: Mutex::new(Vec::new()) }
    }

    fn kinds(&self) -> Vec<EventKind> {
        self.kinds.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn handle(&self, kind: EventKind, _payload: &EventPayload) -> anyhow::Result<()> {
        self.kinds.lock().unwrap().push(kind);
        Ok(())
    }
}

struct SlaRecorder {
    log: Mutex<Vec<String>>,
}

impl SlaRecorder {
    fn new() -> Self {
        Self { log: Mutex::new(Vec::new()) }
    }

    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl SlaCollaborator for SlaRecorder {
    async fn enqueue(&self, case_id: &str, milestones: &[Milestone]) -> anyhow::Result<()> {
        for m in milestones {
            self.log.lock().unwrap().push(format!("enqueue({case_id},{})", m.name));
        }
        Ok(())
    }

    async fn dequeue(&self, case_id: &str, work_basket: &str) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("dequeue({case_id},{work_basket})"));
        Ok(())
    }

    async fn dequeue_all(&self, case_id: &str) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("dequeue_all({case_id})"));
        Ok(())
    }
}

fn work_basket_milestone(basket: &str) -> Milestone {
    Milestone {
        name: format!("{basket}_sla"),
        setup_on: SetupOn::WorkBasketEntry,
        milestone_type: MilestoneType::WorkBasket,
        work_basket_name: Some(basket.to_string()),
        deadline: Deadline::Age("d00h04:00".to_string()),
        clock_starts: ClockStarts::Immediately,
        action_code: "ESCALATE".to_string(),
        user_data: None,
        future_milestones: Vec::new(),
    }
}

fn journey_json(flow: &str, tickets: &str) -> String {
    format!(r#"{{"journey":{{"name":"j","process_variables":[],"tickets":{tickets},"flow":{flow}}}}}"#)
}

fn new_engine(factory: Arc<ScriptedFactory>, events: Arc<EventRecorder>, sla: Arc<SlaRecorder>) -> Engine {
    Engine::new(EngineConfig::default(), Arc::new(MemoryRepository::new()), factory, events, sla).unwrap()
}

#[tokio::test]
async fn linear_happy_path_runs_straight_through_to_completion() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push_task("stepA", TaskResponse::ok_proceed());
    factory.push_task("stepB", TaskResponse::ok_proceed());
    let events = Arc::new(EventRecorder::new());
    let engine = new_engine(factory, events.clone(), Arc::new(SlaRecorder::new()));

    let json = journey_json(
        r#"[
            {"type":"TASK","name":"stepA","component":"c","next":"stepB"},
            {"type":"TASK","name":"stepB","component":"c","next":"end"}
        ]"#,
        "[]",
    );
    let case = engine.start_case("case-1", &json, IndexMap::new(), Vec::new()).await.unwrap();

    assert!(case.is_complete);
    assert_eq!(case.exec_paths["."].step, "end");
    assert_eq!(case.exec_paths["."].status, PathStatus::Completed);
    assert_eq!(
        events.kinds(),
        vec![EventKind::ProcessStart, EventKind::StepEntry, EventKind::StepExit, EventKind::ProcessComplete]
    );
}

#[tokio::test]
async fn single_pend_then_resume_drives_to_completion() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push_task("stepA", TaskResponse::ok_pend("hold"));
    factory.push_task("stepA", TaskResponse::ok_proceed());
    let sla = Arc::new(SlaRecorder::new());
    let engine = new_engine(factory, Arc::new(EventRecorder::new()), sla.clone());

    let json = journey_json(r#"[{"type":"TASK","name":"stepA","component":"c","next":"end"}]"#, "[]");
    let milestones = vec![work_basket_milestone("hold")];

    let case = engine.start_case("case-2", &json, IndexMap::new(), milestones).await.unwrap();
    assert!(!case.is_complete);
    assert_eq!(case.exec_paths["."].step, "stepA");
    assert_eq!(case.exec_paths["."].pend_work_basket.as_deref(), Some("hold"));

    let case = engine.resume_case("case-2").await.unwrap();
    assert!(case.is_complete);
    assert_eq!(case.exec_paths["."].step, "end");
    assert_eq!(case.exec_paths["."].status, PathStatus::Completed);

    // Entering the pend basket only enqueues its SLA; resume's lift dequeues
    // that basket before the case finally completes and dequeues everything.
    assert_eq!(
        sla.entries(),
        vec![
            "enqueue(case-2,hold_sla)".to_string(),
            "dequeue(case-2,hold)".to_string(),
            "dequeue_all(case-2)".to_string(),
        ]
    );
}

fn static_parallel_journey() -> String {
    journey_json(
        r#"[
            {"type":"P_ROUTE","name":"fork","component":"c","branches":[
                {"name":"a1","next":"a1"},{"name":"a2","next":"a2"},{"name":"a3","next":"a3"}
            ]},
            {"type":"TASK","name":"a1","component":"c","next":"join"},
            {"type":"TASK","name":"a2","component":"c","next":"join"},
            {"type":"TASK","name":"a3","component":"c","next":"join"},
            {"type":"P_JOIN","name":"join","next":"end"}
        ]"#,
        "[]",
    )
}

#[tokio::test]
async fn static_parallel_three_way_with_a_mid_flight_pend_converges_on_resume() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push_route("fork", RouteResponse::proceed(vec!["a1".to_string(), "a2".to_string(), "a3".to_string()]));
    factory.push_task("a1", TaskResponse::ok_proceed());
    factory.push_task("a2", TaskResponse::ok_pend("review"));
    factory.push_task("a2", TaskResponse::ok_proceed());
    factory.push_task("a3", TaskResponse::ok_proceed());
    let engine = new_engine(factory, Arc::new(EventRecorder::new()), Arc::new(SlaRecorder::new()));

    let case = engine.start_case("case-3", &static_parallel_journey(), IndexMap::new(), Vec::new()).await.unwrap();
    assert!(!case.is_complete);
    assert_eq!(case.exec_paths[".-a1"].status, PathStatus::Completed);
    assert_eq!(case.exec_paths[".-a3"].status, PathStatus::Completed);
    assert_eq!(case.exec_paths[".-a2"].pend_work_basket.as_deref(), Some("review"));

    let case = engine.resume_case("case-3").await.unwrap();
    assert!(case.is_complete);
    assert_eq!(case.exec_paths["."].step, "end");
    assert_eq!(case.exec_paths["."].status, PathStatus::Completed);
    assert!(!case.join_expectations.contains_key(&journey_engine::model::join_expectation_key(".", "join")));
}

#[tokio::test]
async fn ticket_pre_empts_siblings_mid_fanout_and_survivor_reaches_end() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push_route("fork", RouteResponse::proceed(vec!["a1".to_string(), "a2".to_string(), "a3".to_string()]));
    factory.push_task("a1", TaskResponse::ok_proceed());
    factory.push_task("a2", TaskResponse::ok_proceed());
    factory.push_task("a3", TaskResponse::ok_proceed().with_ticket("abort"));
    factory.push_task("cleanup", TaskResponse::ok_proceed());
    let engine = new_engine(factory, Arc::new(EventRecorder::new()), Arc::new(SlaRecorder::new()));

    let json = journey_json(
        r#"[
            {"type":"P_ROUTE","name":"fork","component":"c","branches":[
                {"name":"a1","next":"a1"},{"name":"a2","next":"a2"},{"name":"a3","next":"a3"}
            ]},
            {"type":"TASK","name":"a1","component":"c","next":"join"},
            {"type":"TASK","name":"a2","component":"c","next":"join"},
            {"type":"TASK","name":"a3","component":"c","next":"join"},
            {"type":"P_JOIN","name":"join","next":"end"},
            {"type":"TASK","name":"cleanup","component":"c","next":"end"}
        ]"#,
        r#"[{"name":"abort","step":"cleanup"}]"#,
    );

    let case = engine.start_case("case-4", &json, IndexMap::new(), Vec::new()).await.unwrap();

    assert!(case.is_complete);
    assert_eq!(case.ticket.as_deref(), Some("abort"));
    assert_eq!(case.exec_paths.len(), 1, "siblings are discarded once the ticket fires");
    assert_eq!(case.exec_paths[".-a3"].step, "end");
    assert_eq!(case.exec_paths[".-a3"].status, PathStatus::Completed);
    assert!(case.join_expectations.is_empty());
}

#[tokio::test]
async fn ok_pend_eor_advances_step_before_parking_so_resume_skips_the_pended_step() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push_task("stepX", TaskResponse::ok_pend_eor("park"));
    factory.push_task("stepY", TaskResponse::ok_proceed());
    let engine = new_engine(factory, Arc::new(EventRecorder::new()), Arc::new(SlaRecorder::new()));

    let json = journey_json(
        r#"[
            {"type":"TASK","name":"stepX","component":"c","next":"stepY"},
            {"type":"TASK","name":"stepY","component":"c","next":"end"}
        ]"#,
        "[]",
    );

    let case = engine.start_case("case-5", &json, IndexMap::new(), Vec::new()).await.unwrap();
    assert!(!case.is_complete);
    // The worker already moved `step` past stepX before pending (§4.B), so
    // resume only ever has stepY left to dispatch — stepX's single scripted
    // response being the only one available proves it is never re-invoked.
    assert_eq!(case.exec_paths["."].step, "stepY");
    assert_eq!(case.exec_paths["."].pend_work_basket.as_deref(), Some("park"));

    let case = engine.resume_case("case-5").await.unwrap();
    assert!(case.is_complete);
    assert_eq!(case.exec_paths["."].step, "end");
    assert_eq!(case.exec_paths["."].status, PathStatus::Completed);
}

#[tokio::test]
async fn chained_work_basket_changes_without_resume_reorder_sla_queue_and_stack_prev_basket() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push_task("stepA", TaskResponse::ok_pend("hold"));
    factory.push_task("stepA", TaskResponse::ok_proceed());
    let sla = Arc::new(SlaRecorder::new());
    let engine = new_engine(factory, Arc::new(EventRecorder::new()), sla.clone());

    let json = journey_json(r#"[{"type":"TASK","name":"stepA","component":"c","next":"end"}]"#, "[]");
    let milestones =
        vec![work_basket_milestone("hold"), work_basket_milestone("hold2"), work_basket_milestone("hold3")];

    let case = engine.start_case("case-6", &json, IndexMap::new(), milestones).await.unwrap();
    assert_eq!(case.exec_paths["."].pend_work_basket.as_deref(), Some("hold"));

    let case = engine.change_work_basket("case-6", "hold2").await.unwrap();
    assert_eq!(case.exec_paths["."].pend_work_basket.as_deref(), Some("hold2"));
    assert_eq!(case.exec_paths["."].prev_pend_work_basket.as_deref(), Some("hold"));

    let case = engine.change_work_basket("case-6", "hold3").await.unwrap();
    assert_eq!(case.exec_paths["."].pend_work_basket.as_deref(), Some("hold3"));
    assert_eq!(case.exec_paths["."].prev_pend_work_basket.as_deref(), Some("hold2"));
    assert!(!case.is_complete, "admin basket moves never resume execution");

    assert_eq!(
        sla.entries(),
        vec![
            "enqueue(case-6,hold_sla)".to_string(),
            "dequeue(case-6,hold)".to_string(),
            "enqueue(case-6,hold2_sla)".to_string(),
            "dequeue(case-6,hold2)".to_string(),
            "enqueue(case-6,hold3_sla)".to_string(),
        ]
    );
}
