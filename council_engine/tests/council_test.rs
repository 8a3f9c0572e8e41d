//! End-to-end tests for the council: routing, feedback, learning, the nursery
//! and memory persistence.

use async_trait::async_trait;
use council_engine::{
    advisor::{Advisor, AdvisorDescriptor, AdvisorFactory, AdvisorStats, Proposal},
    engine::EchoEngine,
    error::{CouncilError, Result},
    learning::{Feedback, OutcomeSignal},
    memory::{ArchiveReceipt, InMemoryBackend, MemoryBackend, MemoryRecord, RetrievedContext},
    router::{CouncilRequest, FailureKind, RouteStatus, RoutingMode},
    orchestrator::EvolutionState,
    settings::Settings,
    Council,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

const BUDGET_ITEMS: [&str; 10] = [
    "groceries", "rent", "vacation", "savings", "holidays", "utilities", "insurance", "tuition", "gifts",
    "repairs",
];

async fn council_with(settings: Settings) -> Council {
    Council::new(settings, Arc::new(EchoEngine::new())).await.unwrap()
}

/// Ten budgeting turns answered by jarvis and rated badly.
async fn struggle_with_budgeting(council: &Council) {
    for item in BUDGET_ITEMS {
        let response = council
            .handle(CouncilRequest::new(format!("budgeting for {}", item), RoutingMode::Reflex))
            .await
            .unwrap();
        assert_eq!(response.trace.decision.selected, vec!["jarvis"]);
        council.feedback(response.request_id, Feedback::Negative).await.unwrap();
    }
}

/// Advisor that never answers within any sensible timeout.
struct StuckAdvisor {
    descriptor: AdvisorDescriptor,
}

#[async_trait]
impl Advisor for StuckAdvisor {
    fn descriptor(&self) -> &AdvisorDescriptor {
        &self.descriptor
    }

    async fn produce(&self, _prompt: &str, _context: &RetrievedContext) -> Result<Proposal> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(CouncilError::AdvisorFailure {
            advisor: self.descriptor.id.clone(),
            reason: "woke up too late".to_string(),
        })
    }

    fn specialize(&self, descriptor: AdvisorDescriptor) -> Arc<dyn Advisor> {
        Arc::new(StuckAdvisor { descriptor })
    }

    fn stats(&self) -> AdvisorStats {
        AdvisorStats::default()
    }
}

/// Backend whose writes always fail.
#[derive(Debug)]
struct BrokenBackend;

#[async_trait]
impl MemoryBackend for BrokenBackend {
    async fn append(&self, _record: &MemoryRecord) -> Result<u64> {
        Err(CouncilError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        )))
    }

    async fn load(&self) -> Result<Vec<MemoryRecord>> {
        Ok(Vec::new())
    }

    async fn archive(&self) -> Result<ArchiveReceipt> {
        Err(CouncilError::MemoryAppendFailure("read-only".to_string()))
    }

    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
}

#[tokio::test]
#[traced_test]
async fn reflex_dispatches_one_advisor_end_to_end() {
    let council = council_with(Settings::default()).await;
    let response = council
        .handle(CouncilRequest::new("what time is it in Tokyo", RoutingMode::Reflex))
        .await
        .unwrap();

    assert_eq!(response.status, RouteStatus::Answered);
    assert_eq!(response.trace.decision.selected.len(), 1);
    assert_eq!(response.trace.proposals.len(), 1);
    assert!(response.final_text.unwrap().contains("what time is it in Tokyo"));
}

#[tokio::test]
#[traced_test]
async fn council_mode_only_dispatches_matching_advisors() {
    let council = council_with(Settings::default()).await;
    let response = council
        .handle(CouncilRequest::new(
            "plan the steps and draft an email for the launch",
            RoutingMode::Council,
        ))
        .await
        .unwrap();

    let topics = &response.trace.decision.topics;
    let selected = &response.trace.decision.selected;
    assert!(!selected.is_empty());
    for id in selected {
        let advisor = council.registry().get(id).unwrap();
        assert!(advisor.descriptor().matches_any(topics), "{} does not match {:?}", id, topics);
    }
    assert!(selected.contains(&"alfred".to_string()));
    assert!(selected.contains(&"ops".to_string()));
}

#[tokio::test]
#[traced_test]
async fn timed_out_council_fails_without_touching_the_ledger() {
    let mut settings = Settings::default();
    settings.router.call_timeout_ms = 25;
    let stuck = |id: &str| -> Arc<dyn Advisor> {
        Arc::new(StuckAdvisor {
            descriptor: AdvisorDescriptor::new(id, id, "stuck", &["planning"]),
        })
    };
    let council = Council::assemble(
        settings,
        vec![stuck("north"), stuck("south")],
        Arc::new(InMemoryBackend::new()),
    )
    .await
    .unwrap();

    let response = council
        .handle(CouncilRequest::new("plan the offsite", RoutingMode::Council))
        .await
        .unwrap();

    assert_eq!(response.status, RouteStatus::RoutingFailed);
    assert!(response.trace.proposals.is_empty());
    assert!(response
        .trace
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::Timeout));
    assert!(council.pending_requests().is_empty());
    assert!(council.learning().ledger().is_empty());
    assert_eq!(council.learning().recorded_turns(), 0);

    let turns = council.memory().recent_turns(1).await;
    assert_eq!(turns[0].outcome, OutcomeSignal::Failure);
}

#[tokio::test]
#[traced_test]
async fn recurring_budgeting_spawns_a_mini_agent() {
    let council = council_with(Settings::default()).await;
    struggle_with_budgeting(&council).await;

    let jarvis = council.learning().ledger().get("jarvis", "budgeting").unwrap();
    assert!(jarvis.weight < 0.4);
    assert_eq!(jarvis.attempt_count, 10);

    let report = council.run_maintenance(false).await;
    let record = report.spawned.expect("a budgeting specialist");
    assert_eq!(record.topic, "budgeting");
    assert_eq!(record.cloned_from, "jarvis");

    let clone = council.registry().get(&record.id).unwrap();
    assert!(clone.descriptor().has_capability("budgeting"));
    let entry = council.learning().ledger().get(&record.id, "budgeting").unwrap();
    assert_eq!(entry.attempt_count, 0);
    assert_eq!(entry.weight, 0.5);

    let response = council
        .handle(CouncilRequest::new("budgeting for a wedding", RoutingMode::Auto))
        .await
        .unwrap();
    assert_eq!(response.trace.decision.selected, vec![record.id.clone()]);
}

#[tokio::test]
#[traced_test]
async fn idle_mini_agent_is_retired_and_no_longer_routed() {
    let mut settings = Settings::default();
    settings.nursery.max_idle_turns = 3;
    let council = council_with(settings).await;
    struggle_with_budgeting(&council).await;
    let record = council.run_maintenance(false).await.spawned.unwrap();

    for _ in 0..3 {
        let response = council
            .handle(CouncilRequest::new("hello", RoutingMode::Reflex))
            .await
            .unwrap();
        assert_eq!(response.trace.decision.selected, vec!["jarvis"]);
    }
    let report = council.run_maintenance(true).await;
    assert_eq!(report.retired.len(), 1);
    assert_eq!(report.retired[0].id, record.id);
    assert!(report.spawned.is_none(), "old evidence must not respawn the specialist");
    assert!(!council.registry().is_active(&record.id));
    assert!(council.learning().ledger().get(&record.id, "budgeting").is_none());

    for mode in [RoutingMode::Auto, RoutingMode::Council] {
        let response = council
            .handle(CouncilRequest::new("budgeting for a wedding", mode))
            .await
            .unwrap();
        assert!(!response.trace.decision.selected.contains(&record.id));
    }
}

#[tokio::test]
#[traced_test]
async fn memory_write_failures_do_not_fail_requests() {
    let settings = Settings::default();
    let advisors = AdvisorFactory::roster(&settings.advisors, Arc::new(EchoEngine::new()));
    let council = Council::assemble(settings, advisors, Arc::new(BrokenBackend))
        .await
        .unwrap();

    let response = council
        .handle(CouncilRequest::new("organize my week", RoutingMode::Auto))
        .await
        .unwrap();
    assert!(response.is_answered());

    let receipt = council.feedback(response.request_id, Feedback::Positive).await.unwrap();
    assert_eq!(receipt.signal, OutcomeSignal::Success);
    assert!(council.memory().is_empty().await);

    let err = council.teach("email", "sign with initials", &[]).await.unwrap_err();
    assert!(matches!(err, CouncilError::MemoryAppendFailure(_)));
}

#[tokio::test]
#[traced_test]
async fn canceled_requests_leave_no_trace() {
    let council = council_with(Settings::default()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = council
        .handle_with_cancel(CouncilRequest::new("plan a trip", RoutingMode::Council), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CouncilError::Canceled));
    assert!(council.pending_requests().is_empty());
    assert!(council.memory().is_empty().await);
    assert_eq!(council.nursery().clock(), 0);
}

#[tokio::test]
#[traced_test]
async fn teachings_reach_advisors_and_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.data_dir = dir.path().to_path_buf();
    settings.memory.provider = "sled".to_string();
    settings.persist_state = true;

    {
        let council = council_with(settings.clone()).await;
        council
            .teach("email", "Sign every email with first name only", &[])
            .await
            .unwrap();
        let response = council
            .handle(CouncilRequest::new("write an email to my landlord", RoutingMode::Council))
            .await
            .unwrap();
        council.feedback(response.request_id, Feedback::Rating(0.9)).await.unwrap();
    }

    let council = council_with(settings).await;
    assert_eq!(council.memory().teachings().await.len(), 1);
    assert_eq!(council.memory().recent_turns(10).await.len(), 1);
    assert_eq!(council.learning().recorded_turns(), 1);
    assert!(council.learning().ledger().get("alfred", "email").unwrap().weight > 0.5);

    let context = council
        .memory()
        .retrieve_context("email the landlord again", &["email".to_string()])
        .await;
    assert_eq!(context.teachings.len(), 1);

    let receipt = council.archive_memory().await.unwrap();
    assert_eq!(receipt.records, 3);
    assert!(council.memory().is_empty().await);
}

#[tokio::test]
#[traced_test]
async fn generation_advance_wakes_the_maintenance_task() {
    let mut settings = Settings::default();
    settings.learning.generation_interval = 10;
    let council = Arc::new(council_with(settings).await);
    let maintenance = council.spawn_maintenance();

    struggle_with_budgeting(&council).await;
    assert_eq!(council.learning().generation(), 1);

    let mut spawned = false;
    for _ in 0..50 {
        if !council.nursery().active().is_empty() {
            spawned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(spawned, "maintenance task did not react to the new generation");

    council.shutdown();
    maintenance.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_feedback_never_rolls_back_saved_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.data_dir = dir.path().to_path_buf();
    settings.persist_state = true;
    let council = Arc::new(council_with(settings.clone()).await);

    let mut expected = 0;
    for round in 0..5 {
        let mut ids = Vec::new();
        for i in 0..40 {
            let response = council
                .handle(CouncilRequest::new(
                    format!("review the quarterly report {} {}", round, i),
                    RoutingMode::Reflex,
                ))
                .await
                .unwrap();
            ids.push(response.request_id);
        }

        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let council = council.clone();
                tokio::spawn(async move { council.feedback(id, Feedback::Positive).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        expected += 40;

        let on_disk = EvolutionState::load(&settings.state_path()).unwrap().unwrap();
        assert_eq!(on_disk.recorded_turns, expected, "round {}", round);
        assert_eq!(on_disk.ledger, council.learning().ledger().snapshot());
    }

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}
