//! The council: wires the router, learning engine, memory and nursery into
//! one request/feedback cycle and runs background maintenance.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    advisor::{Advisor, AdvisorDescriptor, AdvisorFactory, AdvisorStats},
    engine::TextEngine,
    error::{CouncilError, Result},
    learning::{derive_signal, Feedback, LearningEngine, OutcomeReceipt, OutcomeSignal, SignalSource},
    ledger::{LedgerSnapshot, ProficiencyEntry, ProficiencyLedger},
    memory::{
        ArchiveReceipt, InMemoryBackend, MemoryBackend, MemoryStats, MemoryStore, MemoryTurn, Reflection,
        SledBackend, Teaching,
    },
    nursery::{MaintenanceReport, MiniAgentRecord, Nursery},
    ranking::HeuristicRanker,
    registry::AdvisorRegistry,
    router::{CouncilRequest, CouncilResponse, CouncilRouter, RouteStatus},
    settings::Settings,
    synthesizer::Synthesizer,
    topics::TopicExtractor,
};

/// Everything learned so far, persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionState {
    pub generation: u64,
    pub recorded_turns: u64,
    pub turn_clock: u64,
    pub ledger: LedgerSnapshot,
    pub archived: LedgerSnapshot,
    pub mini_agents: Vec<MiniAgentRecord>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl EvolutionState {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        let state = serde_json::from_str(&raw)
            .map_err(|e| CouncilError::State(format!("{}: {}", path.display(), e)))?;
        Ok(Some(state))
    }

    /// Write through a uniquely named temporary file, then rename over
    /// `path`. A crash never leaves half a state behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        let written = std::fs::write(&tmp, serde_json::to_string_pretty(self)?)
            .and_then(|()| std::fs::rename(&tmp, path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// One advisor as shown by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisorStatus {
    pub descriptor: AdvisorDescriptor,
    pub stats: AdvisorStats,
    pub proficiency: BTreeMap<String, ProficiencyEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CouncilStatus {
    pub generation: u64,
    pub recorded_turns: u64,
    pub turn_clock: u64,
    pub pending_feedback: usize,
    pub advisors: Vec<AdvisorStatus>,
    pub mini_agents: Vec<MiniAgentRecord>,
    pub retired_advisors: Vec<AdvisorDescriptor>,
    pub memory: MemoryStats,
}

/// An answered turn waiting for its outcome.
struct PendingTurn {
    request: CouncilRequest,
    response: CouncilResponse,
    teachings_used: Vec<Uuid>,
    answered_at: Instant,
}

pub struct Council {
    settings: Settings,
    registry: Arc<AdvisorRegistry>,
    router: CouncilRouter,
    learning: Arc<LearningEngine>,
    nursery: Nursery,
    memory: MemoryStore,
    pending: Mutex<BTreeMap<Uuid, PendingTurn>>,
    /// Held while a state snapshot is taken and written.
    save_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Council {
    /// Build the council from settings, opening the configured memory backend.
    #[instrument(skip_all)]
    pub async fn new(settings: Settings, engine: Arc<dyn TextEngine>) -> Result<Self> {
        let backend: Arc<dyn MemoryBackend> = match settings.memory.provider.as_str() {
            "sled" => Arc::new(SledBackend::open(&settings.memory_path())?),
            _ => Arc::new(InMemoryBackend::new()),
        };
        let advisors = AdvisorFactory::roster(&settings.advisors, engine);
        Self::assemble(settings, advisors, backend).await
    }

    /// Build the council from prepared advisors and a memory backend.
    pub async fn assemble(
        settings: Settings,
        advisors: Vec<Arc<dyn Advisor>>,
        backend: Arc<dyn MemoryBackend>,
    ) -> Result<Self> {
        let state = if settings.persist_state {
            EvolutionState::load(&settings.state_path())?
        } else {
            None
        };
        let state = state.unwrap_or_default();

        let registry = Arc::new(AdvisorRegistry::with_advisors(advisors)?);
        let ledger = ProficiencyLedger::restore(
            settings.learning.initial_weight,
            settings.learning.max_write_attempts,
            &state.ledger,
            &state.archived,
        );
        let learning = Arc::new(LearningEngine::with_ledger(
            Arc::new(ledger),
            settings.learning.clone(),
            &settings.router.general_tag,
            state.generation,
            state.recorded_turns,
        ));

        let router = CouncilRouter::new(
            registry.clone(),
            Arc::new(HeuristicRanker::new(
                settings.learning.initial_weight,
                &settings.router.general_tag,
            )),
            Synthesizer::new(&settings.synthesis),
            TopicExtractor::new(settings.topics.clone()),
            settings.router.clone(),
            settings.learning.initial_weight,
        );

        let nursery = Nursery::new(
            registry.clone(),
            learning.clone(),
            settings.nursery.clone(),
            &settings.router.default_advisor,
            &settings.router.general_tag,
        );
        nursery.restore(state.mini_agents, state.turn_clock);

        let memory = MemoryStore::open(backend, settings.memory.clone()).await?;

        info!(
            "Council ready: {} advisors, generation {}",
            registry.len(),
            learning.generation()
        );
        Ok(Self {
            settings,
            registry,
            router,
            learning,
            nursery,
            memory,
            pending: Mutex::new(BTreeMap::new()),
            save_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<AdvisorRegistry> {
        &self.registry
    }

    pub fn learning(&self) -> &Arc<LearningEngine> {
        &self.learning
    }

    pub fn nursery(&self) -> &Nursery {
        &self.nursery
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub async fn handle(&self, request: CouncilRequest) -> Result<CouncilResponse> {
        let cancel = self.shutdown.child_token();
        self.handle_with_cancel(request, &cancel).await
    }

    /// Route one request. Answered turns wait for feedback; failed ones are
    /// written to memory straight away and never reach the ledger.
    #[instrument(skip_all, fields(request_id = %request.id, mode = %request.mode))]
    pub async fn handle_with_cancel(
        &self,
        request: CouncilRequest,
        cancel: &CancellationToken,
    ) -> Result<CouncilResponse> {
        self.settle_expired().await;

        let topics = self.router.infer_topics(&request.text);
        let context = self.memory.retrieve_context(&request.text, &topics).await;
        let snapshot = self.learning.snapshot();
        let response = self
            .router
            .route(&request, &topics, &context, &snapshot, cancel)
            .await?;

        self.nursery.note_selection(&response.trace.decision.selected);
        let teachings_used: Vec<Uuid> = context.teachings.iter().map(|t| t.id).collect();

        match response.status {
            RouteStatus::RoutingFailed => {
                let turn = MemoryTurn {
                    request_id: request.id,
                    request: request.text.clone(),
                    response: String::new(),
                    decision: response.trace.decision.clone(),
                    outcome: OutcomeSignal::Failure,
                    timestamp: Utc::now(),
                    teachings_used,
                };
                self.append_turn_logged(turn).await;
            }
            RouteStatus::Answered => {
                self.pending.lock().insert(
                    request.id,
                    PendingTurn {
                        request,
                        response: response.clone(),
                        teachings_used,
                        answered_at: Instant::now(),
                    },
                );
            }
        }
        Ok(response)
    }

    /// Apply explicit feedback to an answered turn and settle it.
    #[instrument(skip(self, feedback))]
    pub async fn feedback(&self, request_id: Uuid, feedback: Feedback) -> Result<OutcomeReceipt> {
        let pending = self
            .pending
            .lock()
            .remove(&request_id)
            .ok_or_else(|| CouncilError::UnknownRequest(request_id.to_string()))?;

        let reflection = Reflection {
            request_id,
            signal: feedback.signal(),
            source: SignalSource::Explicit,
            note: feedback.describe(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.memory.append_reflection(reflection).await {
            warn!("Could not store feedback reflection: {}", e);
        }
        self.settle(pending, Some(&feedback)).await
    }

    /// Record a heuristic judgement on a turn that is still pending. It is
    /// used as the outcome if no explicit feedback arrives.
    pub async fn reflect(&self, request_id: Uuid, signal: OutcomeSignal, note: &str) -> Result<()> {
        if !self.pending.lock().contains_key(&request_id) {
            return Err(CouncilError::UnknownRequest(request_id.to_string()));
        }
        self.memory
            .append_reflection(Reflection {
                request_id,
                signal,
                source: SignalSource::Heuristic,
                note: note.to_string(),
                created_at: Utc::now(),
            })
            .await
    }

    pub fn pending_requests(&self) -> Vec<Uuid> {
        self.pending.lock().keys().copied().collect()
    }

    /// Settle every pending turn without explicit feedback.
    pub async fn settle_all(&self) -> Vec<OutcomeReceipt> {
        let drained: Vec<PendingTurn> = std::mem::take(&mut *self.pending.lock()).into_values().collect();
        self.settle_many(drained).await
    }

    /// Settle pending turns whose feedback window has passed.
    pub async fn settle_expired(&self) -> Vec<OutcomeReceipt> {
        let window = Duration::from_secs(self.settings.learning.feedback_window_secs);
        let expired: Vec<PendingTurn> = {
            let mut pending = self.pending.lock();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, turn)| turn.answered_at.elapsed() >= window)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        self.settle_many(expired).await
    }

    async fn settle_many(&self, turns: Vec<PendingTurn>) -> Vec<OutcomeReceipt> {
        let mut receipts = Vec::with_capacity(turns.len());
        for turn in turns {
            let request_id = turn.request.id;
            match self.settle(turn, None).await {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => error!("Failed to settle request {}: {}", request_id, e),
            }
        }
        receipts
    }

    async fn settle(&self, turn: PendingTurn, explicit: Option<&Feedback>) -> Result<OutcomeReceipt> {
        let latest = if explicit.is_some() {
            None
        } else {
            self.memory.latest_reflection(turn.request.id).await
        };
        let (signal, source) = derive_signal(explicit, latest.as_ref());
        debug!(%signal, ?source, "settling turn");

        let receipt = self.learning.record_outcome(&turn.response.trace, signal)?;

        let memory_turn = MemoryTurn {
            request_id: turn.request.id,
            request: turn.request.text,
            response: turn.response.final_text.unwrap_or_default(),
            decision: turn.response.trace.decision,
            outcome: signal,
            timestamp: Utc::now(),
            teachings_used: turn.teachings_used,
        };
        self.append_turn_logged(memory_turn).await;
        self.persist().await;
        Ok(receipt)
    }

    async fn append_turn_logged(&self, turn: MemoryTurn) {
        let request_id = turn.request_id;
        if let Err(e) = self.memory.append_turn(turn).await {
            error!("Memory append for request {} failed, continuing: {}", request_id, e);
        }
    }

    pub async fn teach(&self, topic: &str, instruction: &str, tags: &[String]) -> Result<Teaching> {
        let teaching = Teaching::new(topic, instruction, tags);
        self.memory.add_teaching(teaching.clone()).await?;
        info!("Learned teaching on '{}'", teaching.topic);
        Ok(teaching)
    }

    pub async fn archive_memory(&self) -> Result<ArchiveReceipt> {
        self.memory.archive().await
    }

    /// Scan recent memory for spawn candidates; retire idle mini-agents when
    /// `retire` is set.
    pub async fn run_maintenance(&self, retire: bool) -> MaintenanceReport {
        let turns = self.memory.recent_turns(self.settings.nursery.window).await;
        let snapshot = self.learning.snapshot();
        let report = self.nursery.maintain(&turns, &snapshot, retire);
        if report.spawned.is_some() || !report.retired.is_empty() {
            self.persist().await;
        }
        report
    }

    /// Start the background maintenance loop. It wakes on every generation
    /// advance and on the configured interval, and stops on [`Council::shutdown`].
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let council = self.clone();
        let generation = self.learning.generation_notifier();
        let period = Duration::from_secs(self.settings.nursery.scan_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = council.shutdown.cancelled() => {
                        debug!("Maintenance loop stopping");
                        break;
                    }
                    _ = generation.notified() => {
                        let report = council.run_maintenance(true).await;
                        debug!(retired = report.retired.len(), "generation maintenance done");
                    }
                    _ = interval.tick() => {
                        council.settle_expired().await;
                        council.run_maintenance(false).await;
                    }
                }
            }
        })
    }

    /// Cancel in-flight requests and stop background work.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn status(&self) -> CouncilStatus {
        let memory = self.memory.stats().await;
        let snapshot = self.learning.snapshot();
        let advisors = self
            .registry
            .active()
            .into_iter()
            .map(|advisor| AdvisorStatus {
                descriptor: advisor.descriptor().clone(),
                stats: advisor.stats(),
                proficiency: snapshot.entries.get(advisor.id()).cloned().unwrap_or_default(),
            })
            .collect();

        CouncilStatus {
            generation: self.learning.generation(),
            recorded_turns: self.learning.recorded_turns(),
            turn_clock: self.nursery.clock(),
            pending_feedback: self.pending.lock().len(),
            advisors,
            mini_agents: self.nursery.records(),
            retired_advisors: self.registry.retired(),
            memory,
        }
    }

    pub fn evolution_state(&self) -> EvolutionState {
        let ledger = self.learning.ledger();
        EvolutionState {
            generation: self.learning.generation(),
            recorded_turns: self.learning.recorded_turns(),
            turn_clock: self.nursery.clock(),
            ledger: ledger.snapshot(),
            archived: ledger.archived_snapshot(),
            mini_agents: self.nursery.records(),
            saved_at: Some(Utc::now()),
        }
    }

    /// Snapshot and write the evolution state. Saves are serialized and the
    /// snapshot is taken under the lock, so the file never goes backwards.
    pub async fn save_state(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let state = self.evolution_state();
        let path = self.settings.state_path();
        let target = path.clone();
        tokio::task::spawn_blocking(move || state.save(&target))
            .await
            .map_err(|e| CouncilError::State(format!("state writer task failed: {}", e)))??;
        debug!("Evolution state saved to {:?}", path);
        Ok(())
    }

    async fn persist(&self) {
        if !self.settings.persist_state {
            return;
        }
        if let Err(e) = self.save_state().await {
            error!("Failed to save evolution state: {}", e);
        }
    }
}
