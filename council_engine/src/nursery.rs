//! Mini-agent nursery: spots recurring topics the council handles poorly,
//! clones a base advisor specialized on them, and retires clones nobody uses.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::advisor::AdvisorOrigin;
use crate::error::{CouncilError, Result};
use crate::learning::LearningEngine;
use crate::ledger::LedgerSnapshot;
use crate::memory::MemoryTurn;
use crate::registry::AdvisorRegistry;
use crate::settings::NurseryConfig;

/// Id candidates tried per spawn before giving up.
const MAX_ID_PROBES: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiniAgentStatus {
    Active,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetirementPolicy {
    pub max_idle_turns: u64,
    pub max_lifetime_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiniAgentRecord {
    pub id: String,
    pub cloned_from: String,
    pub topic: String,
    pub reason: String,
    pub spawned_at: DateTime<Utc>,
    pub spawned_turn: u64,
    pub last_selected_turn: Option<u64>,
    pub selections: u64,
    pub policy: RetirementPolicy,
    pub status: MiniAgentStatus,
    pub retired_at: Option<DateTime<Utc>>,
}

impl MiniAgentRecord {
    pub fn is_active(&self) -> bool {
        self.status == MiniAgentStatus::Active
    }

    pub fn idle_turns(&self, clock: u64) -> u64 {
        clock.saturating_sub(self.last_selected_turn.unwrap_or(self.spawned_turn))
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.policy
            .max_lifetime_secs
            .is_some_and(|secs| (now - self.spawned_at).num_seconds() >= secs as i64)
    }
}

/// Outcome of a pattern scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpawnDecision {
    pub topic: String,
    pub parent: String,
    pub occurrences: usize,
    pub best_weight: f64,
    pub reason: String,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub spawned: Option<MiniAgentRecord>,
    pub retired: Vec<MiniAgentRecord>,
}

pub struct Nursery {
    registry: Arc<AdvisorRegistry>,
    learning: Arc<LearningEngine>,
    config: NurseryConfig,
    default_advisor: String,
    general_tag: String,
    records: RwLock<Vec<MiniAgentRecord>>,
    clock: AtomicU64,
}

impl Nursery {
    pub fn new(
        registry: Arc<AdvisorRegistry>,
        learning: Arc<LearningEngine>,
        config: NurseryConfig,
        default_advisor: &str,
        general_tag: &str,
    ) -> Self {
        Self {
            registry,
            learning,
            config,
            default_advisor: default_advisor.to_string(),
            general_tag: general_tag.to_string(),
            records: RwLock::new(Vec::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// Routed turns seen so far.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<MiniAgentRecord> {
        self.records.read().clone()
    }

    pub fn active(&self) -> Vec<MiniAgentRecord> {
        self.records.read().iter().filter(|r| r.is_active()).cloned().collect()
    }

    /// Advance the turn clock and mark any selected mini-agents as used.
    pub fn note_selection(&self, selected: &[String]) -> u64 {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let mut records = self.records.write();
        for record in records.iter_mut().filter(|r| r.is_active()) {
            if selected.contains(&record.id) {
                record.last_selected_turn = Some(clock);
                record.selections += 1;
            }
        }
        clock
    }

    /// Look for a recurring topic no specialist covers and the serving
    /// advisors handle poorly.
    #[instrument(skip_all, fields(turns = turns.len()))]
    pub fn scan_for_patterns(&self, turns: &[MemoryTurn], snapshot: &LedgerSnapshot) -> Option<SpawnDecision> {
        if !self.config.enabled {
            return None;
        }
        let active_minis = self.active();
        if active_minis.len() >= self.config.max_active {
            debug!("Mini-agent cap of {} reached, skipping scan", self.config.max_active);
            return None;
        }

        // Turns that led to a since-retired specialist do not count again.
        let mut retired_at: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for record in self.records.read().iter() {
            if let Some(at) = record.retired_at {
                let latest = retired_at.entry(record.topic.clone()).or_insert(at);
                *latest = (*latest).max(at);
            }
        }

        let window = &turns[turns.len().saturating_sub(self.config.window)..];
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut servers: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for turn in window {
            let topics: BTreeSet<&str> = turn.decision.topics.iter().map(String::as_str).collect();
            for topic in topics {
                if topic == self.general_tag || retired_at.get(topic).is_some_and(|at| turn.timestamp <= *at) {
                    continue;
                }
                *counts.entry(topic).or_default() += 1;
                servers
                    .entry(topic)
                    .or_default()
                    .extend(turn.decision.selected.iter().map(String::as_str));
            }
        }

        let descriptors = self.registry.descriptors();
        let mut best: Option<(usize, &str, f64)> = None;
        for (topic, count) in counts {
            if count < self.config.min_occurrences {
                continue;
            }
            let covered = active_minis.iter().any(|r| r.topic == topic)
                || descriptors
                    .iter()
                    .any(|d| d.has_capability(topic) && !d.has_capability(&self.general_tag));
            if covered {
                continue;
            }
            let topic_tags = [topic.to_string()];
            let best_weight = servers[topic]
                .iter()
                .filter_map(|id| snapshot.best_weight(id, &topic_tags))
                .fold(None, |acc: Option<f64>, w| Some(acc.map_or(w, |a| a.max(w))));
            let Some(best_weight) = best_weight else {
                continue;
            };
            if best_weight >= self.config.spawn_weight_ceiling {
                continue;
            }
            // BTreeMap iteration is lexicographic, so strict > keeps the first on ties.
            if best.map_or(true, |(c, _, _)| count > c) {
                best = Some((count, topic, best_weight));
            }
        }

        let (occurrences, topic, best_weight) = best?;
        let parent = self.parent_for(topic, &servers[topic], snapshot)?;
        let reason = format!(
            "'{}' came up in {} of the last {} turns; best serving weight {:.2}",
            topic,
            occurrences,
            window.len(),
            best_weight
        );
        info!("Spawn candidate: {} (parent {})", reason, parent);
        Some(SpawnDecision {
            topic: topic.to_string(),
            parent,
            occurrences,
            best_weight,
            reason,
        })
    }

    fn parent_for(&self, topic: &str, servers: &BTreeSet<&str>, snapshot: &LedgerSnapshot) -> Option<String> {
        let mut parent: Option<(f64, &str)> = None;
        for id in servers {
            let is_base = self
                .registry
                .get(id)
                .is_some_and(|a| a.descriptor().origin == AdvisorOrigin::Base);
            if !is_base {
                continue;
            }
            let weight = snapshot.weight(id, topic).unwrap_or(f64::NEG_INFINITY);
            if parent.map_or(true, |(w, _)| weight > w) {
                parent = Some((weight, *id));
            }
        }

        match parent {
            Some((_, id)) => Some(id.to_string()),
            None if self.registry.is_active(&self.default_advisor) => Some(self.default_advisor.clone()),
            None => {
                warn!("No base advisor available to clone for topic '{}'", topic);
                None
            }
        }
    }

    /// Clone the decision's parent as a specialist for its topic.
    #[instrument(skip(self), fields(parent = %decision.parent, topic = %decision.topic))]
    pub fn spawn(&self, decision: &SpawnDecision) -> Result<MiniAgentRecord> {
        let parent = self
            .registry
            .get(&decision.parent)
            .ok_or_else(|| CouncilError::UnknownAdvisor(decision.parent.clone()))?;

        let mut n = self
            .records
            .read()
            .iter()
            .filter(|r| r.cloned_from == decision.parent)
            .count() as u64;
        let id = loop {
            let id = format!("{}_mini_{}", decision.parent, n);
            let descriptor = parent.descriptor().specialized(&id, &decision.topic);
            match self.registry.register(parent.specialize(descriptor)) {
                Ok(()) => break id,
                Err(CouncilError::DuplicateAdvisor(_)) if n < MAX_ID_PROBES => n += 1,
                Err(e) => return Err(e),
            }
        };

        self.learning.enroll(&id, &decision.topic);
        let record = MiniAgentRecord {
            id: id.clone(),
            cloned_from: decision.parent.clone(),
            topic: decision.topic.clone(),
            reason: decision.reason.clone(),
            spawned_at: Utc::now(),
            spawned_turn: self.clock(),
            last_selected_turn: None,
            selections: 0,
            policy: RetirementPolicy {
                max_idle_turns: self.config.max_idle_turns,
                max_lifetime_secs: self.config.max_lifetime_secs,
            },
            status: MiniAgentStatus::Active,
            retired_at: None,
        };
        self.records.write().push(record.clone());
        info!("Spawned mini-agent {} for '{}'", id, decision.topic);
        Ok(record)
    }

    /// True once the clone has enough history on its topic and its weight
    /// sits under the retirement floor.
    fn underperforming(&self, record: &MiniAgentRecord) -> Option<f64> {
        let entry = self.learning.ledger().get(&record.id, &record.topic)?;
        (entry.attempt_count >= self.config.retire_min_attempts
            && entry.weight < self.config.retire_below_weight)
            .then_some(entry.weight)
    }

    /// Retire every active mini-agent past its idle or lifetime limit, or
    /// performing below the weight floor on its topic.
    pub fn retire_idle(&self) -> Vec<MiniAgentRecord> {
        let clock = self.clock();
        let now = Utc::now();
        let mut retired = Vec::new();

        let mut records = self.records.write();
        for record in records.iter_mut().filter(|r| r.is_active()) {
            let idle = record.idle_turns(clock);
            let cause = if idle >= record.policy.max_idle_turns {
                format!("{} idle turns", idle)
            } else if record.expired(now) {
                "lifetime reached".to_string()
            } else if let Some(weight) = self.underperforming(record) {
                format!("weight {:.2} on '{}'", weight, record.topic)
            } else {
                continue;
            };
            if let Err(e) = self.registry.retire(&record.id) {
                warn!("Mini-agent {} was not in the active pool: {}", record.id, e);
            }
            let archived = self.learning.archive_advisor(&record.id);
            record.status = MiniAgentStatus::Retired;
            record.retired_at = Some(now);
            info!(
                "Retired mini-agent {} ({}; {} ledger entries archived)",
                record.id, cause, archived
            );
            retired.push(record.clone());
        }
        retired
    }

    /// One scan-and-spawn pass, plus retirement when asked.
    pub fn maintain(&self, turns: &[MemoryTurn], snapshot: &LedgerSnapshot, retire: bool) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if retire {
            report.retired = self.retire_idle();
        }
        if let Some(decision) = self.scan_for_patterns(turns, snapshot) {
            match self.spawn(&decision) {
                Ok(record) => report.spawned = Some(record),
                Err(e) => warn!("Mini-agent spawn for '{}' failed: {}", decision.topic, e),
            }
        }
        report
    }

    /// Reinstate persisted records. Active clones are registered again from
    /// their parents; clones whose parent is gone are retired.
    pub fn restore(&self, records: Vec<MiniAgentRecord>, clock: u64) {
        self.clock.store(clock, Ordering::SeqCst);
        let mut restored = Vec::with_capacity(records.len());
        for mut record in records {
            if record.is_active() {
                let revived = self.registry.get(&record.cloned_from).map(|parent| {
                    let descriptor = parent.descriptor().specialized(&record.id, &record.topic);
                    self.registry.register(parent.specialize(descriptor))
                });
                match revived {
                    Some(Ok(())) => debug!("Restored mini-agent {}", record.id),
                    Some(Err(e)) => warn!("Could not restore mini-agent {}: {}", record.id, e),
                    None => {
                        warn!(
                            "Parent {} of mini-agent {} is gone, retiring it",
                            record.cloned_from, record.id
                        );
                        self.learning.archive_advisor(&record.id);
                        record.status = MiniAgentStatus::Retired;
                        record.retired_at = Some(Utc::now());
                    }
                }
            }
            restored.push(record);
        }
        *self.records.write() = restored;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{Advisor, AdvisorDescriptor, EngineAdvisor, Proposal};
    use crate::engine::EchoEngine;
    use crate::ledger::ProficiencyEntry;
    use crate::learning::OutcomeSignal;
    use crate::router::{RoutingDecision, RoutingMode, Trace};
    use crate::settings::LearningConfig;
    use uuid::Uuid;

    fn advisor(id: &str, caps: &[&str]) -> Arc<dyn Advisor> {
        Arc::new(EngineAdvisor::new(
            AdvisorDescriptor::new(id, id, "test", caps),
            Arc::new(EchoEngine::new()),
        ))
    }

    fn setup(config: NurseryConfig) -> (Nursery, Arc<AdvisorRegistry>, Arc<LearningEngine>) {
        let registry = Arc::new(
            AdvisorRegistry::with_advisors(vec![
                advisor("jarvis", &["general", "system"]),
                advisor("ops", &["ops", "planning"]),
            ])
            .unwrap(),
        );
        let learning = Arc::new(LearningEngine::new(LearningConfig::default(), "general"));
        let nursery = Nursery::new(registry.clone(), learning.clone(), config, "jarvis", "general");
        (nursery, registry, learning)
    }

    fn turn(topics: &[&str], selected: &[&str]) -> MemoryTurn {
        let request_id = Uuid::new_v4();
        MemoryTurn {
            request_id,
            request: topics.join(" "),
            response: "ok".to_string(),
            decision: RoutingDecision {
                request_id,
                mode: RoutingMode::Auto,
                topics: topics.iter().map(|t| t.to_string()).collect(),
                selected: selected.iter().map(|s| s.to_string()).collect(),
                weights: BTreeMap::new(),
                rationale: "test".to_string(),
            },
            outcome: OutcomeSignal::Failure,
            timestamp: Utc::now(),
            teachings_used: Vec::new(),
        }
    }

    fn weak_snapshot() -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot::default();
        snapshot.insert("jarvis", "budgeting", ProficiencyEntry::neutral(0.2));
        snapshot
    }

    #[test]
    fn recurring_weak_topic_spawns_a_specialist() {
        let (nursery, registry, learning) = setup(NurseryConfig::default());
        let turns: Vec<MemoryTurn> = (0..10).map(|_| turn(&["budgeting"], &["jarvis"])).collect();

        let decision = nursery.scan_for_patterns(&turns, &weak_snapshot()).unwrap();
        assert_eq!(decision.topic, "budgeting");
        assert_eq!(decision.parent, "jarvis");
        assert_eq!(decision.occurrences, 10);

        let record = nursery.spawn(&decision).unwrap();
        assert_eq!(record.id, "jarvis_mini_0");
        let clone = registry.get("jarvis_mini_0").unwrap();
        assert!(clone.descriptor().has_capability("budgeting"));
        assert!(clone.descriptor().is_mini_agent());
        let entry = learning.ledger().get("jarvis_mini_0", "budgeting").unwrap();
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.weight, 0.5);

        // Covered now, so the next scan is quiet.
        assert!(nursery.scan_for_patterns(&turns, &weak_snapshot()).is_none());
    }

    #[test]
    fn covered_rare_or_healthy_topics_do_not_spawn() {
        let (nursery, _, _) = setup(NurseryConfig::default());

        let planning: Vec<MemoryTurn> = (0..10).map(|_| turn(&["planning"], &["jarvis"])).collect();
        let mut snapshot = LedgerSnapshot::default();
        snapshot.insert("jarvis", "planning", ProficiencyEntry::neutral(0.1));
        assert!(nursery.scan_for_patterns(&planning, &snapshot).is_none());

        let rare: Vec<MemoryTurn> = (0..5).map(|_| turn(&["budgeting"], &["jarvis"])).collect();
        assert!(nursery.scan_for_patterns(&rare, &weak_snapshot()).is_none());

        let healthy: Vec<MemoryTurn> = (0..10).map(|_| turn(&["budgeting"], &["jarvis"])).collect();
        let mut snapshot = LedgerSnapshot::default();
        snapshot.insert("jarvis", "budgeting", ProficiencyEntry::neutral(0.7));
        assert!(nursery.scan_for_patterns(&healthy, &snapshot).is_none());
    }

    #[test]
    fn idle_mini_agents_are_retired_and_archived() {
        let config = NurseryConfig {
            max_idle_turns: 3,
            ..NurseryConfig::default()
        };
        let (nursery, registry, learning) = setup(config);
        let turns: Vec<MemoryTurn> = (0..10).map(|_| turn(&["budgeting"], &["jarvis"])).collect();
        let decision = nursery.scan_for_patterns(&turns, &weak_snapshot()).unwrap();
        nursery.spawn(&decision).unwrap();

        nursery.note_selection(&["jarvis_mini_0".to_string()]);
        nursery.note_selection(&["jarvis".to_string()]);
        nursery.note_selection(&["jarvis".to_string()]);
        assert!(nursery.retire_idle().is_empty());

        nursery.note_selection(&["jarvis".to_string()]);
        let retired = nursery.retire_idle();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].status, MiniAgentStatus::Retired);
        assert_eq!(retired[0].selections, 1);
        assert!(!registry.is_active("jarvis_mini_0"));
        assert!(learning.ledger().get("jarvis_mini_0", "budgeting").is_none());
        assert_eq!(learning.ledger().archived_entries("jarvis_mini_0").len(), 1);
    }

    fn spawn_budgeting(nursery: &Nursery) -> MiniAgentRecord {
        let turns: Vec<MemoryTurn> = (0..10).map(|_| turn(&["budgeting"], &["jarvis"])).collect();
        let decision = nursery.scan_for_patterns(&turns, &weak_snapshot()).unwrap();
        nursery.spawn(&decision).unwrap()
    }

    fn clone_trace(id: &str) -> Trace {
        let request_id = Uuid::new_v4();
        Trace {
            decision: RoutingDecision {
                request_id,
                mode: RoutingMode::Auto,
                topics: vec!["budgeting".to_string()],
                selected: vec![id.to_string()],
                weights: BTreeMap::new(),
                rationale: "test".to_string(),
            },
            proposals: vec![Proposal {
                advisor_id: id.to_string(),
                capabilities: vec!["budgeting".to_string()],
                text: "ok".to_string(),
                confidence: None,
                latency_ms: 1,
            }],
            failures: vec![],
        }
    }

    #[test]
    fn expired_mini_agents_are_retired() {
        let config = NurseryConfig {
            max_lifetime_secs: Some(0),
            ..NurseryConfig::default()
        };
        let (nursery, registry, _) = setup(config);
        let record = spawn_budgeting(&nursery);
        assert_eq!(record.policy.max_lifetime_secs, Some(0));

        let retired = nursery.retire_idle();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].idle_turns(nursery.clock()), 0);
        assert!(!registry.is_active(&record.id));
    }

    #[test]
    fn poorly_performing_mini_agents_are_retired() {
        let (nursery, registry, learning) = setup(NurseryConfig::default());
        let record = spawn_budgeting(&nursery);
        let trace = clone_trace(&record.id);

        for _ in 0..4 {
            learning.record_outcome(&trace, OutcomeSignal::Failure).unwrap();
        }
        // Weight is already low, but there is not enough history yet.
        assert!(learning.ledger().get(&record.id, "budgeting").unwrap().weight < 0.3);
        assert!(nursery.retire_idle().is_empty());

        learning.record_outcome(&trace, OutcomeSignal::Failure).unwrap();
        let retired = nursery.retire_idle();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].id, record.id);
        assert!(!registry.is_active(&record.id));
        assert_eq!(learning.ledger().archived_entries(&record.id).len(), 1);
    }

    #[test]
    fn healthy_mini_agents_stay_active() {
        let (nursery, _, learning) = setup(NurseryConfig::default());
        let record = spawn_budgeting(&nursery);
        let trace = clone_trace(&record.id);
        for _ in 0..6 {
            learning.record_outcome(&trace, OutcomeSignal::Success).unwrap();
        }
        assert!(nursery.retire_idle().is_empty());
        assert_eq!(nursery.active().len(), 1);
    }

    #[test]
    fn active_cap_blocks_new_spawns() {
        let config = NurseryConfig {
            max_active: 1,
            ..NurseryConfig::default()
        };
        let (nursery, _, _) = setup(config);
        let mut turns: Vec<MemoryTurn> = (0..6).map(|_| turn(&["budgeting"], &["jarvis"])).collect();
        turns.extend((0..6).map(|_| turn(&["gardening"], &["jarvis"])));
        let mut snapshot = weak_snapshot();
        snapshot.insert("jarvis", "gardening", ProficiencyEntry::neutral(0.1));

        let first = nursery.maintain(&turns, &snapshot, false);
        assert_eq!(first.spawned.unwrap().topic, "budgeting");
        let second = nursery.maintain(&turns, &snapshot, false);
        assert!(second.spawned.is_none());
    }

    #[test]
    fn restore_re_registers_active_clones() {
        let (nursery, _, _) = setup(NurseryConfig::default());
        let turns: Vec<MemoryTurn> = (0..10).map(|_| turn(&["budgeting"], &["jarvis"])).collect();
        let decision = nursery.scan_for_patterns(&turns, &weak_snapshot()).unwrap();
        nursery.spawn(&decision).unwrap();
        let saved = nursery.records();

        let (fresh, registry, _) = setup(NurseryConfig::default());
        fresh.restore(saved, 42);
        assert_eq!(fresh.clock(), 42);
        assert!(registry.is_active("jarvis_mini_0"));
        assert_eq!(fresh.active().len(), 1);
    }
}
