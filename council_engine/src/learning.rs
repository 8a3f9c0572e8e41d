//! Outcome signals and the learning engine that turns them into ledger
//! updates and generation ticks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CouncilError, Result};
use crate::ledger::{LedgerSnapshot, ProficiencyEntry, ProficiencyLedger};
use crate::memory::Reflection;
use crate::router::Trace;
use crate::settings::LearningConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeSignal {
    Success,
    Neutral,
    Failure,
}

impl OutcomeSignal {
    fn observation(self, neutral_target: f64) -> f64 {
        match self {
            OutcomeSignal::Success => 1.0,
            OutcomeSignal::Failure => 0.0,
            OutcomeSignal::Neutral => neutral_target,
        }
    }
}

impl fmt::Display for OutcomeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeSignal::Success => "success",
            OutcomeSignal::Neutral => "neutral",
            OutcomeSignal::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// Where an outcome signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Explicit,
    Heuristic,
}

const POSITIVE_WORDS: &[&str] = &[
    "thank", "thanks", "great", "awesome", "good", "love", "perfect", "helpful", "nice", "correct",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "wrong", "hate", "useless", "unhelpful", "error", "fail", "failed", "incorrect", "broken",
];

/// User feedback on a finished turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Positive,
    Negative,
    /// Rating in `[0, 1]`.
    Rating(f64),
    Text(String),
}

impl Feedback {
    pub fn signal(&self) -> OutcomeSignal {
        match self {
            Feedback::Positive => OutcomeSignal::Success,
            Feedback::Negative => OutcomeSignal::Failure,
            Feedback::Rating(r) if *r >= 0.6 => OutcomeSignal::Success,
            Feedback::Rating(r) if *r <= 0.4 => OutcomeSignal::Failure,
            Feedback::Rating(_) => OutcomeSignal::Neutral,
            Feedback::Text(text) => text_valence(text),
        }
    }

    /// Read user input: a number is a rating (values above 1 are taken as
    /// stars out of 5), anything else is free text.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        match input.parse::<f64>() {
            Ok(r) if r > 1.0 => Feedback::Rating((r / 5.0).min(1.0)),
            Ok(r) => Feedback::Rating(r.max(0.0)),
            Err(_) => Feedback::Text(input.to_string()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Feedback::Positive => "positive".to_string(),
            Feedback::Negative => "negative".to_string(),
            Feedback::Rating(r) => format!("rating {:.2}", r),
            Feedback::Text(text) => text.clone(),
        }
    }
}

fn text_valence(text: &str) -> OutcomeSignal {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let negated = words.iter().any(|w| *w == "not" || *w == "no");
    let positive = words.iter().filter(|w| POSITIVE_WORDS.contains(*w)).count() as i64;
    let negative = words.iter().filter(|w| NEGATIVE_WORDS.contains(*w)).count() as i64;

    let score = if negated { negative - positive } else { positive - negative };
    match score.cmp(&0) {
        std::cmp::Ordering::Greater => OutcomeSignal::Success,
        std::cmp::Ordering::Less => OutcomeSignal::Failure,
        std::cmp::Ordering::Equal => OutcomeSignal::Neutral,
    }
}

/// Pick the signal for a turn: explicit feedback, then the latest
/// reflection on the request, then neutral.
pub fn derive_signal(
    explicit: Option<&Feedback>,
    latest_reflection: Option<&Reflection>,
) -> (OutcomeSignal, SignalSource) {
    if let Some(feedback) = explicit {
        return (feedback.signal(), SignalSource::Explicit);
    }
    if let Some(reflection) = latest_reflection {
        return (reflection.signal, reflection.source);
    }
    (OutcomeSignal::Neutral, SignalSource::Heuristic)
}

/// What one `record_outcome` call changed.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeReceipt {
    pub request_id: Uuid,
    pub signal: OutcomeSignal,
    pub updated: Vec<(String, String, f64)>,
    /// Pairs dropped after exhausting write attempts.
    pub conflicts: Vec<(String, String)>,
    pub generation: u64,
    pub generation_advanced: bool,
}

/// Sole writer of the proficiency ledger.
pub struct LearningEngine {
    ledger: Arc<ProficiencyLedger>,
    config: LearningConfig,
    general_tag: String,
    recorded_turns: AtomicU64,
    generation: AtomicU64,
    generation_changed: Arc<Notify>,
}

impl LearningEngine {
    pub fn new(config: LearningConfig, general_tag: &str) -> Self {
        let ledger = ProficiencyLedger::new(config.initial_weight, config.max_write_attempts);
        Self::with_ledger(Arc::new(ledger), config, general_tag, 0, 0)
    }

    pub fn with_ledger(
        ledger: Arc<ProficiencyLedger>,
        config: LearningConfig,
        general_tag: &str,
        generation: u64,
        recorded_turns: u64,
    ) -> Self {
        Self {
            ledger,
            config,
            general_tag: general_tag.to_string(),
            recorded_turns: AtomicU64::new(recorded_turns),
            generation: AtomicU64::new(generation),
            generation_changed: Arc::new(Notify::new()),
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    pub fn ledger(&self) -> &ProficiencyLedger {
        &self.ledger
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn recorded_turns(&self) -> u64 {
        self.recorded_turns.load(Ordering::SeqCst)
    }

    /// Woken once per generation advance.
    pub fn generation_notifier(&self) -> Arc<Notify> {
        self.generation_changed.clone()
    }

    /// Apply `signal` to every (contributing advisor, topic) pair of `trace`.
    #[instrument(skip(self, trace), fields(request_id = %trace.decision.request_id))]
    pub fn record_outcome(&self, trace: &Trace, signal: OutcomeSignal) -> Result<OutcomeReceipt> {
        self.record_with(trace, signal, |entry| next_entry(entry, signal, &self.config))
    }

    fn record_with<F>(&self, trace: &Trace, signal: OutcomeSignal, update: F) -> Result<OutcomeReceipt>
    where
        F: Fn(&ProficiencyEntry) -> ProficiencyEntry,
    {
        if trace.proposals.is_empty() {
            return Err(CouncilError::RoutingFailed {
                request_id: trace.decision.request_id.to_string(),
            });
        }

        let topics: Vec<String> = if trace.decision.topics.is_empty() {
            vec![self.general_tag.clone()]
        } else {
            trace.decision.topics.clone()
        };

        let mut advisors: Vec<&str> = trace.proposals.iter().map(|p| p.advisor_id.as_str()).collect();
        advisors.sort_unstable();
        advisors.dedup();

        let mut updated = Vec::with_capacity(advisors.len() * topics.len());
        let mut conflicts = Vec::new();
        for advisor in &advisors {
            for topic in &topics {
                match self.ledger.apply(advisor, topic, &update) {
                    Ok(entry) => updated.push((advisor.to_string(), topic.clone(), entry.weight)),
                    Err(e) => {
                        warn!("Dropping ledger update: {}", e);
                        conflicts.push((advisor.to_string(), topic.clone()));
                    }
                }
            }
        }

        let turns = self.recorded_turns.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = self.config.generation_interval.max(1);
        let generation_advanced = turns % interval == 0;
        let generation = if generation_advanced {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!("Evolution generation advanced to {}", generation);
            self.generation_changed.notify_one();
            generation
        } else {
            self.generation()
        };

        debug!(%signal, pairs = updated.len(), "outcome recorded");
        Ok(OutcomeReceipt {
            request_id: trace.decision.request_id,
            signal,
            updated,
            conflicts,
            generation,
            generation_advanced,
        })
    }

    /// Give a new advisor a neutral entry for `topic`.
    pub fn enroll(&self, advisor: &str, topic: &str) -> ProficiencyEntry {
        self.ledger.enroll(advisor, topic)
    }

    pub fn archive_advisor(&self, advisor: &str) -> usize {
        self.ledger.archive_advisor(advisor)
    }
}

/// Exponential moving average toward the observation. Neutral outcomes pull
/// toward the neutral target at a reduced rate.
pub fn next_entry(entry: &ProficiencyEntry, signal: OutcomeSignal, config: &LearningConfig) -> ProficiencyEntry {
    let rate = match signal {
        OutcomeSignal::Neutral => config.smoothing_rate * config.neutral_scale,
        _ => config.smoothing_rate,
    };
    let observation = signal.observation(config.neutral_target);

    let mut next = entry.clone();
    next.attempt_count += 1;
    if signal == OutcomeSignal::Success {
        next.success_count += 1;
    }
    next.weight = (entry.weight + rate * (observation - entry.weight)).clamp(0.0, 1.0);
    next.last_used = Some(chrono::Utc::now());
    next
}
