//! Council router: advisor selection per routing mode and concurrent dispatch.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::advisor::{Advisor, Proposal};
use crate::error::{CouncilError, Result};
use crate::ledger::LedgerSnapshot;
use crate::memory::RetrievedContext;
use crate::ranking::{RankRequest, Ranker};
use crate::registry::AdvisorRegistry;
use crate::settings::RouterConfig;
use crate::synthesizer::Synthesizer;
use crate::topics::TopicExtractor;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Ledger-ranked top advisors
    #[default]
    Auto,
    /// One general-purpose advisor
    Reflex,
    /// Every advisor matching the request's topics
    Council,
    /// Strategy, architecture and analysis advisors
    Strategic,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutingMode::Auto => "auto",
            RoutingMode::Reflex => "reflex",
            RoutingMode::Council => "council",
            RoutingMode::Strategic => "strategic",
        };
        f.write_str(name)
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(RoutingMode::Auto),
            "reflex" => Ok(RoutingMode::Reflex),
            "council" => Ok(RoutingMode::Council),
            "strategic" => Ok(RoutingMode::Strategic),
            other => Err(format!("unknown routing mode '{}'", other)),
        }
    }
}

/// A request as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilRequest {
    pub id: Uuid,
    pub text: String,
    pub mode: RoutingMode,
    #[serde(default)]
    pub advisor_override: Option<String>,
}

impl CouncilRequest {
    pub fn new(text: impl Into<String>, mode: RoutingMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            mode,
            advisor_override: None,
        }
    }

    pub fn with_override(mut self, advisor: impl Into<String>) -> Self {
        self.advisor_override = Some(advisor.into());
        self
    }
}

/// Which advisors were chosen and why. Never changed after dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: Uuid,
    pub mode: RoutingMode,
    pub topics: Vec<String>,
    pub selected: Vec<String>,
    pub weights: BTreeMap<String, f64>,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Timeout,
    Failure,
}

/// A dispatched advisor that produced nothing usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorFailureRecord {
    pub advisor_id: String,
    pub kind: FailureKind,
    pub reason: String,
    pub latency_ms: u64,
}

/// Decision plus everything dispatch produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    pub decision: RoutingDecision,
    pub proposals: Vec<Proposal>,
    pub failures: Vec<AdvisorFailureRecord>,
}

impl Trace {
    pub fn contributors(&self) -> Vec<String> {
        self.proposals.iter().map(|p| p.advisor_id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Answered,
    RoutingFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CouncilResponse {
    pub request_id: Uuid,
    pub status: RouteStatus,
    pub final_text: Option<String>,
    /// Follow-up steps the planning advisors proposed.
    pub actions: Vec<String>,
    pub trace: Trace,
}

impl CouncilResponse {
    pub fn is_answered(&self) -> bool {
        self.status == RouteStatus::Answered
    }
}

/// Selects advisors for a request and fans the request out to them.
pub struct CouncilRouter {
    registry: Arc<AdvisorRegistry>,
    ranker: Arc<dyn Ranker>,
    synthesizer: Synthesizer,
    topics: TopicExtractor,
    config: RouterConfig,
    initial_weight: f64,
}

impl CouncilRouter {
    pub fn new(
        registry: Arc<AdvisorRegistry>,
        ranker: Arc<dyn Ranker>,
        synthesizer: Synthesizer,
        topics: TopicExtractor,
        config: RouterConfig,
        initial_weight: f64,
    ) -> Self {
        Self {
            registry,
            ranker,
            synthesizer,
            topics,
            config,
            initial_weight,
        }
    }

    pub fn registry(&self) -> &Arc<AdvisorRegistry> {
        &self.registry
    }

    pub fn infer_topics(&self, text: &str) -> Vec<String> {
        self.topics.infer(text, &self.registry.vocabulary())
    }

    /// Select and dispatch in one step.
    pub async fn route(
        &self,
        request: &CouncilRequest,
        topics: &[String],
        context: &RetrievedContext,
        snapshot: &LedgerSnapshot,
        cancel: &CancellationToken,
    ) -> Result<CouncilResponse> {
        let decision = self.select(request, topics, snapshot);
        self.dispatch(request, decision, context, cancel).await
    }

    /// Pick advisors for `request` against a ledger snapshot.
    pub fn select(&self, request: &CouncilRequest, topics: &[String], snapshot: &LedgerSnapshot) -> RoutingDecision {
        let (selected, rationale, ranked) = self.choose(request, topics, snapshot);

        let weight_topics = self.weight_topics(topics);
        let weights = selected
            .iter()
            .map(|id| {
                let weight = ranked
                    .get(id)
                    .copied()
                    .or_else(|| snapshot.best_weight(id, &weight_topics))
                    .unwrap_or(self.initial_weight);
                (id.clone(), weight)
            })
            .collect();

        let decision = RoutingDecision {
            request_id: request.id,
            mode: request.mode,
            topics: topics.to_vec(),
            selected,
            weights,
            rationale,
        };
        info!(
            mode = %decision.mode,
            "Routing to {:?}: {}",
            decision.selected, decision.rationale
        );
        decision
    }

    fn choose(
        &self,
        request: &CouncilRequest,
        topics: &[String],
        snapshot: &LedgerSnapshot,
    ) -> (Vec<String>, String, BTreeMap<String, f64>) {
        if let Some(name) = request.advisor_override.as_deref() {
            let name = name.trim().to_lowercase();
            if self.registry.is_active(&name) {
                return (vec![name.clone()], format!("override requested '{}'", name), BTreeMap::new());
            }
            warn!("Ignoring override for unknown or retired advisor '{}'", name);
        }

        let descriptors = self.registry.descriptors();
        let fallback = |why: &str| {
            let (selected, rationale) = self.reflex(topics, snapshot);
            (selected, format!("{}; {}", why, rationale), BTreeMap::new())
        };

        match request.mode {
            RoutingMode::Reflex => {
                let (selected, rationale) = self.reflex(topics, snapshot);
                (selected, rationale, BTreeMap::new())
            }
            RoutingMode::Council => {
                let members: Vec<String> = descriptors
                    .iter()
                    .filter(|d| d.matches_any(topics))
                    .map(|d| d.id.clone())
                    .collect();
                if members.is_empty() {
                    fallback("no advisor matches the topics")
                } else {
                    (members, format!("advisors tagged for {:?}", topics), BTreeMap::new())
                }
            }
            RoutingMode::Strategic => {
                let members: Vec<String> = descriptors
                    .iter()
                    .filter(|d| d.matches_any(&self.config.strategic_tags))
                    .map(|d| d.id.clone())
                    .collect();
                if members.is_empty() {
                    fallback("no strategic advisor is active")
                } else {
                    (members, "strategic advisors".to_string(), BTreeMap::new())
                }
            }
            RoutingMode::Auto => {
                let ranked = self.ranker.rank(
                    &RankRequest {
                        text: &request.text,
                        topics,
                        candidates: &descriptors,
                    },
                    snapshot,
                );
                let chosen: BTreeMap<String, f64> = ranked
                    .into_iter()
                    .filter(|r| r.score > self.config.min_weight)
                    .take(self.config.top_k.max(1))
                    .map(|r| (r.id, r.score))
                    .collect();
                if chosen.is_empty() {
                    return fallback("no advisor ranks above the minimum weight");
                }
                // Keep rank order, not id order.
                let mut selected: Vec<String> = chosen.keys().cloned().collect();
                selected.sort_by(|a, b| {
                    chosen[b]
                        .partial_cmp(&chosen[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.cmp(b))
                });
                let rationale = format!("top {} by proficiency", selected.len());
                (selected, rationale, chosen)
            }
        }
    }

    /// The single general-purpose advisor with the highest weight, or the
    /// default advisor when weights are tied or unknown.
    fn reflex(&self, topics: &[String], snapshot: &LedgerSnapshot) -> (Vec<String>, String) {
        let weight_topics = self.weight_topics(topics);
        let generals: Vec<String> = self
            .registry
            .descriptors()
            .into_iter()
            .filter(|d| d.has_capability(&self.config.general_tag))
            .map(|d| d.id)
            .collect();

        let mut scored: Vec<(f64, &String)> = generals
            .iter()
            .filter_map(|id| snapshot.best_weight(id, &weight_topics).map(|w| (w, id)))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let leader = match scored.as_slice() {
            [(_, id)] => Some((*id).clone()),
            [(top, id), (next, _), ..] if top > next => Some((*id).clone()),
            _ => None,
        };
        if let Some(id) = leader {
            return (vec![id], "highest-weighted general advisor".to_string());
        }

        if self.registry.is_active(&self.config.default_advisor) {
            return (
                vec![self.config.default_advisor.clone()],
                "default advisor".to_string(),
            );
        }
        if let Some(first) = generals.first() {
            return (vec![first.clone()], "first general advisor".to_string());
        }
        match self.registry.descriptors().first() {
            Some(first) => (vec![first.id.clone()], "first active advisor".to_string()),
            None => (Vec::new(), "no active advisors".to_string()),
        }
    }

    fn weight_topics(&self, topics: &[String]) -> Vec<String> {
        if topics.is_empty() {
            vec![self.config.general_tag.clone()]
        } else {
            topics.to_vec()
        }
    }

    /// Fan `request` out to the selected advisors with a per-call timeout and
    /// synthesize whatever comes back.
    #[instrument(skip_all, fields(request_id = %request.id))]
    pub async fn dispatch(
        &self,
        request: &CouncilRequest,
        decision: RoutingDecision,
        context: &RetrievedContext,
        cancel: &CancellationToken,
    ) -> Result<CouncilResponse> {
        let advisors: Vec<Arc<dyn Advisor>> = decision
            .selected
            .iter()
            .filter_map(|id| {
                let advisor = self.registry.get(id);
                if advisor.is_none() {
                    warn!("Advisor '{}' left the pool before dispatch", id);
                }
                advisor
            })
            .collect();

        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let calls = advisors.iter().map(|advisor| {
            let prompt = request.text.as_str();
            async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, advisor.produce(prompt, context)).await;
                (advisor.id().to_string(), outcome, started.elapsed())
            }
        });

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Request canceled during dispatch");
                return Err(CouncilError::Canceled);
            }
            results = join_all(calls) => results,
        };

        let mut proposals = Vec::new();
        let mut failures = Vec::new();
        for (advisor_id, outcome, elapsed) in results {
            let latency_ms = elapsed.as_millis() as u64;
            let failure = |kind, reason: String| AdvisorFailureRecord {
                advisor_id: advisor_id.clone(),
                kind,
                reason,
                latency_ms,
            };
            match outcome {
                Ok(Ok(proposal)) if proposal.text.trim().is_empty() => {
                    warn!("Advisor '{}' returned a blank proposal", advisor_id);
                    failures.push(failure(FailureKind::Failure, "blank proposal".to_string()));
                }
                Ok(Ok(proposal)) => proposals.push(proposal),
                Ok(Err(e)) => {
                    warn!("Advisor '{}' failed: {}", advisor_id, e);
                    failures.push(failure(FailureKind::Failure, e.to_string()));
                }
                Err(_) => {
                    let e = CouncilError::AdvisorTimeout {
                        advisor: advisor_id.clone(),
                        after_ms: self.config.call_timeout_ms,
                    };
                    warn!("{}", e);
                    failures.push(failure(FailureKind::Timeout, e.to_string()));
                }
            }
        }

        let trace = Trace {
            decision,
            proposals,
            failures,
        };

        if trace.proposals.is_empty() {
            error!(
                "{}",
                CouncilError::RoutingFailed {
                    request_id: request.id.to_string()
                }
            );
            return Ok(CouncilResponse {
                request_id: request.id,
                status: RouteStatus::RoutingFailed,
                final_text: None,
                actions: Vec::new(),
                trace,
            });
        }

        let synthesis = self.synthesizer.blend(&trace.proposals);
        debug!(
            proposals = trace.proposals.len(),
            failures = trace.failures.len(),
            "dispatch complete"
        );
        Ok(CouncilResponse {
            request_id: request.id,
            status: RouteStatus::Answered,
            final_text: Some(synthesis.text),
            actions: synthesis.actions,
            trace,
        })
    }
}
