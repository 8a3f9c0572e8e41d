//! Advisor ranking for `auto` routing.

use serde::Serialize;

use crate::advisor::AdvisorDescriptor;
use crate::ledger::LedgerSnapshot;

/// Input to a [`Ranker`].
#[derive(Debug, Clone, Copy)]
pub struct RankRequest<'a> {
    pub text: &'a str,
    pub topics: &'a [String],
    pub candidates: &'a [AdvisorDescriptor],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedAdvisor {
    pub id: String,
    pub score: f64,
}

/// Orders candidates for a request. Output is sorted best first; advisors
/// with nothing to say about the topics are left out.
pub trait Ranker: Send + Sync {
    fn rank(&self, request: &RankRequest<'_>, snapshot: &LedgerSnapshot) -> Vec<RankedAdvisor>;
}

/// Scores each candidate by its best ledger weight over the topics. A topic
/// the advisor is tagged for but has no history on counts at the initial
/// weight.
#[derive(Debug, Clone)]
pub struct HeuristicRanker {
    initial_weight: f64,
    general_tag: String,
}

impl HeuristicRanker {
    pub fn new(initial_weight: f64, general_tag: &str) -> Self {
        Self {
            initial_weight,
            general_tag: general_tag.to_string(),
        }
    }

    fn score(&self, candidate: &AdvisorDescriptor, topics: &[String], snapshot: &LedgerSnapshot) -> Option<f64> {
        topics
            .iter()
            .filter_map(|topic| {
                snapshot
                    .weight(&candidate.id, topic)
                    .or_else(|| candidate.has_capability(topic).then_some(self.initial_weight))
            })
            .fold(None, |best: Option<f64>, w| Some(best.map_or(w, |b| b.max(w))))
    }
}

impl Ranker for HeuristicRanker {
    fn rank(&self, request: &RankRequest<'_>, snapshot: &LedgerSnapshot) -> Vec<RankedAdvisor> {
        let general = [self.general_tag.clone()];
        let topics = if request.topics.is_empty() {
            &general[..]
        } else {
            request.topics
        };

        let mut ranked: Vec<RankedAdvisor> = request
            .candidates
            .iter()
            .filter_map(|c| {
                self.score(c, topics, snapshot).map(|score| RankedAdvisor {
                    id: c.id.clone(),
                    score,
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked
    }
}
