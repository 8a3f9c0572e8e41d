//! Blends advisor proposals into one response.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::advisor::Proposal;
use crate::settings::SynthesisConfig;

/// Returned when no proposal carries any text.
pub const EMPTY_COUNCIL_NOTICE: &str = "The council has no answer to offer for this request.";

const NEXT_STEPS_HEADING: &str = "Next steps:";

static STRUCTURAL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[-*•]\s+|\d{1,3}[.)]\s+)(\S.*)$").expect("structural line pattern is valid"));

/// Blended answer plus the follow-up actions lifted out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub text: String,
    /// Step and list items from structure-tagged proposals, markers
    /// stripped, in advisor id order.
    pub actions: Vec<String>,
}

/// Deterministic, side-effect free blending policy.
///
/// Input order never matters: candidates are compared on content and
/// advisor id only.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    narrative_tags: Vec<String>,
    structure_tags: Vec<String>,
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new(&SynthesisConfig::default())
    }
}

impl Synthesizer {
    pub fn new(config: &SynthesisConfig) -> Self {
        Self {
            narrative_tags: config.narrative_tags.clone(),
            structure_tags: config.structure_tags.clone(),
        }
    }

    pub fn synthesize(&self, proposals: &[Proposal]) -> String {
        self.blend(proposals).text
    }

    pub fn blend(&self, proposals: &[Proposal]) -> Synthesis {
        let mut usable: Vec<&Proposal> = proposals.iter().filter(|p| !p.text.trim().is_empty()).collect();
        usable.sort_by(|a, b| a.advisor_id.cmp(&b.advisor_id));
        let actions = self.actions(&usable);

        let text = match usable.len() {
            0 => EMPTY_COUNCIL_NOTICE.to_string(),
            1 => usable[0].text.clone(),
            _ => self.merge(&usable),
        };
        Synthesis { text, actions }
    }

    fn actions(&self, usable: &[&Proposal]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut actions = Vec::new();
        for proposal in usable.iter().filter(|p| tagged(p, &self.structure_tags)) {
            for line in proposal.text.lines().map(str::trim) {
                if let Some(item) = STRUCTURAL_LINE.captures(line).and_then(|c| c.get(1)) {
                    let item = item.as_str().trim();
                    if seen.insert(item.to_lowercase()) {
                        actions.push(item.to_string());
                    }
                }
            }
        }
        actions
    }

    /// `usable` holds at least two proposals, sorted by id.
    fn merge(&self, usable: &[&Proposal]) -> String {
        let narrative: Vec<&Proposal> = usable
            .iter()
            .copied()
            .filter(|p| tagged(p, &self.narrative_tags))
            .collect();
        let backbone = longest(if narrative.is_empty() { usable } else { &narrative[..] });

        let present: HashSet<String> = backbone.text.lines().map(normalize_line).collect();
        let mut seen = HashSet::new();
        let mut steps = Vec::new();
        for proposal in usable
            .iter()
            .filter(|p| p.advisor_id != backbone.advisor_id && tagged(p, &self.structure_tags))
        {
            for line in proposal.text.lines().map(str::trim) {
                if !STRUCTURAL_LINE.is_match(line) {
                    continue;
                }
                let key = normalize_line(line);
                if !present.contains(&key) && seen.insert(key) {
                    steps.push(line.to_string());
                }
            }
        }

        if steps.is_empty() {
            backbone.text.clone()
        } else {
            format!("{}\n\n{}\n{}", backbone.text.trim_end(), NEXT_STEPS_HEADING, steps.join("\n"))
        }
    }
}

fn tagged(proposal: &Proposal, tags: &[String]) -> bool {
    proposal.capabilities.iter().any(|c| tags.contains(c))
}

/// Longest text wins; equal lengths go to the smaller advisor id.
/// `candidates` is non-empty and sorted by id.
fn longest<'a>(candidates: &[&'a Proposal]) -> &'a Proposal {
    let mut best = candidates[0];
    for candidate in &candidates[1..] {
        if candidate.text.trim().len() > best.text.trim().len() {
            best = candidate;
        }
    }
    best
}

fn normalize_line(line: &str) -> String {
    line.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(id: &str, caps: &[&str], text: &str) -> Proposal {
        Proposal {
            advisor_id: id.to_string(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            text: text.to_string(),
            confidence: None,
            latency_ms: 0,
        }
    }

    #[test]
    fn single_proposal_is_returned_verbatim() {
        let text = "  Keep it simple.\n";
        let out = Synthesizer::default().synthesize(&[proposal("jarvis", &["general"], text)]);
        assert_eq!(out, text);
    }

    #[test]
    fn narrative_advisor_is_the_backbone_and_steps_are_appended() {
        let proposals = vec![
            proposal("ops", &["ops", "planning"], "Plan:\n1. Book the venue\n2. Send invites\n- Order food"),
            proposal("alfred", &["writer", "communication"], "Here is a warm invitation.\n2. Send invites"),
            proposal("analyst", &["analysis"], "A much longer analytical answer that should not be the backbone."),
        ];
        let out = Synthesizer::default().synthesize(&proposals);
        assert_eq!(
            out,
            "Here is a warm invitation.\n2. Send invites\n\nNext steps:\n1. Book the venue\n- Order food"
        );
    }

    #[test]
    fn longest_proposal_backbones_without_a_narrative_advisor() {
        let proposals = vec![
            proposal("b", &["analysis"], "short"),
            proposal("a", &["strategy"], "a longer one"),
            proposal("c", &["code"], "same length!"),
        ];
        assert_eq!(Synthesizer::default().synthesize(&proposals), "a longer one");
    }

    #[test]
    fn input_order_does_not_change_the_result() {
        let mut proposals = vec![
            proposal("ops", &["planning"], "- step one\n- step two"),
            proposal("analyst", &["analysis"], "Numbers look fine overall."),
            proposal("batman", &["strategy"], "Guard the perimeter first."),
        ];
        let synth = Synthesizer::default();
        let first = synth.synthesize(&proposals);
        proposals.reverse();
        assert_eq!(first, synth.synthesize(&proposals));
        assert!(first.ends_with("Next steps:\n- step one\n- step two"));
    }

    #[test]
    fn structural_items_are_exposed_as_actions() {
        let synth = Synthesizer::default();
        let proposals = vec![
            proposal("ops", &["ops", "planning"], "Plan:\n1. Book the venue\n2) Send invites\n- book the venue"),
            proposal("alfred", &["writer", "communication"], "Here is a warm invitation.\n- Not an action"),
        ];
        let blended = synth.blend(&proposals);
        assert_eq!(blended.actions, vec!["Book the venue", "Send invites"]);
        assert_eq!(blended.text, synth.synthesize(&proposals));

        let single = synth.blend(&[proposal("ops", &["planning"], "* pack bags\nthen relax")]);
        assert_eq!(single.text, "* pack bags\nthen relax");
        assert_eq!(single.actions, vec!["pack bags"]);

        assert!(synth.blend(&[]).actions.is_empty());
    }

    #[test]
    fn synthesis_is_total() {
        let synth = Synthesizer::default();
        assert_eq!(synth.synthesize(&[]), EMPTY_COUNCIL_NOTICE);
        assert_eq!(
            synth.synthesize(&[proposal("a", &[], "  "), proposal("b", &[], "\n")]),
            EMPTY_COUNCIL_NOTICE
        );
        let out = synth.synthesize(&[proposal("a", &[], " "), proposal("b", &[], "fine")]);
        assert_eq!(out, "fine");
    }
}
