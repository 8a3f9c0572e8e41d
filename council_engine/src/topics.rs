//! Topic-tag inference for incoming requests.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::settings::TopicConfig;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z0-9][a-z0-9_\-]*").expect("token pattern is valid"));

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "also", "been", "before", "being", "could", "does", "doing",
    "down", "each", "from", "give", "have", "help", "here", "into", "just", "know", "like",
    "make", "more", "most", "much", "need", "only", "other", "over", "please", "question",
    "really", "should", "some", "something", "such", "tell", "than", "that", "their", "them",
    "then", "there", "these", "they", "thing", "things", "this", "those", "through", "today",
    "very", "want", "were", "what", "when", "where", "which", "while", "will", "with", "would",
    "your", "yours",
];

/// Keyword → tags lexicon used when the request does not name a tag directly.
fn default_lexicon() -> BTreeMap<String, Vec<String>> {
    let groups: &[(&[&str], &[&str])] = &[
        (
            &["code", "build", "fix", "implement", "debug", "function", "class", "error", "bug", "refactor"],
            &["code"],
        ),
        (
            &["schedule", "remind", "meet", "meeting", "calendar", "appointment"],
            &["scheduling"],
        ),
        (
            &["creative", "design", "idea", "ideas", "brainstorm", "imagine", "concept"],
            &["creative"],
        ),
        (
            &["security", "threat", "protect", "safe", "password", "permission"],
            &["security"],
        ),
        (
            &["data", "analyze", "analyse", "report", "metrics", "stats", "numbers", "compare"],
            &["analysis"],
        ),
        (&["email", "draft", "write", "letter", "post", "message"], &["communication"]),
        (&["plan", "steps", "workflow", "organize", "checklist", "process"], &["planning"]),
        (&["strategy", "strategic", "long-term", "roadmap"], &["strategy"]),
        (&["architecture", "system-design", "scalable"], &["architecture"]),
    ];

    let mut lexicon = BTreeMap::new();
    for (words, tags) in groups {
        for word in *words {
            lexicon.insert(
                word.to_string(),
                tags.iter().map(|t| t.to_string()).collect(),
            );
        }
    }
    lexicon
}

/// Infers ordered, de-duplicated topic tags from request text.
///
/// Tags come from three places, in order: tokens naming a capability in the
/// registry vocabulary, lexicon hits, and free keywords (non-stopwords) that
/// let new recurring topics surface before any advisor covers them.
#[derive(Debug, Clone)]
pub struct TopicExtractor {
    lexicon: BTreeMap<String, Vec<String>>,
    stopwords: HashSet<&'static str>,
    config: TopicConfig,
}

impl Default for TopicExtractor {
    fn default() -> Self {
        Self::new(TopicConfig::default())
    }
}

impl TopicExtractor {
    pub fn new(config: TopicConfig) -> Self {
        Self {
            lexicon: default_lexicon(),
            stopwords: STOPWORDS.iter().copied().collect(),
            config,
        }
    }

    pub fn infer(&self, text: &str, vocabulary: &BTreeSet<String>) -> Vec<String> {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = TOKEN.find_iter(&lowered).map(|m| m.as_str()).collect();

        fn push(tag: &str, tags: &mut Vec<String>) {
            if !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }

        let mut tags: Vec<String> = Vec::new();

        for token in &tokens {
            if vocabulary.contains(*token) {
                push(token, &mut tags);
            } else if let Some(singular) = singular(token) {
                if vocabulary.contains(singular) {
                    push(singular, &mut tags);
                }
            }
            if let Some(mapped) = self.lexicon.get(*token) {
                for tag in mapped {
                    push(tag, &mut tags);
                }
            }
        }

        let mut keywords = 0;
        for token in &tokens {
            if keywords >= self.config.max_keywords {
                break;
            }
            let covered = tags
                .iter()
                .any(|t| t == token || Some(t.as_str()) == singular(token));
            if self.is_keyword(token) && !covered {
                push(token, &mut tags);
                keywords += 1;
            }
        }

        tags
    }

    /// Plain tokens of `text`, for retrieval scoring.
    pub fn tokens(text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        TOKEN
            .find_iter(&lowered)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    fn is_keyword(&self, token: &str) -> bool {
        token.len() >= self.config.min_keyword_len
            && !token.chars().all(|c| c.is_ascii_digit())
            && !self.stopwords.contains(token)
            && !self.lexicon.contains_key(token)
    }
}

fn singular(token: &str) -> Option<&str> {
    token.strip_suffix('s').filter(|s| s.len() > 2)
}
