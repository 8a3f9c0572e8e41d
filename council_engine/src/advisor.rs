use crate::{
    engine::TextEngine,
    error::{CouncilError, Result},
    memory::RetrievedContext,
    settings::AdvisorSpec,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Where an advisor came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvisorOrigin {
    Base,
    MiniAgent { cloned_from: String },
}

/// Identity and capabilities of an advisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorDescriptor {
    pub id: String,
    pub role: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub origin: AdvisorOrigin,
}

impl AdvisorDescriptor {
    pub fn new(id: &str, role: &str, description: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            description: description.to_string(),
            capabilities: normalize_tags(capabilities.iter().map(|t| t.to_string())),
            origin: AdvisorOrigin::Base,
        }
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }

    pub fn matches_any(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.has_capability(t))
    }

    pub fn is_mini_agent(&self) -> bool {
        matches!(self.origin, AdvisorOrigin::MiniAgent { .. })
    }

    /// Descriptor for a topic clone of this advisor. Capabilities are the
    /// parent's plus the topic.
    pub fn specialized(&self, clone_id: &str, topic: &str) -> Self {
        let mut caps = self.capabilities.clone();
        caps.push(topic.to_string());
        Self {
            id: clone_id.to_string(),
            role: format!("{} ({} specialist)", self.role, topic),
            description: format!("{} Focused on {}.", self.description, topic),
            capabilities: normalize_tags(caps),
            origin: AdvisorOrigin::MiniAgent {
                cloned_from: self.id.clone(),
            },
        }
    }
}

/// Lowercase, trim and de-duplicate while keeping first-seen order.
pub fn normalize_tags<I>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// One advisor's answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub advisor_id: String,
    pub capabilities: Vec<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AdvisorStats {
    pub total_requests: u64,
    pub error_count: u64,
}

/// A specialized reasoning unit.
#[async_trait]
pub trait Advisor: Send + Sync {
    fn descriptor(&self) -> &AdvisorDescriptor;

    fn id(&self) -> &str {
        &self.descriptor().id
    }

    async fn produce(&self, prompt: &str, context: &RetrievedContext) -> Result<Proposal>;

    /// Build a clone of this advisor carrying `descriptor`. Used by the nursery.
    fn specialize(&self, descriptor: AdvisorDescriptor) -> Arc<dyn Advisor>;

    fn stats(&self) -> AdvisorStats {
        AdvisorStats::default()
    }
}

/// Advisor that frames the request with its role and retrieved context and
/// delegates generation to a [`TextEngine`].
pub struct EngineAdvisor {
    descriptor: AdvisorDescriptor,
    engine: Arc<dyn TextEngine>,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl EngineAdvisor {
    pub fn new(descriptor: AdvisorDescriptor, engine: Arc<dyn TextEngine>) -> Self {
        Self {
            descriptor,
            engine,
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    fn frame(&self, context: &RetrievedContext) -> String {
        let mut out = format!("[{}] {}", self.descriptor.id, self.descriptor.role);
        let rendered = context.render();
        if !rendered.is_empty() {
            out.push('\n');
            out.push_str(&rendered);
        }
        out
    }
}

#[async_trait]
impl Advisor for EngineAdvisor {
    fn descriptor(&self) -> &AdvisorDescriptor {
        &self.descriptor
    }

    #[instrument(skip(self, prompt, context), fields(advisor = %self.descriptor.id))]
    async fn produce(&self, prompt: &str, context: &RetrievedContext) -> Result<Proposal> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let text = self
            .engine
            .generate(prompt, &self.frame(context))
            .await
            .map_err(|e| {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!("engine call failed: {}", e);
                CouncilError::from(e)
            })?;

        debug!(len = text.len(), "proposal generated");
        Ok(Proposal {
            advisor_id: self.descriptor.id.clone(),
            capabilities: self.descriptor.capabilities.clone(),
            text,
            confidence: None,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn specialize(&self, descriptor: AdvisorDescriptor) -> Arc<dyn Advisor> {
        Arc::new(EngineAdvisor::new(descriptor, self.engine.clone()))
    }

    fn stats(&self) -> AdvisorStats {
        AdvisorStats {
            total_requests: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

/// Builds base advisors from the configured roster.
pub struct AdvisorFactory;

impl AdvisorFactory {
    pub fn create(spec: &AdvisorSpec, engine: Arc<dyn TextEngine>) -> Arc<dyn Advisor> {
        let descriptor = AdvisorDescriptor {
            id: spec.id.trim().to_lowercase(),
            role: spec.role.clone(),
            description: spec.description.clone(),
            capabilities: normalize_tags(spec.capabilities.iter().cloned()),
            origin: AdvisorOrigin::Base,
        };
        Arc::new(EngineAdvisor::new(descriptor, engine))
    }

    pub fn roster(specs: &[AdvisorSpec], engine: Arc<dyn TextEngine>) -> Vec<Arc<dyn Advisor>> {
        specs
            .iter()
            .map(|spec| Self::create(spec, engine.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EchoEngine, EngineError};

    struct DownEngine;

    #[async_trait]
    impl TextEngine for DownEngine {
        async fn generate(&self, _: &str, _: &str) -> std::result::Result<String, EngineError> {
            Err(EngineError::Unavailable("model not loaded".into()))
        }
    }

    #[test]
    fn tags_are_normalized_in_order() {
        let tags = normalize_tags(vec![
            " Planning".to_string(),
            "ops".to_string(),
            "planning".to_string(),
            "".to_string(),
        ]);
        assert_eq!(tags, vec!["planning", "ops"]);
    }

    #[test]
    fn specialized_clone_extends_capabilities() {
        let base = AdvisorDescriptor::new("jarvis", "System Control", "Hub.", &["general", "system"]);
        let clone = base.specialized("jarvis_mini_0", "budgeting");
        assert_eq!(clone.capabilities, vec!["general", "system", "budgeting"]);
        assert!(clone.is_mini_agent());
        assert_eq!(
            clone.origin,
            AdvisorOrigin::MiniAgent { cloned_from: "jarvis".into() }
        );
    }

    #[tokio::test]
    async fn engine_advisor_produces_and_counts() {
        let advisor = EngineAdvisor::new(
            AdvisorDescriptor::new("ops", "Operations", "Plans.", &["ops", "planning"]),
            Arc::new(EchoEngine::new()),
        );
        let proposal = advisor.produce("plan it", &RetrievedContext::default()).await.unwrap();
        assert_eq!(proposal.advisor_id, "ops");
        assert!(proposal.text.contains("plan it"));
        assert_eq!(advisor.stats().total_requests, 1);
    }

    #[tokio::test]
    async fn engine_failure_maps_to_advisor_scoped_error() {
        let advisor = EngineAdvisor::new(
            AdvisorDescriptor::new("ops", "Operations", "Plans.", &["ops"]),
            Arc::new(DownEngine),
        );
        let err = advisor.produce("x", &RetrievedContext::default()).await.unwrap_err();
        assert!(err.is_advisor_scoped());
        assert_eq!(advisor.stats().error_count, 1);
    }
}
