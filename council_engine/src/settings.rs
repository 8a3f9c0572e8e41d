//! Layered configuration: embedded defaults, optional local file, environment.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::router::RoutingMode;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
    pub enable_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
            enable_thread_ids: false,
        }
    }
}

/// Advisor selection and dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub default_mode: RoutingMode,
    /// Advisors selected in `auto` mode at most.
    pub top_k: usize,
    /// `auto` only selects advisors ranked strictly above this weight.
    pub min_weight: f64,
    pub call_timeout_ms: u64,
    /// Reflex fallback when weights are tied or absent.
    pub default_advisor: String,
    pub general_tag: String,
    pub strategic_tags: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_mode: RoutingMode::Auto,
            top_k: 3,
            min_weight: 0.35,
            call_timeout_ms: 30_000,
            default_advisor: "jarvis".to_string(),
            general_tag: "general".to_string(),
            strategic_tags: vec![
                "strategy".to_string(),
                "architecture".to_string(),
                "analysis".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Tags marking the advisor whose proposal becomes the narrative backbone.
    pub narrative_tags: Vec<String>,
    /// Tags marking the advisor whose action items are appended.
    pub structure_tags: Vec<String>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            narrative_tags: vec!["writer".to_string(), "communication".to_string()],
            structure_tags: vec!["ops".to_string(), "planning".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Step size of the exponential smoothing, in (0, 1].
    pub smoothing_rate: f64,
    /// Fraction of `smoothing_rate` applied for neutral outcomes.
    pub neutral_scale: f64,
    /// Observation value a neutral outcome pulls toward.
    pub neutral_target: f64,
    /// Weight of a fresh entry with no history.
    pub initial_weight: f64,
    /// Recorded turns per generation.
    pub generation_interval: u64,
    pub max_write_attempts: u32,
    /// How long a turn waits for explicit feedback before it is settled.
    pub feedback_window_secs: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            smoothing_rate: 0.2,
            neutral_scale: 0.25,
            neutral_target: 0.5,
            initial_weight: 0.5,
            generation_interval: 25,
            max_write_attempts: 8,
            feedback_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NurseryConfig {
    pub enabled: bool,
    /// Recent memory turns inspected per scan.
    pub window: usize,
    /// Turns within the window a topic needs before a spawn is considered.
    pub min_occurrences: usize,
    /// Spawn only while the best serving weight stays below this.
    pub spawn_weight_ceiling: f64,
    pub max_active: usize,
    pub max_idle_turns: u64,
    pub max_lifetime_secs: Option<u64>,
    /// Retire a mini-agent whose weight on its topic falls below this ...
    pub retire_below_weight: f64,
    /// ... once it has at least this many recorded attempts there.
    pub retire_min_attempts: u64,
    pub scan_interval_secs: u64,
}

impl Default for NurseryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 20,
            min_occurrences: 6,
            spawn_weight_ceiling: 0.4,
            max_active: 8,
            max_idle_turns: 50,
            max_lifetime_secs: None,
            retire_below_weight: 0.3,
            retire_min_attempts: 5,
            scan_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub provider: String, // "in_memory" or "sled"
    pub path: Option<PathBuf>,
    /// Teachings handed to advisors per request.
    pub context_teachings: usize,
    /// Past turns handed to advisors per request.
    pub context_turns: usize,
    pub similarity_threshold: f32,
    pub embedding_dim: usize,
    /// Embeddings kept in the LRU cache.
    pub embedding_cache_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            provider: "in_memory".to_string(),
            path: None,
            context_teachings: 3,
            context_turns: 2,
            similarity_threshold: 0.1,
            embedding_dim: 256,
            embedding_cache_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Free keywords admitted as topics per request.
    pub max_keywords: usize,
    pub min_keyword_len: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            max_keywords: 3,
            min_keyword_len: 4,
        }
    }
}

/// One base advisor of the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorSpec {
    pub id: String,
    pub role: String,
    pub description: String,
    pub capabilities: Vec<String>,
}

impl AdvisorSpec {
    fn new(id: &str, role: &str, description: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            description: description.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }
}

pub fn default_roster() -> Vec<AdvisorSpec> {
    vec![
        AdvisorSpec::new(
            "jarvis",
            "System Control",
            "Central hub for general queries, coordination and status.",
            &["general", "system", "coordination"],
        ),
        AdvisorSpec::new(
            "analyst",
            "Data & Insights",
            "Analyzes data, compares options and surfaces trade-offs.",
            &["analysis", "data", "research"],
        ),
        AdvisorSpec::new(
            "batman",
            "Strategy & Security",
            "Evaluates threats, plans strategy and guards safety.",
            &["strategy", "security", "risk"],
        ),
        AdvisorSpec::new(
            "alfred",
            "Communication & Scheduling",
            "Drafts clear text and handles schedules and correspondence.",
            &["writer", "communication", "scheduling", "email"],
        ),
        AdvisorSpec::new(
            "davinci",
            "Creativity & Design",
            "Generates ideas and explores creative approaches.",
            &["creative", "design", "ideas"],
        ),
        AdvisorSpec::new(
            "architect",
            "Builder & Code",
            "Designs architecture, writes code and builds systems.",
            &["architecture", "code", "engineering"],
        ),
        AdvisorSpec::new(
            "ops",
            "Operations & Workflow",
            "Plans steps, organizes processes and proposes automations.",
            &["ops", "planning", "workflow", "automation"],
        ),
    ]
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// Persist ledger, generations and mini-agents between runs.
    pub persist_state: bool,
    pub logging: LoggingConfig,
    pub router: RouterConfig,
    pub synthesis: SynthesisConfig,
    pub learning: LearningConfig,
    pub nursery: NurseryConfig,
    pub memory: MemoryConfig,
    pub topics: TopicConfig,
    pub advisors: Vec<AdvisorSpec>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            persist_state: false,
            logging: LoggingConfig::default(),
            router: RouterConfig::default(),
            synthesis: SynthesisConfig::default(),
            learning: LearningConfig::default(),
            nursery: NurseryConfig::default(),
            memory: MemoryConfig::default(),
            topics: TopicConfig::default(),
            advisors: default_roster(),
        }
    }
}

impl Settings {
    /// Load settings from the embedded defaults, `council.toml` in the working
    /// directory (or `path`), and `COUNCIL__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(File::from_str(
            include_str!("../config.toml"),
            FileFormat::Toml,
        ));

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("council").required(false)),
        };

        let config = builder
            .add_source(
                Environment::with_prefix("COUNCIL")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("router.strategic_tags")
                    .with_list_parse_key("synthesis.narrative_tags")
                    .with_list_parse_key("synthesis.structure_tags")
                    .try_parsing(true),
            )
            .build()
            .context("failed to assemble configuration sources")?;

        let mut settings: Settings = config
            .try_deserialize()
            .context("configuration does not match the settings schema")?;

        Self::apply_env_overrides(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(settings: &mut Settings) {
        if let Ok(dir) = std::env::var("COUNCIL_DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("COUNCIL_LOG_LEVEL") {
            settings.logging.level = level;
        }
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(anyhow!("{} must lie in [0, 1], got {}", name, v));
            }
            Ok(())
        };

        if self.router.top_k == 0 {
            return Err(anyhow!("router.top_k must be at least 1"));
        }
        unit("router.min_weight", self.router.min_weight)?;
        if self.router.call_timeout_ms == 0 {
            return Err(anyhow!("router.call_timeout_ms cannot be 0"));
        }

        if self.learning.smoothing_rate <= 0.0 || self.learning.smoothing_rate > 1.0 {
            return Err(anyhow!(
                "learning.smoothing_rate must lie in (0, 1], got {}",
                self.learning.smoothing_rate
            ));
        }
        unit("learning.neutral_scale", self.learning.neutral_scale)?;
        unit("learning.neutral_target", self.learning.neutral_target)?;
        unit("learning.initial_weight", self.learning.initial_weight)?;
        if self.learning.generation_interval == 0 {
            return Err(anyhow!("learning.generation_interval cannot be 0"));
        }

        if self.nursery.min_occurrences == 0 || self.nursery.min_occurrences > self.nursery.window {
            return Err(anyhow!(
                "nursery.min_occurrences must be between 1 and nursery.window ({})",
                self.nursery.window
            ));
        }
        unit("nursery.spawn_weight_ceiling", self.nursery.spawn_weight_ceiling)?;
        unit("nursery.retire_below_weight", self.nursery.retire_below_weight)?;
        if self.nursery.max_idle_turns == 0 {
            return Err(anyhow!("nursery.max_idle_turns cannot be 0"));
        }

        match self.memory.provider.as_str() {
            "in_memory" | "sled" => {}
            other => return Err(anyhow!("unknown memory provider '{}'", other)),
        }
        if self.memory.embedding_dim == 0 {
            return Err(anyhow!("memory.embedding_dim cannot be 0"));
        }
        if self.memory.embedding_cache_size == 0 {
            return Err(anyhow!("memory.embedding_cache_size cannot be 0"));
        }

        if self.advisors.is_empty() {
            return Err(anyhow!("at least one advisor must be configured"));
        }
        let mut seen = HashSet::new();
        for advisor in &self.advisors {
            if !seen.insert(advisor.id.trim().to_lowercase()) {
                return Err(anyhow!("advisor '{}' is configured twice", advisor.id));
            }
        }
        if !seen.contains(&self.router.default_advisor) {
            warn!(
                "Default advisor '{}' is not in the roster; reflex falls back to the first general advisor",
                self.router.default_advisor
            );
        }

        Ok(())
    }

    /// Path of the sled memory database.
    pub fn memory_path(&self) -> PathBuf {
        self.memory
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("memory.sled"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("evolution.json")
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render settings as TOML")
    }
}
