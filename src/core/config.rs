/// Engine configuration. RON-loadable, every field defaulted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::schema::category::Category;
use crate::schema::protagonist::Pronouns;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One phase of the arc state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcSpec {
    pub name: String,
    /// Chapters spent in this arc before advancing. Ignored for the final arc.
    pub length: u32,
    /// Probability that a chapter in this arc is set inside the game.
    #[serde(default = "default_vr_ratio")]
    pub vr_ratio: f64,
    /// Extra weight for categories this arc leans on. Categories not listed
    /// keep weight 1.
    #[serde(default)]
    pub category_weights: BTreeMap<Category, u32>,
}

fn default_vr_ratio() -> f64 {
    0.5
}

impl ArcSpec {
    pub fn new(name: &str, length: u32, vr_ratio: f64) -> Self {
        Self {
            name: name.to_string(),
            length,
            vr_ratio,
            category_weights: BTreeMap::new(),
        }
    }

    pub fn weighted(mut self, category: Category, weight: u32) -> Self {
        self.category_weights.insert(category, weight);
        self
    }

    pub fn weight_of(&self, category: Category) -> u32 {
        self.category_weights.get(&category).copied().unwrap_or(1)
    }

    /// Tag string for grammar gating (e.g., "arc:awakening").
    pub fn tag(&self) -> String {
        format!("arc:{}", self.name.to_lowercase().replace(' ', "_"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Word floor every chapter must reach.
    pub min_words: usize,
    /// Bounded retries for any duplicate-avoiding draw.
    pub max_retries: u32,
    /// Chance a title is composed from a pattern instead of the curated list.
    pub dynamic_title_probability: f64,
    /// Longest allowed run of chapters of the same type.
    pub max_consecutive_type: u32,
    /// Number of paragraphs planned from the arc/type before padding.
    pub planned_paragraphs: usize,
    /// Inclusive range of body sentences per paragraph.
    pub body_sentences: (usize, usize),
    pub protagonist_name: String,
    pub protagonist_pronouns: Pronouns,
    pub special_resource: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            min_words: 1000,
            max_retries: 10,
            dynamic_title_probability: 0.7,
            max_consecutive_type: 3,
            planned_paragraphs: 6,
            body_sentences: (3, 5),
            protagonist_name: "Kai".to_string(),
            protagonist_pronouns: Pronouns::TheyThem,
            special_resource: "Aether".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniquenessConfig {
    /// Sentences shorter than this (after normalization) are not tracked.
    pub min_sentence_chars: usize,
    /// Token-overlap ratio at which a paragraph counts as a near-duplicate.
    pub similarity_threshold: Option<f64>,
    /// How many recent paragraphs the similarity check compares against.
    pub similarity_window: usize,
}

impl Default for UniquenessConfig {
    fn default() -> Self {
        Self {
            min_sentence_chars: 24,
            similarity_threshold: Some(0.85),
            similarity_window: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    /// Items requested per expansion.
    pub batch_size: usize,
    /// Expand every pool each time this many chapters have been produced.
    /// Zero disables periodic expansion.
    pub periodic_interval: u64,
    /// Expand a pool as soon as its unused share drops below this ratio.
    pub proactive_threshold: f64,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            batch_size: 40,
            periodic_interval: 25,
            proactive_threshold: 0.20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub buffer_chapters: u64,
    pub auto_generate: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            buffer_chapters: 10,
            auto_generate: true,
        }
    }
}

/// Top-level configuration for a serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub seed: u64,
    pub generator: GeneratorConfig,
    pub uniqueness: UniquenessConfig,
    pub expansion: ExpansionConfig,
    pub scheduler: SchedulerConfig,
    pub arcs: Vec<ArcSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            generator: GeneratorConfig::default(),
            uniqueness: UniquenessConfig::default(),
            expansion: ExpansionConfig::default(),
            scheduler: SchedulerConfig::default(),
            arcs: default_arcs(),
        }
    }
}

pub fn default_arcs() -> Vec<ArcSpec> {
    vec![
        ArcSpec::new("Awakening", 8, 0.5)
            .weighted(Category::Introspection, 3)
            .weighted(Category::Exploration, 2),
        ArcSpec::new("The Drowned Dungeon", 12, 0.7)
            .weighted(Category::Combat, 3)
            .weighted(Category::ItemExtraction, 2),
        ArcSpec::new("Guild of Ash", 15, 0.55)
            .weighted(Category::Social, 3)
            .weighted(Category::RelationshipMoment, 2),
        ArcSpec::new("Fracture Protocol", 20, 0.5)
            .weighted(Category::WorldEvent, 3)
            .weighted(Category::Lore, 2),
        ArcSpec::new("Convergence", 0, 0.5)
            .weighted(Category::PowerGrowth, 2)
            .weighted(Category::Flashback, 2),
    ]
}

impl EngineConfig {
    pub fn load_from_ron(path: &Path) -> Result<EngineConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    pub fn parse_ron(input: &str) -> Result<EngineConfig, ConfigError> {
        let config: EngineConfig = ron::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arcs.is_empty() {
            return Err(ConfigError::Invalid("at least one arc is required".to_string()));
        }
        for arc in &self.arcs[..self.arcs.len() - 1] {
            if arc.length == 0 {
                return Err(ConfigError::Invalid(format!(
                    "arc '{}' has zero length but is not the final arc",
                    arc.name
                )));
            }
        }
        if self.generator.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be positive".to_string()));
        }
        let (lo, hi) = self.generator.body_sentences;
        if lo == 0 || lo > hi {
            return Err(ConfigError::Invalid(format!(
                "body_sentences range ({}, {}) is empty",
                lo, hi
            )));
        }
        if !(0.0..=1.0).contains(&self.generator.dynamic_title_probability) {
            return Err(ConfigError::Invalid(
                "dynamic_title_probability must be within 0..=1".to_string(),
            ));
        }
        if let Some(threshold) = self.uniqueness.similarity_threshold {
            if !(0.0..=1.0).contains(&threshold) || threshold == 0.0 {
                return Err(ConfigError::Invalid(
                    "similarity_threshold must be within (0, 1]".to_string(),
                ));
            }
        }
        if !(0.0..1.0).contains(&self.expansion.proactive_threshold) {
            return Err(ConfigError::Invalid(
                "proactive_threshold must be within 0..1".to_string(),
            ));
        }
        Ok(())
    }
}
