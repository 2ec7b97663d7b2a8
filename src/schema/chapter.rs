use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::category::Category;
use super::protagonist::Protagonist;

/// Newtype wrapper for chapter IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChapterId(pub Uuid);

impl ChapterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChapterId {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a chapter takes place: inside the game or outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChapterType {
    Vr,
    Real,
}

impl ChapterType {
    /// Returns the tag string for this type (e.g., "type:vr").
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Vr => "type:vr",
            Self::Real => "type:real",
        }
    }

    pub fn other(&self) -> ChapterType {
        match self {
            Self::Vr => Self::Real,
            Self::Real => Self::Vr,
        }
    }

    /// Pool the chapter's setting is sampled from.
    pub fn settings_pool(&self) -> &'static str {
        match self {
            Self::Vr => "vr_settings",
            Self::Real => "real_settings",
        }
    }
}

/// A generated chapter. Created once by the generator and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub id: ChapterId,
    pub number: u64,
    pub title: String,
    pub paragraphs: Vec<String>,
    pub word_count: usize,
    pub arc: String,
    pub chapter_type: ChapterType,
    pub setting: String,
    /// Categories of each paragraph, index-aligned with `paragraphs`.
    #[serde(default)]
    pub categories: Vec<Category>,
    /// Directive texts woven into this chapter.
    #[serde(default)]
    pub directives: Vec<String>,
    pub mc_snapshot: Protagonist,
    pub created_at: DateTime<Utc>,
}

impl ChapterRecord {
    /// The chapter body as one string, paragraphs separated by blank lines.
    pub fn body(&self) -> String {
        self.paragraphs.join("\n\n")
    }
}

/// Count whitespace-separated words across a set of paragraphs.
pub fn count_words<S: AsRef<str>>(paragraphs: &[S]) -> usize {
    paragraphs
        .iter()
        .map(|p| p.as_ref().split_whitespace().count())
        .sum()
}
