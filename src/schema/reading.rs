use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One successful scheduler-driven generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationEntry {
    pub chapter: u64,
    /// `last_chapter_read` at the time the chapter was produced.
    pub read_at_generation: u64,
    pub generated_at: DateTime<Utc>,
}

/// Reading progress of the privileged reader and how far generation has run.
///
/// `last_chapter_generated <= last_chapter_read + buffer_chapters` holds
/// whenever the scheduler is the only caller producing chapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminReadingState {
    pub last_chapter_read: u64,
    pub last_chapter_generated: u64,
    pub buffer_chapters: u64,
    pub auto_generate: bool,
    #[serde(default)]
    pub generation_history: Vec<GenerationEntry>,
}

impl AdminReadingState {
    pub fn new(buffer_chapters: u64, auto_generate: bool) -> Self {
        Self {
            last_chapter_read: 0,
            last_chapter_generated: 0,
            buffer_chapters,
            auto_generate,
            generation_history: Vec::new(),
        }
    }

    pub fn max_allowed_chapter(&self) -> u64 {
        self.last_chapter_read + self.buffer_chapters
    }
}

impl Default for AdminReadingState {
    fn default() -> Self {
        Self::new(10, true)
    }
}

/// Read-only summary handed to external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingProgress {
    pub last_chapter_read: u64,
    pub max_allowed_chapter: u64,
    pub generation_history: Vec<GenerationEntry>,
}
