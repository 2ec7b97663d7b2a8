use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::chapter::ChapterType;

/// Story-level counters mutated by every generation call.
///
/// Duplicate-detection sets live in the uniqueness index rather than here;
/// the tracker only holds what the arc/type state machine and the
/// side-state updates need. Maps are ordered so persisted snapshots are
/// stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryTracker {
    pub generated: u64,
    pub arc_index: usize,
    pub arc_name: String,
    pub chapters_in_arc: u32,
    pub last_type: Option<ChapterType>,
    pub consecutive_vr: u32,
    pub consecutive_real: u32,
    #[serde(default)]
    pub relationships: BTreeMap<String, i32>,
    #[serde(default)]
    pub world_state: BTreeMap<String, i64>,
    #[serde(default)]
    pub quest_progress: BTreeMap<String, u32>,
}

impl StoryTracker {
    pub fn new(first_arc: &str) -> Self {
        Self {
            generated: 0,
            arc_index: 0,
            arc_name: first_arc.to_string(),
            chapters_in_arc: 0,
            last_type: None,
            consecutive_vr: 0,
            consecutive_real: 0,
            relationships: BTreeMap::new(),
            world_state: BTreeMap::new(),
            quest_progress: BTreeMap::new(),
        }
    }

    /// Length of the current run of `chapter_type`.
    pub fn run_length(&self, chapter_type: ChapterType) -> u32 {
        match chapter_type {
            ChapterType::Vr => self.consecutive_vr,
            ChapterType::Real => self.consecutive_real,
        }
    }

    /// Record that a chapter of `chapter_type` was produced.
    pub fn record_type(&mut self, chapter_type: ChapterType) {
        match chapter_type {
            ChapterType::Vr => {
                self.consecutive_vr += 1;
                self.consecutive_real = 0;
            }
            ChapterType::Real => {
                self.consecutive_real += 1;
                self.consecutive_vr = 0;
            }
        }
        self.last_type = Some(chapter_type);
    }

    pub fn next_chapter(&self) -> u64 {
        self.generated + 1
    }
}
