use serde::{Deserialize, Serialize};

use super::chapter::ChapterType;

/// The paragraph category taxonomy.
///
/// A category decides which paragraph templates a chapter draws from. It
/// separates WHAT a paragraph is doing in the story from the words used to
/// express it, which live in the content pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Exploration,
    Combat,
    Introspection,
    Lore,
    Social,
    Flashback,
    RelationshipMoment,
    WorldEvent,
    PowerGrowth,
    ItemExtraction,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::Exploration,
        Category::Combat,
        Category::Introspection,
        Category::Lore,
        Category::Social,
        Category::Flashback,
        Category::RelationshipMoment,
        Category::WorldEvent,
        Category::PowerGrowth,
        Category::ItemExtraction,
    ];

    /// Snake-case name, used for grammar rule prefixes and template pools.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exploration => "exploration",
            Self::Combat => "combat",
            Self::Introspection => "introspection",
            Self::Lore => "lore",
            Self::Social => "social",
            Self::Flashback => "flashback",
            Self::RelationshipMoment => "relationship_moment",
            Self::WorldEvent => "world_event",
            Self::PowerGrowth => "power_growth",
            Self::ItemExtraction => "item_extraction",
        }
    }

    /// Tag string used for grammar gating (e.g., "cat:combat").
    pub fn tag(&self) -> String {
        format!("cat:{}", self.name())
    }

    /// Name of the pool holding this category's paragraph templates.
    pub fn template_pool(&self) -> String {
        format!("templates.{}", self.name())
    }

    pub fn from_name(name: &str) -> Option<Category> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Whether paragraphs of this category belong in a chapter of the
    /// given type. Lore and social scenes happen on both sides of the
    /// headset.
    pub fn fits(&self, chapter_type: ChapterType) -> bool {
        match self {
            Self::Lore | Self::Social => true,
            Self::Exploration | Self::Combat | Self::PowerGrowth | Self::ItemExtraction => {
                chapter_type == ChapterType::Vr
            }
            Self::Introspection | Self::Flashback | Self::RelationshipMoment | Self::WorldEvent => {
                chapter_type == ChapterType::Real
            }
        }
    }

    /// Categories that share no content with this one, in fallback order.
    ///
    /// Fallback walks the taxonomy starting just after `self` so that two
    /// exhausted neighbours do not keep bouncing between each other.
    pub fn fallbacks(&self) -> impl Iterator<Item = Category> {
        let start = Self::ALL.iter().position(|c| c == self).unwrap_or(0);
        (1..Self::ALL.len()).map(move |offset| Self::ALL[(start + offset) % Self::ALL.len()])
    }
}
