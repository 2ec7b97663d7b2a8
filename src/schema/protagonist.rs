use serde::{Deserialize, Serialize};

use super::category::Category;
use super::chapter::ChapterType;

/// Pronoun set for the protagonist, used by grammar expansion to resolve
/// `{mc.subject}`, `{mc.object}` and `{mc.possessive}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pronouns {
    /// she/her/her
    SheHer,
    /// he/him/his
    HeHim,
    /// they/them/their
    TheyThem,
}

impl Default for Pronouns {
    fn default() -> Self {
        Self::TheyThem
    }
}

impl Pronouns {
    pub fn subject(&self) -> &'static str {
        match self {
            Self::SheHer => "she",
            Self::HeHim => "he",
            Self::TheyThem => "they",
        }
    }

    pub fn object(&self) -> &'static str {
        match self {
            Self::SheHer => "her",
            Self::HeHim => "him",
            Self::TheyThem => "them",
        }
    }

    pub fn possessive(&self) -> &'static str {
        match self {
            Self::SheHer => "her",
            Self::HeHim => "his",
            Self::TheyThem => "their",
        }
    }
}

const EXPERIENCE_PER_LEVEL: u64 = 100;

/// Protagonist stat block. Every field only grows as chapters are produced;
/// `Protagonist::new` is the state `reset()` returns to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protagonist {
    pub name: String,
    pub pronouns: Pronouns,
    pub level: u32,
    pub experience: u64,
    pub hp: u32,
    pub max_hp: u32,
    pub mp: u32,
    pub max_mp: u32,
    pub resource_name: String,
    pub resource: u32,
    pub max_resource: u32,
    pub strength: u32,
    pub agility: u32,
    pub intelligence: u32,
}

impl Protagonist {
    pub fn new(name: &str, pronouns: Pronouns, resource_name: &str) -> Self {
        let mut mc = Self {
            name: name.to_string(),
            pronouns,
            level: 1,
            experience: 0,
            hp: 0,
            max_hp: 0,
            mp: 0,
            max_mp: 0,
            resource_name: resource_name.to_string(),
            resource: 0,
            max_resource: 10,
            strength: 5,
            agility: 5,
            intelligence: 5,
        };
        mc.recompute();
        mc
    }

    /// Apply one chapter's growth.
    ///
    /// Growth is a pure function of the chapter's type, arc position and the
    /// categories of the paragraphs it contained, so a replay from the same
    /// seed always lands on the same numbers.
    pub fn advance(&mut self, chapter_type: ChapterType, arc_index: usize, categories: &[Category]) {
        let arc_bonus = arc_index as u64 * 5;
        self.experience += match chapter_type {
            ChapterType::Vr => 20 + arc_bonus,
            ChapterType::Real => 5,
        };

        for category in categories {
            match category {
                Category::Combat => {
                    self.strength += 1;
                    self.agility += 1;
                    self.experience += 12;
                }
                Category::PowerGrowth => {
                    self.intelligence += 1;
                    self.max_resource += 5;
                    self.experience += 15;
                }
                Category::Exploration => {
                    self.agility += 1;
                    self.experience += 8;
                }
                Category::ItemExtraction => {
                    self.intelligence += 1;
                    self.experience += 10;
                }
                Category::Lore => {
                    self.experience += 6;
                }
                Category::Introspection
                | Category::Social
                | Category::Flashback
                | Category::RelationshipMoment
                | Category::WorldEvent => {
                    self.experience += 3;
                }
            }
        }

        let level = 1 + (self.experience / EXPERIENCE_PER_LEVEL) as u32;
        if level > self.level {
            self.max_resource += 2 * (level - self.level);
            self.level = level;
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        let level_bonus = self.level.saturating_sub(1);
        self.max_hp = 100 + level_bonus * 12 + self.strength * 3;
        self.max_mp = 50 + level_bonus * 8 + self.intelligence * 3;
        // The protagonist rests between chapters.
        self.hp = self.max_hp;
        self.mp = self.max_mp;
        self.resource = self.max_resource;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Protagonist {
        Protagonist::new("Kai", Pronouns::TheyThem, "Aether")
    }

    #[test]
    fn initial_stats() {
        let mc = fresh();
        assert_eq!(mc.level, 1);
        assert_eq!(mc.max_hp, 115);
        assert_eq!(mc.hp, mc.max_hp);
        assert_eq!(mc.max_mp, 65);
        assert_eq!(mc.resource, 10);
    }

    #[test]
    fn combat_grows_body_stats() {
        let mut mc = fresh();
        mc.advance(ChapterType::Vr, 0, &[Category::Combat, Category::Combat]);
        assert_eq!(mc.strength, 7);
        assert_eq!(mc.agility, 7);
        assert_eq!(mc.experience, 44);
    }

    #[test]
    fn levels_follow_experience() {
        let mut mc = fresh();
        for _ in 0..5 {
            mc.advance(ChapterType::Vr, 1, &[Category::PowerGrowth]);
        }
        // 5 * (25 + 15) = 200 experience.
        assert_eq!(mc.experience, 200);
        assert_eq!(mc.level, 3);
        assert_eq!(mc.max_resource, 10 + 25 + 4);
    }

    #[test]
    fn growth_is_monotonic() {
        let mut mc = fresh();
        let mut previous = mc.clone();
        let mix = [Category::Social, Category::Lore, Category::Combat];
        for i in 0..40 {
            let ty = if i % 3 == 0 { ChapterType::Real } else { ChapterType::Vr };
            mc.advance(ty, i / 10, &mix[..(i % 3) + 1]);
            assert!(mc.level >= previous.level);
            assert!(mc.max_hp >= previous.max_hp);
            assert!(mc.max_mp >= previous.max_mp);
            assert!(mc.max_resource >= previous.max_resource);
            assert!(mc.strength >= previous.strength);
            previous = mc.clone();
        }
    }

    #[test]
    fn pronoun_forms() {
        assert_eq!(Pronouns::SheHer.subject(), "she");
        assert_eq!(Pronouns::HeHim.possessive(), "his");
        assert_eq!(Pronouns::TheyThem.object(), "them");
    }
}
