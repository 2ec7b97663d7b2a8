/// Named, append-only collections of reusable fragments.

use rand::rngs::StdRng;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::core::grammar::PoolSource;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool not found: {0}")]
    NotFound(String),
    #[error("pool already registered: {0}")]
    AlreadyRegistered(String),
    #[error("pool '{0}' has no unused items, even after expansion")]
    Exhausted(String),
}

/// What kind of fragment a pool holds. Drives which expansion rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolCategory {
    Adjective,
    Noun,
    Action,
    Place,
    Name,
    TitlePattern,
    Title,
    Template,
}

impl PoolCategory {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Adjective => "adjective",
            Self::Noun => "noun",
            Self::Action => "action",
            Self::Place => "place",
            Self::Name => "name",
            Self::TitlePattern => "title_pattern",
            Self::Title => "title",
            Self::Template => "template",
        }
    }
}

/// Prefixes and suffixes combined with a pool's seed items when
/// synthesizing new ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffixRule {
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub suffixes: Vec<String>,
}

impl AffixRule {
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.suffixes.is_empty()
    }
}

/// Registration payload for a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub category: PoolCategory,
    pub items: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Curated items held back for expansion.
    #[serde(default)]
    pub reserve: Vec<String>,
    #[serde(default)]
    pub affixes: AffixRule,
}

impl PoolSpec {
    pub fn new(category: PoolCategory, items: &[&str]) -> Self {
        Self {
            category,
            items: items.iter().map(|s| s.to_string()).collect(),
            metadata: BTreeMap::new(),
            reserve: Vec::new(),
            affixes: AffixRule::default(),
        }
    }
}

/// Case- and whitespace-insensitive identity of a pool item.
pub fn item_key(item: &str) -> String {
    item.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A named pool. Items are pairwise unique (by [`item_key`]) and are only
/// ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub category: PoolCategory,
    items: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub reserve: Vec<String>,
    pub affixes: AffixRule,
    /// How many items were present at registration; these are the bases for
    /// combinatorial synthesis.
    pub seed_len: usize,
    pub expansion_count: u32,
    pub last_expansion_chapter: Option<u64>,
    used: BTreeSet<usize>,
    #[serde(skip)]
    keys: FxHashSet<String>,
}

impl Pool {
    pub fn new(name: &str, spec: PoolSpec) -> Self {
        let mut pool = Self {
            name: name.to_string(),
            category: spec.category,
            items: Vec::with_capacity(spec.items.len()),
            metadata: spec.metadata,
            reserve: spec.reserve,
            affixes: spec.affixes,
            seed_len: 0,
            expansion_count: 0,
            last_expansion_chapter: None,
            used: BTreeSet::new(),
            keys: FxHashSet::default(),
        };
        pool.append(spec.items);
        pool.seed_len = pool.items.len();
        pool
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, item: &str) -> bool {
        self.keys.contains(&item_key(item))
    }

    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    pub fn available_count(&self) -> usize {
        self.items.len() - self.used.len()
    }

    /// Share of items not yet consumed by [`Pool::draw`]. An empty pool has
    /// nothing available.
    pub fn available_ratio(&self) -> f64 {
        if self.items.is_empty() {
            0.0
        } else {
            self.available_count() as f64 / self.items.len() as f64
        }
    }

    /// Append items, skipping blanks and anything already present.
    /// Returns how many were added.
    pub fn append<I: IntoIterator<Item = String>>(&mut self, items: I) -> usize {
        let mut added = 0;
        for item in items {
            let trimmed = item.trim();
            if trimmed.is_empty() {
                continue;
            }
            if self.keys.insert(item_key(trimmed)) {
                self.items.push(trimmed.to_string());
                added += 1;
            }
        }
        added
    }

    /// Pick any item; does not consume it.
    pub fn sample(&self, rng: &mut StdRng) -> Option<&str> {
        if self.items.is_empty() {
            return None;
        }
        Some(&self.items[rng.gen_range(0..self.items.len())])
    }

    /// Pick an unused item and mark it used.
    pub fn draw(&mut self, rng: &mut StdRng) -> Option<String> {
        let available = self.available_count();
        if available == 0 {
            return None;
        }
        let nth = rng.gen_range(0..available);
        let index = (0..self.items.len())
            .filter(|i| !self.used.contains(i))
            .nth(nth)?;
        self.used.insert(index);
        Some(self.items[index].clone())
    }

    /// Rebuild the lookup index after deserialization.
    pub fn reindex(&mut self) {
        self.keys = self.items.iter().map(|i| item_key(i)).collect();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            item_count: self.items.len(),
            used_items: self.used.len(),
            available_items: self.available_count(),
            available_ratio: self.available_ratio(),
            expansion_count: self.expansion_count,
            last_expansion_chapter: self.last_expansion_chapter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub item_count: usize,
    pub used_items: usize,
    pub available_items: usize,
    pub available_ratio: f64,
    pub expansion_count: u32,
    pub last_expansion_chapter: Option<u64>,
}

/// All registered pools, iterated in registration order.
#[derive(Debug, Clone, Default)]
pub struct PoolRegistry {
    pools: FxHashMap<String, Pool>,
    order: Vec<String>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, spec: PoolSpec) -> Result<(), PoolError> {
        if self.pools.contains_key(name) {
            return Err(PoolError::AlreadyRegistered(name.to_string()));
        }
        self.pools.insert(name.to_string(), Pool::new(name, spec));
        self.order.push(name.to_string());
        Ok(())
    }

    /// Put a previously persisted pool back, replacing any live one.
    pub fn restore(&mut self, mut pool: Pool) {
        pool.reindex();
        if !self.pools.contains_key(&pool.name) {
            self.order.push(pool.name.clone());
        }
        self.pools.insert(pool.name.clone(), pool);
    }

    pub fn get(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Pool, PoolError> {
        self.pools
            .get_mut(name)
            .ok_or_else(|| PoolError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pool> {
        self.order.iter().filter_map(|name| self.pools.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl PoolSource for PoolRegistry {
    fn sample(&self, pool: &str, rng: &mut StdRng) -> Option<String> {
        self.pools.get(pool)?.sample(rng).map(str::to_string)
    }
}
