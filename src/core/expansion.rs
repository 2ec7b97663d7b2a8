/// Pool expansion: keeps the pools growing so uniqueness never starves.
///
/// Two policies run side by side:
/// - periodic: every `periodic_interval` chapters every pool is expanded;
/// - proactive: a pool whose unused share falls below
///   `proactive_threshold` is expanded on the draw that crossed it.
///
/// New items come from a chain of [`ExpansionStrategy`]s tried in order
/// until the batch is full. Whatever a strategy proposes is filtered
/// against the pool before insertion, so no strategy can introduce a
/// duplicate. The batch is appended in one step: readers see the pool
/// either before or after an expansion, never halfway.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rustc_hash::{FxHashSet, FxHasher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::core::config::ExpansionConfig;
use crate::core::grammar::PoolSource;
use crate::core::persistence::{keys, Persistence};
use crate::core::pools::{item_key, Pool, PoolError, PoolRegistry, PoolSpec, PoolStats};

/// Why an expansion happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpansionReason {
    Periodic,
    Proactive,
    /// The generator asked for more material after a category kept failing.
    Requested,
    Manual,
}

/// Where the story is when an expansion runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionContext {
    pub chapter: u64,
    pub arc: String,
    pub reason: ExpansionReason,
}

impl ExpansionContext {
    pub fn new(chapter: u64, arc: &str, reason: ExpansionReason) -> Self {
        Self {
            chapter,
            arc: arc.to_string(),
            reason,
        }
    }

    pub fn manual() -> Self {
        Self::new(0, "", ExpansionReason::Manual)
    }

    pub fn with_reason(&self, reason: ExpansionReason) -> Self {
        Self {
            reason,
            ..self.clone()
        }
    }
}

/// External source of candidate fragments. Implementations may do slow
/// work; the engine waits for the full answer before touching the pool.
pub trait ContentDiscovery: Send {
    fn discover(&self, query: &str, context: &ExpansionContext) -> Vec<String>;
}

/// Discovery backed by a fixed query → candidates table.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    answers: BTreeMap<String, Vec<String>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answer(mut self, query: &str, candidates: &[&str]) -> Self {
        self.answers.insert(
            query.to_string(),
            candidates.iter().map(|s| s.to_string()).collect(),
        );
        self
    }
}

impl ContentDiscovery for StaticDiscovery {
    fn discover(&self, query: &str, _context: &ExpansionContext) -> Vec<String> {
        self.answers.get(query).cloned().unwrap_or_default()
    }
}

/// One way of proposing new pool items.
pub trait ExpansionStrategy: Send {
    fn name(&self) -> &'static str;

    /// Propose up to `wanted` candidates. Duplicates are allowed here; the
    /// engine filters them out.
    fn propose(
        &self,
        pool: &Pool,
        wanted: usize,
        context: &ExpansionContext,
        rng: &mut StdRng,
    ) -> Vec<String>;
}

/// Hands out the pool's curated reserve, in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CuratedReserve;

impl ExpansionStrategy for CuratedReserve {
    fn name(&self) -> &'static str {
        "curated"
    }

    fn propose(
        &self,
        pool: &Pool,
        wanted: usize,
        _context: &ExpansionContext,
        _rng: &mut StdRng,
    ) -> Vec<String> {
        pool.reserve
            .iter()
            .filter(|item| !pool.contains(item))
            .take(wanted)
            .cloned()
            .collect()
    }
}

/// Asks a [`ContentDiscovery`] collaborator. The query is the pool's
/// `query` metadata, or its category name.
pub struct DiscoverySource {
    discovery: Box<dyn ContentDiscovery>,
}

impl DiscoverySource {
    pub fn new(discovery: Box<dyn ContentDiscovery>) -> Self {
        Self { discovery }
    }
}

impl ExpansionStrategy for DiscoverySource {
    fn name(&self) -> &'static str {
        "discovery"
    }

    fn propose(
        &self,
        pool: &Pool,
        wanted: usize,
        context: &ExpansionContext,
        _rng: &mut StdRng,
    ) -> Vec<String> {
        let query = pool
            .metadata
            .get("query")
            .map(String::as_str)
            .unwrap_or(pool.category.name());
        self.discovery
            .discover(query, context)
            .into_iter()
            .filter(|item| !pool.contains(item))
            .take(wanted)
            .collect()
    }
}

/// Combines the pool's seed items with its affix rule: `prefix + item`,
/// `item + suffix`, and `prefix + item + suffix`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CombinatorialSynthesis;

impl ExpansionStrategy for CombinatorialSynthesis {
    fn name(&self) -> &'static str {
        "combinatorial"
    }

    fn propose(
        &self,
        pool: &Pool,
        wanted: usize,
        _context: &ExpansionContext,
        rng: &mut StdRng,
    ) -> Vec<String> {
        if pool.affixes.is_empty() || wanted == 0 {
            return Vec::new();
        }
        let bases_len = if pool.seed_len == 0 { pool.len() } else { pool.seed_len };
        let bases = &pool.items()[..bases_len.min(pool.len())];

        let mut candidates = Vec::new();
        for base in bases {
            for prefix in &pool.affixes.prefixes {
                candidates.push(format!("{}{}", prefix, base));
                for suffix in &pool.affixes.suffixes {
                    candidates.push(format!("{}{}{}", prefix, base, suffix));
                }
            }
            for suffix in &pool.affixes.suffixes {
                candidates.push(format!("{}{}", base, suffix));
            }
        }
        candidates.retain(|c| !pool.contains(c));
        candidates.shuffle(rng);
        candidates.truncate(wanted);
        candidates
    }
}

/// Items appended to a pool since the previous [`PoolProvider::sync_to_consumer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUpdate {
    pub pool: String,
    pub added: Vec<String>,
}

/// What the chapter generator needs from the pool layer.
pub trait PoolProvider: PoolSource + Send {
    /// The provider as the read-only word source grammar expansion uses.
    fn as_source(&self) -> &dyn PoolSource;

    fn pool(&self, name: &str) -> Option<&Pool>;

    /// Consume an unused item, expanding first if the pool is dry.
    fn draw(
        &mut self,
        name: &str,
        context: &ExpansionContext,
        rng: &mut StdRng,
    ) -> Result<String, PoolError>;

    fn expand_pool(&mut self, name: &str, context: &ExpansionContext) -> Result<usize, PoolError>;

    /// Run the periodic policy after a chapter is committed. Returns the
    /// number of items added across all pools.
    fn chapter_committed(&mut self, context: &ExpansionContext) -> usize;

    fn sync_to_consumer(&mut self) -> Vec<PoolUpdate>;

    fn pool_stats(&self) -> Vec<PoolStats>;

    fn restore(&mut self, pools: Vec<Pool>);

    /// Return every pool to its registered contents.
    fn reset(&mut self);
}

/// The default [`PoolProvider`]: a registry plus the expansion policies.
pub struct PoolExpansionEngine {
    registry: PoolRegistry,
    initial: PoolRegistry,
    strategies: Vec<Box<dyn ExpansionStrategy>>,
    config: ExpansionConfig,
    seed: u64,
    pending: BTreeMap<String, Vec<String>>,
    persistence: Option<Persistence>,
    total_added: u64,
}

impl PoolExpansionEngine {
    pub fn new(config: ExpansionConfig, seed: u64) -> Self {
        Self {
            registry: PoolRegistry::new(),
            initial: PoolRegistry::new(),
            strategies: vec![Box::new(CuratedReserve), Box::new(CombinatorialSynthesis)],
            config,
            seed,
            pending: BTreeMap::new(),
            persistence: None,
            total_added: 0,
        }
    }

    /// Insert a discovery step between the curated reserve and synthesis.
    pub fn with_discovery(mut self, discovery: Box<dyn ContentDiscovery>) -> Self {
        let position = self.strategies.len().saturating_sub(1);
        self.strategies
            .insert(position, Box::new(DiscoverySource::new(discovery)));
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<Box<dyn ExpansionStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn register_pool(&mut self, name: &str, spec: PoolSpec) -> Result<(), PoolError> {
        self.registry.register(name, spec.clone())?;
        self.initial.register(name, spec)
    }

    pub fn get_pool(&self, name: &str) -> Option<&Pool> {
        self.registry.get(name)
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    fn expansion_rng(&self, pool: &Pool) -> StdRng {
        let mut hasher = FxHasher::default();
        pool.name.hash(&mut hasher);
        let round = (pool.expansion_count as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        StdRng::seed_from_u64(self.seed ^ hasher.finish() ^ round)
    }

    fn maybe_expand_proactively(&mut self, name: &str, context: &ExpansionContext) {
        let below = self
            .registry
            .get(name)
            .map(|p| p.available_ratio() < self.config.proactive_threshold)
            .unwrap_or(false);
        if below {
            let context = context.with_reason(ExpansionReason::Proactive);
            if let Err(e) = self.expand_pool(name, &context) {
                tracing::warn!(pool = name, error = %e, "proactive expansion failed");
            }
        }
    }
}

impl PoolSource for PoolExpansionEngine {
    fn sample(&self, pool: &str, rng: &mut StdRng) -> Option<String> {
        self.registry.sample(pool, rng)
    }
}

impl PoolProvider for PoolExpansionEngine {
    fn as_source(&self) -> &dyn PoolSource {
        self
    }

    fn pool(&self, name: &str) -> Option<&Pool> {
        self.registry.get(name)
    }

    fn draw(
        &mut self,
        name: &str,
        context: &ExpansionContext,
        rng: &mut StdRng,
    ) -> Result<String, PoolError> {
        if self.registry.get_mut(name)?.available_count() == 0 {
            self.expand_pool(name, &context.with_reason(ExpansionReason::Proactive))?;
        }
        let item = self
            .registry
            .get_mut(name)?
            .draw(rng)
            .ok_or_else(|| PoolError::Exhausted(name.to_string()))?;
        self.maybe_expand_proactively(name, context);
        Ok(item)
    }

    fn expand_pool(&mut self, name: &str, context: &ExpansionContext) -> Result<usize, PoolError> {
        let wanted = self.config.batch_size;
        let pool = self
            .registry
            .get(name)
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;
        let mut rng = self.expansion_rng(pool);

        let mut batch: Vec<String> = Vec::with_capacity(wanted);
        let mut seen: FxHashSet<String> = FxHashSet::default();
        for strategy in &self.strategies {
            if batch.len() >= wanted {
                break;
            }
            let proposals = strategy.propose(pool, wanted - batch.len(), context, &mut rng);
            let before = batch.len();
            for candidate in proposals {
                let trimmed = candidate.trim();
                if trimmed.is_empty() || pool.contains(trimmed) {
                    continue;
                }
                if seen.insert(item_key(trimmed)) {
                    batch.push(trimmed.to_string());
                }
                if batch.len() >= wanted {
                    break;
                }
            }
            tracing::debug!(
                pool = name,
                strategy = strategy.name(),
                added = batch.len() - before,
                "expansion strategy finished"
            );
        }

        let pool = self.registry.get_mut(name)?;
        let added = pool.append(batch.iter().cloned());
        if added > 0 {
            pool.expansion_count += 1;
            pool.last_expansion_chapter = Some(context.chapter);
            self.pending
                .entry(name.to_string())
                .or_default()
                .extend(batch);
            self.total_added += added as u64;
            tracing::info!(
                pool = name,
                added,
                total = pool.len(),
                reason = ?context.reason,
                chapter = context.chapter,
                "pool expanded"
            );
        } else {
            tracing::debug!(pool = name, reason = ?context.reason, "expansion produced nothing new");
        }
        Ok(added)
    }

    fn chapter_committed(&mut self, context: &ExpansionContext) -> usize {
        let interval = self.config.periodic_interval;
        if interval == 0 || context.chapter == 0 || context.chapter % interval != 0 {
            return 0;
        }
        let context = context.with_reason(ExpansionReason::Periodic);
        let names: Vec<String> = self.registry.names().to_vec();
        let mut added = 0;
        for name in names {
            match self.expand_pool(&name, &context) {
                Ok(n) => added += n,
                Err(e) => tracing::warn!(pool = %name, error = %e, "periodic expansion failed"),
            }
        }
        added
    }

    fn sync_to_consumer(&mut self) -> Vec<PoolUpdate> {
        let pending = std::mem::take(&mut self.pending);
        let mut updates = Vec::with_capacity(pending.len());
        for (name, added) in pending {
            if let (Some(persistence), Some(pool)) = (&self.persistence, self.registry.get(&name)) {
                persistence.save(&keys::pool(&name), pool);
            }
            updates.push(PoolUpdate { pool: name, added });
        }
        updates
    }

    fn pool_stats(&self) -> Vec<PoolStats> {
        self.registry.iter().map(Pool::stats).collect()
    }

    fn restore(&mut self, pools: Vec<Pool>) {
        for pool in pools {
            self.registry.restore(pool);
        }
        self.pending.clear();
    }

    fn reset(&mut self) {
        self.registry = self.initial.clone();
        self.pending.clear();
        self.total_added = 0;
    }
}
