/// The chapter generator: arc/type state → title → paragraphs → commit.
///
/// Built via `ChapterGenerator::builder()`, which must be given a
/// [`PoolProvider`], a [`UniquenessChecker`] and a grammar. Every chapter
/// is composed against clones of the tracker and protagonist and registered
/// with the uniqueness layer under a checkpoint; nothing becomes visible
/// until the whole chapter succeeds, so a failed or interrupted chapter
/// leaves the generator exactly as it was.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::core::arc::{choose_type, plan_categories, step_arc};
use crate::core::config::{ArcSpec, ConfigError, EngineConfig};
use crate::core::directives::DirectiveQueue;
use crate::core::expansion::{ExpansionContext, ExpansionReason, PoolProvider, PoolUpdate};
use crate::core::grammar::{GrammarError, GrammarSet, SelectionContext, Template, TemplateSegment};
use crate::core::persistence::{keys, Persistence};
use crate::core::pools::{Pool, PoolError, PoolStats};
use crate::core::uniqueness::{split_sentences, ChapterValidation, UniquenessChecker, UniquenessStats};
use crate::core::variety::VarietyPass;
use crate::schema::category::Category;
use crate::schema::chapter::{count_words, ChapterId, ChapterRecord, ChapterType};
use crate::schema::directive::Directive;
use crate::schema::protagonist::Protagonist;
use crate::schema::tracker::StoryTracker;

pub const ADJECTIVES: &str = "adjectives";
pub const NOUNS: &str = "nouns";
pub const ACTIONS: &str = "actions";
pub const COMPANIONS: &str = "companions";
pub const TITLE_PATTERNS: &str = "title_patterns";
pub const CURATED_TITLES: &str = "curated_titles";

/// Rule that weaves a directive into the paragraph hosting it.
pub const DIRECTIVE_RULE: &str = "directive_weave";

/// Story fields set while composing. `body` exists only inside paragraph
/// skeletons and `directive` only inside the directive weave.
pub const STORY_FIELDS: [&str; 6] = ["setting", "arc", "chapter", "companion", "directive", "body"];

const WORD_POOLS: [&str; 3] = [ADJECTIVES, NOUNS, ACTIONS];

/// Pools a generator cannot run without (template pools come on top).
pub const REQUIRED_POOLS: [&str; 8] = [
    ADJECTIVES,
    NOUNS,
    ACTIONS,
    COMPANIONS,
    TITLE_PATTERNS,
    CURATED_TITLES,
    "vr_settings",
    "real_settings",
];

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),
    #[error("required pool not registered: {0}")]
    MissingPool(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("grammar error: {0}")]
    Grammar(#[from] GrammarError),
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("chapter {requested} requested but the next chapter is {expected}")]
    OutOfSequence { requested: u64, expected: u64 },
    #[error("no unique title could be produced for chapter {0}")]
    TitleExhausted(u64),
    #[error("every paragraph category is exhausted for chapter {0}")]
    AllCategoriesExhausted(u64),
}

/// Counters that make retry pressure visible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorStats {
    pub chapters_generated: u64,
    pub title_retries: u64,
    pub paragraph_retries: u64,
    /// Times a bounded retry loop ran out.
    pub retry_exhaustions: u64,
    pub category_fallbacks: u64,
    /// Chapters that could not carry their due directive; it stays pending.
    #[serde(default)]
    pub directive_deferrals: u64,
    /// Expansions requested by the generator or triggered by a commit.
    pub pool_expansions: u64,
    pub failed_generations: u64,
}

/// Working state for one chapter. Dropped on failure, folded into the
/// generator on success.
struct Draft {
    number: u64,
    arc: ArcSpec,
    tracker: StoryTracker,
    mc: Protagonist,
    chapter_type: ChapterType,
    setting: String,
    companion: String,
    directive_id: Option<u64>,
    touched_pools: BTreeSet<String>,
}

impl Draft {
    fn expansion_context(&self, reason: ExpansionReason) -> ExpansionContext {
        ExpansionContext::new(self.number, &self.arc.name, reason)
    }
}

pub struct ChapterGenerator {
    config: EngineConfig,
    grammar: GrammarSet,
    pools: Box<dyn PoolProvider>,
    uniqueness: Box<dyn UniquenessChecker>,
    persistence: Option<Persistence>,
    tracker: StoryTracker,
    mc: Protagonist,
    directives: DirectiveQueue,
    chapters: BTreeMap<u64, ChapterRecord>,
    stats: GeneratorStats,
}

/// Builder for constructing a `ChapterGenerator`.
pub struct ChapterGeneratorBuilder {
    config: EngineConfig,
    grammar: Option<GrammarSet>,
    pools: Option<Box<dyn PoolProvider>>,
    uniqueness: Option<Box<dyn UniquenessChecker>>,
    persistence: Option<Persistence>,
}

impl ChapterGeneratorBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn with_grammar(mut self, grammar: GrammarSet) -> Self {
        self.grammar = Some(grammar);
        self
    }

    pub fn with_pools(mut self, pools: Box<dyn PoolProvider>) -> Self {
        self.pools = Some(pools);
        self
    }

    pub fn with_uniqueness(mut self, uniqueness: Box<dyn UniquenessChecker>) -> Self {
        self.uniqueness = Some(uniqueness);
        self
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn build(self) -> Result<ChapterGenerator, GeneratorError> {
        self.config.validate()?;
        let pools = self
            .pools
            .ok_or(GeneratorError::MissingDependency("pool provider"))?;
        let uniqueness = self
            .uniqueness
            .ok_or(GeneratorError::MissingDependency("uniqueness checker"))?;
        let grammar = self.grammar.ok_or(GeneratorError::MissingDependency("grammar"))?;

        let template_pools = Category::ALL.iter().map(|c| c.template_pool());
        for name in REQUIRED_POOLS.iter().map(|s| s.to_string()).chain(template_pools) {
            if pools.pool(&name).is_none() {
                return Err(GeneratorError::MissingPool(name));
            }
        }
        let body_rules = Category::ALL.iter().map(|c| format!("{}_body", c.name()));
        for rule in body_rules.chain(std::iter::once(DIRECTIVE_RULE.to_string())) {
            if !grammar.rules.contains_key(&rule) {
                return Err(GeneratorError::Grammar(GrammarError::RuleNotFound(rule)));
            }
        }

        let mut generator = ChapterGenerator {
            tracker: StoryTracker::new(""),
            mc: initial_protagonist(&self.config),
            config: self.config,
            grammar,
            pools,
            uniqueness,
            persistence: self.persistence,
            directives: DirectiveQueue::new(),
            chapters: BTreeMap::new(),
            stats: GeneratorStats::default(),
        };
        generator.tracker = generator.initial_tracker();
        Ok(generator)
    }
}

fn initial_protagonist(config: &EngineConfig) -> Protagonist {
    Protagonist::new(
        &config.generator.protagonist_name,
        config.generator.protagonist_pronouns,
        &config.generator.special_resource,
    )
}

/// Capitalize every word except short joiners that are not first.
pub fn title_case(title: &str) -> String {
    const SMALL: [&str; 10] = ["a", "an", "and", "at", "in", "of", "on", "the", "to", "beneath"];
    title
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            let lower = word.to_lowercase();
            if i > 0 && SMALL.contains(&lower.as_str()) {
                return lower;
            }
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fold a directive into one clause so the weave rule sets it inside a
/// sentence of its own making rather than repeating the directive's
/// sentences verbatim.
fn directive_clause(text: &str) -> String {
    split_sentences(text)
        .into_iter()
        .map(|s| s.trim_end_matches(['.', '!', '?']).trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Relationship, world and quest bookkeeping for a finished chapter.
fn record_side_state(
    tracker: &mut StoryTracker,
    chapter_type: ChapterType,
    companion: &str,
    categories: &[Category],
) {
    let type_key = match chapter_type {
        ChapterType::Vr => "vr_chapters",
        ChapterType::Real => "real_chapters",
    };
    *tracker.world_state.entry(type_key.to_string()).or_insert(0) += 1;

    for category in categories {
        match category {
            Category::RelationshipMoment => {
                *tracker.relationships.entry(companion.to_string()).or_insert(0) += 2;
            }
            Category::Social => {
                *tracker.relationships.entry(companion.to_string()).or_insert(0) += 1;
            }
            Category::WorldEvent => {
                *tracker.world_state.entry("world_events".to_string()).or_insert(0) += 1;
            }
            Category::Combat | Category::Exploration | Category::ItemExtraction => {
                let arc = tracker.arc_name.clone();
                *tracker.quest_progress.entry(arc).or_insert(0) += 1;
            }
            _ => {}
        }
    }
}

impl ChapterGenerator {
    pub fn builder() -> ChapterGeneratorBuilder {
        ChapterGeneratorBuilder {
            config: EngineConfig::default(),
            grammar: None,
            pools: None,
            uniqueness: None,
            persistence: None,
        }
    }

    fn initial_tracker(&self) -> StoryTracker {
        let first = self.config.arcs.first().map(|a| a.name.as_str()).unwrap_or("");
        StoryTracker::new(first)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.config.seed
    }

    pub fn next_chapter_number(&self) -> u64 {
        self.tracker.next_chapter()
    }

    pub fn generated_count(&self) -> u64 {
        self.tracker.generated
    }

    pub fn tracker(&self) -> &StoryTracker {
        &self.tracker
    }

    pub fn protagonist(&self) -> &Protagonist {
        &self.mc
    }

    pub fn chapter(&self, number: u64) -> Option<&ChapterRecord> {
        self.chapters.get(&number)
    }

    /// Every chapter held in memory, in order.
    pub fn chapters(&self) -> impl Iterator<Item = &ChapterRecord> {
        self.chapters.values()
    }

    pub fn latest_chapter(&self) -> Option<&ChapterRecord> {
        self.chapters.values().next_back()
    }

    /// Queue a directive for the chapter `delay_chapters` after the last one
    /// produced.
    pub fn add_directive(&mut self, text: &str, delay_chapters: u64) -> Directive {
        let directive = self
            .directives
            .add(text, delay_chapters, self.tracker.generated);
        if let Some(persistence) = &self.persistence {
            persistence.save(keys::DIRECTIVES, &self.directives);
        }
        directive
    }

    pub fn directives(&self) -> &DirectiveQueue {
        &self.directives
    }

    pub fn stats(&self) -> &GeneratorStats {
        &self.stats
    }

    pub fn uniqueness_stats(&self) -> UniquenessStats {
        self.uniqueness.stats()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.pool_stats()
    }

    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.pool(name)
    }

    /// Expand a pool on request, outside of any chapter.
    pub fn expand_pool(&mut self, name: &str) -> Result<usize, GeneratorError> {
        let context = ExpansionContext::new(
            self.tracker.generated,
            &self.tracker.arc_name,
            ExpansionReason::Manual,
        );
        let added = self.pools.expand_pool(name, &context)?;
        if added > 0 {
            self.stats.pool_expansions += 1;
        }
        let updates = self.pools.sync_to_consumer();
        self.persist_pools(updates.iter().map(|u| &u.pool));
        Ok(added)
    }

    /// Audit a candidate chapter against everything produced so far.
    pub fn validate_chapter(&self, chapter: &ChapterRecord) -> ChapterValidation {
        self.uniqueness.validate_chapter(chapter)
    }

    /// Produce the next chapter. `number`, if given, must be the next one.
    pub fn generate_chapter(&mut self, number: Option<u64>) -> Result<ChapterRecord, GeneratorError> {
        let expected = self.tracker.next_chapter();
        if let Some(requested) = number {
            if requested != expected {
                return Err(GeneratorError::OutOfSequence { requested, expected });
            }
        }

        let checkpoint = self.uniqueness.checkpoint();
        match self.compose_chapter(expected) {
            Ok((record, draft)) => {
                self.commit(&record, draft);
                Ok(record)
            }
            Err(e) => {
                self.uniqueness.rollback(checkpoint);
                self.stats.failed_generations += 1;
                tracing::warn!(chapter = expected, error = %e, "chapter generation failed");
                Err(e)
            }
        }
    }

    fn compose_chapter(&mut self, number: u64) -> Result<(ChapterRecord, Draft), GeneratorError> {
        let mut rng = StdRng::seed_from_u64(
            self.config.seed.wrapping_add(number.wrapping_mul(7919)), // prime stride per chapter
        );

        let mut tracker = self.tracker.clone();
        let arc = step_arc(&mut tracker, &self.config.arcs).clone();
        let chapter_type = choose_type(
            &tracker,
            &arc,
            self.config.generator.max_consecutive_type,
            &mut rng,
        );
        tracker.record_type(chapter_type);
        tracker.generated = number;

        let setting = self.sample_required(chapter_type.settings_pool(), &mut rng)?;
        let companion = self.sample_required(COMPANIONS, &mut rng)?;
        let mut directive = self.directives.next_due(number).cloned();

        let mut draft = Draft {
            number,
            arc,
            tracker,
            mc: self.mc.clone(),
            chapter_type,
            setting,
            companion,
            directive_id: directive.as_ref().map(|d| d.id),
            touched_pools: BTreeSet::new(),
        };

        let title = self.unique_title(&mut draft, &mut rng)?;

        let mut plan = plan_categories(
            &draft.arc,
            chapter_type,
            self.config.generator.planned_paragraphs,
            &mut rng,
        );
        let host_index = directive.as_ref().map(|_| {
            let host = match chapter_type {
                ChapterType::Vr => Category::Exploration,
                ChapterType::Real => Category::WorldEvent,
            };
            if plan.is_empty() {
                plan.push(host);
                0
            } else {
                let index = 1.min(plan.len() - 1);
                plan[index] = host;
                index
            }
        });

        let mut paragraphs: Vec<String> = Vec::with_capacity(plan.len() + 4);
        let mut categories: Vec<Category> = Vec::with_capacity(plan.len() + 4);
        let mut words = 0;
        for (index, planned) in plan.iter().enumerate() {
            let weave = match (&directive, host_index) {
                (Some(d), Some(host)) if host == index => Some(directive_clause(&d.text)),
                _ => None,
            };
            let (used, text) = match self.paragraph_with_fallback(
                &mut draft,
                *planned,
                weave.as_deref(),
                &mut rng,
            ) {
                Err(GeneratorError::AllCategoriesExhausted(_)) if weave.is_some() => {
                    // The directive waits for a later chapter instead of
                    // blocking this one.
                    self.stats.directive_deferrals += 1;
                    tracing::warn!(
                        chapter = number,
                        directive = directive.as_ref().map(|d| d.id),
                        "directive could not be woven, deferring it"
                    );
                    directive = None;
                    draft.directive_id = None;
                    self.paragraph_with_fallback(&mut draft, *planned, None, &mut rng)?
                }
                other => other?,
            };
            words += count_words(&[text.as_str()]);
            paragraphs.push(text);
            categories.push(used);
        }

        // Pad to the word floor.
        while words < self.config.generator.min_words {
            let last = categories.last().copied();
            let next = plan_categories(&draft.arc, chapter_type, 2, &mut rng)
                .into_iter()
                .find(|c| Some(*c) != last)
                .unwrap_or(Category::Lore);
            let (used, text) = self.paragraph_with_fallback(&mut draft, next, None, &mut rng)?;
            words += count_words(&[text.as_str()]);
            paragraphs.push(text);
            categories.push(used);
        }

        draft
            .mc
            .advance(chapter_type, draft.tracker.arc_index, &categories);
        record_side_state(&mut draft.tracker, chapter_type, &draft.companion, &categories);

        let record = ChapterRecord {
            id: ChapterId::new(),
            number,
            title,
            paragraphs,
            word_count: words,
            arc: draft.arc.name.clone(),
            chapter_type,
            setting: draft.setting.clone(),
            categories,
            directives: directive.map(|d| vec![d.text]).unwrap_or_default(),
            mc_snapshot: draft.mc.clone(),
            created_at: Utc::now(),
        };
        Ok((record, draft))
    }

    fn commit(&mut self, record: &ChapterRecord, draft: Draft) {
        self.uniqueness.commit();
        self.tracker = draft.tracker;
        self.mc = draft.mc;
        if let Some(id) = draft.directive_id {
            self.directives.mark_incorporated(id, record.number);
        }
        self.chapters.insert(record.number, record.clone());
        self.stats.chapters_generated += 1;

        let context = ExpansionContext::new(record.number, &record.arc, ExpansionReason::Periodic);
        if self.pools.chapter_committed(&context) > 0 {
            self.stats.pool_expansions += 1;
        }
        let updates = self.pools.sync_to_consumer();
        self.persist_chapter(record, &draft.touched_pools, &updates);

        tracing::info!(
            chapter = record.number,
            title = %record.title,
            words = record.word_count,
            arc = %record.arc,
            chapter_type = ?record.chapter_type,
            "chapter committed"
        );
    }

    fn persist_chapter(
        &self,
        record: &ChapterRecord,
        touched: &BTreeSet<String>,
        updates: &[PoolUpdate],
    ) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        persistence.save(&keys::chapter(record.number), record);
        persistence.save(keys::TRACKER, &self.tracker);
        persistence.save(keys::PROTAGONIST, &self.mc);
        persistence.save(keys::DIRECTIVES, &self.directives);
        persistence.save(keys::GENERATOR_STATS, &self.stats);
        persistence.save(keys::UNIQUENESS_STATS, &self.uniqueness.stats());
        self.persist_pools(touched.iter().chain(updates.iter().map(|u| &u.pool)));
    }

    fn persist_pools<'a>(&self, names: impl Iterator<Item = &'a String>) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let names: BTreeSet<&String> = names.collect();
        for name in names {
            if let Some(pool) = self.pools.pool(name) {
                persistence.save(&keys::pool(name), pool);
            }
        }
    }

    fn sample_required(&self, pool: &str, rng: &mut StdRng) -> Result<String, GeneratorError> {
        self.pools
            .sample(pool, rng)
            .ok_or_else(|| GeneratorError::Pool(PoolError::Exhausted(pool.to_string())))
    }

    fn selection_context<'a>(&'a self, draft: &'a Draft) -> SelectionContext<'a> {
        let mut ctx = SelectionContext::new(self.pools.as_source());
        ctx.mc = Some(&draft.mc);
        ctx.tags.insert(draft.chapter_type.tag().to_string());
        ctx.tags.insert(draft.arc.tag());
        ctx.story.insert("setting".to_string(), draft.setting.clone());
        ctx.story.insert("arc".to_string(), draft.arc.name.clone());
        ctx.story.insert("chapter".to_string(), draft.number.to_string());
        ctx.story.insert("companion".to_string(), draft.companion.clone());
        ctx
    }

    fn expand_pools(&mut self, draft: &Draft, names: &[&str]) {
        let context = draft.expansion_context(ExpansionReason::Requested);
        for name in names {
            match self.pools.expand_pool(name, &context) {
                Ok(0) => {}
                Ok(_) => self.stats.pool_expansions += 1,
                Err(e) => tracing::warn!(pool = *name, error = %e, "requested expansion failed"),
            }
        }
    }

    // -- titles ---------------------------------------------------------

    fn unique_title(&mut self, draft: &mut Draft, rng: &mut StdRng) -> Result<String, GeneratorError> {
        let dynamic = rng.gen_bool(self.config.generator.dynamic_title_probability);
        if !dynamic {
            if let Some(title) = self.curated_title(draft, rng)? {
                return Ok(title);
            }
            tracing::debug!(chapter = draft.number, "curated titles exhausted, composing one");
        }

        let max_retries = self.config.generator.max_retries;
        for round in 0..2 {
            for _ in 0..max_retries {
                if let Some(title) = self.compose_title(draft, rng)? {
                    if self.uniqueness.validate_title(&title).is_valid() {
                        return Ok(title);
                    }
                }
                self.stats.title_retries += 1;
            }
            self.stats.retry_exhaustions += 1;
            if round == 0 {
                tracing::debug!(chapter = draft.number, "title retries exhausted, expanding title pools");
                self.expand_pools(draft, &[ADJECTIVES, NOUNS, ACTIONS, TITLE_PATTERNS]);
            }
        }
        tracing::warn!(chapter = draft.number, "no unique title after expansion");
        Err(GeneratorError::TitleExhausted(draft.number))
    }

    fn curated_title(
        &mut self,
        draft: &mut Draft,
        rng: &mut StdRng,
    ) -> Result<Option<String>, GeneratorError> {
        let context = draft.expansion_context(ExpansionReason::Proactive);
        for _ in 0..self.config.generator.max_retries {
            let title = match self.pools.draw(CURATED_TITLES, &context, rng) {
                Ok(title) => title,
                Err(PoolError::Exhausted(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            draft.touched_pools.insert(CURATED_TITLES.to_string());
            if self.uniqueness.validate_title(&title).is_valid() {
                return Ok(Some(title));
            }
            self.stats.title_retries += 1;
        }
        Ok(None)
    }

    /// Fill a title pattern. Pool slots consume their word; any other slot
    /// expands through the grammar. `None` when a slot's pool ran dry.
    fn compose_title(
        &mut self,
        draft: &mut Draft,
        rng: &mut StdRng,
    ) -> Result<Option<String>, GeneratorError> {
        let pattern = self.sample_required(TITLE_PATTERNS, rng)?;
        let template = Template::parse(&pattern)?;

        let context = draft.expansion_context(ExpansionReason::Proactive);
        let mut drawn = Vec::new();
        for pool in template.pool_refs() {
            match self.pools.draw(pool, &context, rng) {
                Ok(word) => drawn.push(word),
                Err(PoolError::Exhausted(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            draft.touched_pools.insert(pool.to_string());
        }

        let ctx = self.selection_context(draft);
        let mut words = drawn.into_iter();
        let mut title = String::new();
        for segment in &template.segments {
            match segment {
                TemplateSegment::PoolRef(_) => title.push_str(&words.next().unwrap_or_default()),
                other => {
                    let single = Template {
                        segments: vec![other.clone()],
                    };
                    title.push_str(&self.grammar.expand_template(&single, &ctx, rng)?);
                }
            }
        }
        Ok(Some(title_case(&VarietyPass::apply(&title))))
    }

    // -- paragraphs -----------------------------------------------------

    /// Generate a paragraph for `planned`, falling back through the other
    /// categories (those fitting the chapter type first) when it is
    /// exhausted.
    fn paragraph_with_fallback(
        &mut self,
        draft: &mut Draft,
        planned: Category,
        directive: Option<&str>,
        rng: &mut StdRng,
    ) -> Result<(Category, String), GeneratorError> {
        let chapter_type = draft.chapter_type;
        let fitting = planned.fallbacks().filter(|c| c.fits(chapter_type));
        let others = planned.fallbacks().filter(|c| !c.fits(chapter_type));
        let order: Vec<Category> = std::iter::once(planned).chain(fitting).chain(others).collect();

        for category in order {
            if let Some(text) = self.unique_paragraph(draft, category, directive, rng)? {
                return Ok((category, text));
            }
            self.stats.category_fallbacks += 1;
            tracing::debug!(
                chapter = draft.number,
                category = category.name(),
                "category exhausted, falling back"
            );
        }
        tracing::warn!(chapter = draft.number, "all paragraph categories exhausted");
        Err(GeneratorError::AllCategoriesExhausted(draft.number))
    }

    /// Bounded retries; on exhaustion the category's template pool and the
    /// word pools are expanded and the retries run once more.
    fn unique_paragraph(
        &mut self,
        draft: &mut Draft,
        category: Category,
        directive: Option<&str>,
        rng: &mut StdRng,
    ) -> Result<Option<String>, GeneratorError> {
        let max_retries = self.config.generator.max_retries;
        for round in 0..2 {
            for _ in 0..max_retries {
                let text = self.compose_paragraph(draft, category, directive, rng)?;
                if self.uniqueness.validate_paragraph(&text).is_valid() {
                    return Ok(Some(text));
                }
                self.stats.paragraph_retries += 1;
            }
            self.stats.retry_exhaustions += 1;
            if round == 0 {
                let template_pool = category.template_pool();
                let mut names: Vec<&str> = vec![template_pool.as_str()];
                names.extend(WORD_POOLS);
                self.expand_pools(draft, &names);
            }
        }
        Ok(None)
    }

    /// One candidate paragraph: body sentences from `<category>_body`, set
    /// into a skeleton from the category's template pool, optionally led
    /// by the directive weave.
    fn compose_paragraph(
        &self,
        draft: &Draft,
        category: Category,
        directive: Option<&str>,
        rng: &mut StdRng,
    ) -> Result<String, GeneratorError> {
        let mut ctx = self.selection_context(draft);
        ctx.tags.insert(category.tag());

        let (lo, hi) = self.config.generator.body_sentences;
        let sentences = rng.gen_range(lo..=hi);
        let body_rule = format!("{}_body", category.name());
        let mut body = Vec::with_capacity(sentences);
        for _ in 0..sentences {
            body.push(self.grammar.expand(&body_rule, &ctx, rng)?);
        }
        ctx.story.insert("body".to_string(), body.join(" "));

        let skeleton = self.sample_required(&category.template_pool(), rng)?;
        let mut text = self
            .grammar
            .expand_template(&Template::parse(&skeleton)?, &ctx, rng)?;

        if let Some(directive) = directive {
            ctx.story.insert("directive".to_string(), directive.to_string());
            let woven = self.grammar.expand(DIRECTIVE_RULE, &ctx, rng)?;
            text = format!("{} {}", woven, text);
        }
        Ok(VarietyPass::apply(&text))
    }

    // -- lifecycle ------------------------------------------------------

    fn reset_in_memory(&mut self) {
        self.tracker = self.initial_tracker();
        self.mc = initial_protagonist(&self.config);
        self.directives.clear();
        self.chapters.clear();
        self.pools.reset();
        self.uniqueness.reset();
        self.stats = GeneratorStats::default();
    }

    /// Reinitialize every piece of story state and drop it from the store.
    pub fn reset(&mut self) {
        self.reset_in_memory();
        if let Some(persistence) = &self.persistence {
            persistence.remove_prefix(keys::CHAPTER_PREFIX);
            persistence.remove_prefix(keys::POOL_PREFIX);
            for key in [
                keys::TRACKER,
                keys::PROTAGONIST,
                keys::DIRECTIVES,
                keys::GENERATOR_STATS,
                keys::UNIQUENESS_STATS,
            ] {
                persistence.remove(key);
            }
        }
        tracing::info!(seed = self.config.seed, "generator reset");
    }

    /// Reload state from the store and rebuild the uniqueness index from
    /// the archived chapters. Returns how many chapters were restored; zero
    /// (and no change) when the store holds no story.
    pub fn resume(&mut self) -> usize {
        let Some(persistence) = self.persistence.clone() else {
            return 0;
        };
        let Some(tracker) = persistence.load::<StoryTracker>(keys::TRACKER) else {
            return 0;
        };

        self.reset_in_memory();
        self.tracker = tracker;
        if let Some(mc) = persistence.load(keys::PROTAGONIST) {
            self.mc = mc;
        }
        if let Some(directives) = persistence.load(keys::DIRECTIVES) {
            self.directives = directives;
        }
        if let Some(stats) = persistence.load(keys::GENERATOR_STATS) {
            self.stats = stats;
        }

        let pools: Vec<Pool> = persistence
            .keys_with_prefix(keys::POOL_PREFIX)
            .iter()
            .filter_map(|key| persistence.load(key))
            .collect();
        self.pools.restore(pools);

        let mut records: Vec<ChapterRecord> = persistence
            .keys_with_prefix(keys::CHAPTER_PREFIX)
            .iter()
            .filter_map(|key| persistence.load(key))
            .collect();
        records.sort_by_key(|r| r.number);
        for record in records {
            self.uniqueness.register_chapter(&record);
            self.chapters.insert(record.number, record);
        }
        self.uniqueness.commit();

        tracing::info!(
            chapters = self.chapters.len(),
            generated = self.tracker.generated,
            "generator resumed from store"
        );
        self.chapters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::content::ContentPack;
    use crate::core::pools::{PoolCategory, PoolSpec};
    use crate::core::uniqueness::HistoricalIndex;

    fn generator(seed: u64) -> ChapterGenerator {
        ContentPack::builtin()
            .unwrap()
            .generator(EngineConfig::default().with_seed(seed), None)
            .unwrap()
    }

    #[test]
    fn builder_requires_dependencies() {
        let pack = ContentPack::builtin().unwrap();
        let result = ChapterGenerator::builder()
            .with_grammar(pack.grammar.clone())
            .with_uniqueness(Box::new(HistoricalIndex::new(Default::default())))
            .build();
        assert!(matches!(
            result,
            Err(GeneratorError::MissingDependency("pool provider"))
        ));

        let result = ChapterGenerator::builder()
            .with_grammar(pack.grammar.clone())
            .with_pools(Box::new(pack.pool_engine(&EngineConfig::default()).unwrap()))
            .build();
        assert!(matches!(
            result,
            Err(GeneratorError::MissingDependency("uniqueness checker"))
        ));
    }

    #[test]
    fn builder_rejects_missing_pools() {
        let pack = ContentPack::builtin().unwrap();
        let engine = crate::core::expansion::PoolExpansionEngine::new(Default::default(), 1);
        let result = ChapterGenerator::builder()
            .with_grammar(pack.grammar.clone())
            .with_pools(Box::new(engine))
            .with_uniqueness(Box::new(HistoricalIndex::new(Default::default())))
            .build();
        assert!(matches!(result, Err(GeneratorError::MissingPool(_))));
    }

    #[test]
    fn first_chapter_shape() {
        let mut generator = generator(42);
        let chapter = generator.generate_chapter(None).unwrap();
        assert_eq!(chapter.number, 1);
        assert_eq!(chapter.arc, "Awakening");
        assert!(chapter.word_count >= 1000);
        assert_eq!(chapter.word_count, count_words(&chapter.paragraphs));
        assert_eq!(chapter.categories.len(), chapter.paragraphs.len());
        assert!(!chapter.title.is_empty());
        assert!(chapter
            .categories
            .iter()
            .all(|c| c.fits(chapter.chapter_type)));
        assert_eq!(generator.generated_count(), 1);
        assert_eq!(generator.chapter(1).map(|c| c.id), Some(chapter.id));
    }

    #[test]
    fn out_of_sequence_is_refused() {
        let mut generator = generator(1);
        assert!(matches!(
            generator.generate_chapter(Some(2)),
            Err(GeneratorError::OutOfSequence { requested: 2, expected: 1 })
        ));
        assert!(generator.generate_chapter(Some(1)).is_ok());
        assert!(generator.generate_chapter(Some(1)).is_err());
        assert_eq!(generator.generated_count(), 1);
    }

    #[test]
    fn protagonist_grows() {
        let mut generator = generator(5);
        let before = generator.protagonist().clone();
        for _ in 0..4 {
            generator.generate_chapter(None).unwrap();
        }
        let after = generator.protagonist();
        assert!(after.level >= before.level);
        assert!(after.experience > before.experience);
        let snapshot = &generator.latest_chapter().unwrap().mc_snapshot;
        assert_eq!(snapshot, after);
    }

    #[test]
    fn type_runs_are_capped() {
        let mut generator = generator(77);
        let mut run = 0;
        let mut last = None;
        for _ in 0..30 {
            let chapter = generator.generate_chapter(None).unwrap();
            if Some(chapter.chapter_type) == last {
                run += 1;
            } else {
                run = 1;
            }
            last = Some(chapter.chapter_type);
            assert!(run <= 3, "run of {} at chapter {}", run, chapter.number);
        }
    }

    #[test]
    fn directive_is_woven_once() {
        let mut generator = generator(9);
        let directive = generator.add_directive("A lighthouse burns on the horizon", 2);
        assert_eq!(directive.target_chapter, 2);
        let first = generator.generate_chapter(None).unwrap();
        assert!(first.directives.is_empty());
        let second = generator.generate_chapter(None).unwrap();
        assert_eq!(second.directives, vec!["A lighthouse burns on the horizon".to_string()]);
        assert!(second.body().contains("A lighthouse burns on the horizon"));
        let third = generator.generate_chapter(None).unwrap();
        assert!(third.directives.is_empty());
        let stored = generator.directives().get(directive.id).unwrap();
        assert_eq!(stored.incorporated_in, Some(2));
    }

    #[test]
    fn side_state_is_tracked() {
        let mut tracker = StoryTracker::new("Awakening");
        record_side_state(
            &mut tracker,
            ChapterType::Real,
            "Mira",
            &[Category::RelationshipMoment, Category::Social, Category::WorldEvent],
        );
        assert_eq!(tracker.relationships.get("Mira"), Some(&3));
        assert_eq!(tracker.world_state.get("world_events"), Some(&1));
        assert_eq!(tracker.world_state.get("real_chapters"), Some(&1));
        record_side_state(&mut tracker, ChapterType::Vr, "Mira", &[Category::Combat]);
        assert_eq!(tracker.quest_progress.get("Awakening"), Some(&1));
    }

    const FIXED_BODIES: [(Category, &str); 10] = [
        (Category::Exploration, "Moss swallowed every signpost along the drowned canal road."),
        (Category::Combat, "Sparks scattered when two sabres clashed beneath flickering torches."),
        (Category::Introspection, "Lying awake, somebody counted regrets instead of sheep until dawn."),
        (Category::Lore, "Scholars claim seven kingdoms once shared a single iron crown."),
        (Category::Social, "Merchants haggled loudly over barrels of pickled herring and rope."),
        (Category::Flashback, "Years earlier, a younger self had buried a tin box under an oak."),
        (Category::RelationshipMoment, "Mira laughed quietly and handed over the last warm dumpling."),
        (Category::WorldEvent, "Newspapers announced that the northern dam finally collapsed overnight."),
        (Category::PowerGrowth, "Golden light pooled inside each palm as new strength settled."),
        (Category::ItemExtraction, "From the ribcage came a glowing shard worth a small fortune."),
    ];

    /// The built-in pack with one fixed paragraph per category, so exactly
    /// ten paragraphs can ever be produced.
    fn fixed_body_pack() -> ContentPack {
        let mut pack = ContentPack::builtin().unwrap();
        let mut ron = String::from("{");
        for (category, text) in FIXED_BODIES {
            ron.push_str(&format!(
                "\"{}_body\": Rule(alternatives: [(weight: 1, text: \"{}\")]),",
                category.name(),
                text
            ));
            pack.pools.insert(
                category.template_pool(),
                PoolSpec::new(PoolCategory::Template, &["{story.body}"]),
            );
        }
        ron.push('}');
        pack.grammar.merge(GrammarSet::parse_ron(&ron).unwrap());
        pack
    }

    fn small_config(planned_paragraphs: usize) -> EngineConfig {
        let mut config = EngineConfig::default().with_seed(11);
        config.generator.min_words = 1;
        config.generator.max_retries = 2;
        config.generator.body_sentences = (1, 1);
        config.generator.planned_paragraphs = planned_paragraphs;
        config.generator.dynamic_title_probability = 0.0;
        config
    }

    #[test]
    fn exhausted_categories_fall_back_then_fail_atomically() {
        let mut generator = fixed_body_pack().generator(small_config(10), None).unwrap();

        let first = generator.generate_chapter(None).unwrap();
        let used: BTreeSet<Category> = first.categories.iter().copied().collect();
        assert_eq!(used.len(), Category::ALL.len());
        // Only six categories fit a chapter type, so at least four
        // paragraphs came from a fallback.
        assert!(generator.stats().category_fallbacks >= 4);

        let tracker = generator.tracker().clone();
        let mc = generator.protagonist().clone();
        let before = generator.uniqueness_stats();
        let exhaustions = generator.stats().retry_exhaustions;

        assert!(matches!(
            generator.generate_chapter(None),
            Err(GeneratorError::AllCategoriesExhausted(2))
        ));
        assert_eq!(generator.tracker(), &tracker);
        assert_eq!(generator.protagonist(), &mc);
        assert_eq!(generator.chapters().count(), 1);
        assert!(generator.chapter(2).is_none());
        let after = generator.uniqueness_stats();
        assert_eq!(
            (after.titles, after.paragraphs, after.sentences),
            (before.titles, before.paragraphs, before.sentences)
        );
        assert!(after.rejected > before.rejected);
        assert!(generator.stats().retry_exhaustions >= exhaustions + 2 * Category::ALL.len() as u64);
        assert_eq!(generator.stats().failed_generations, 1);
        assert_eq!(generator.next_chapter_number(), 2);
    }

    #[test]
    fn title_exhaustion_is_a_hard_failure() {
        let mut pack = fixed_body_pack();
        pack.pools.insert(
            CURATED_TITLES.to_string(),
            PoolSpec::new(PoolCategory::Title, &["Only Title"]),
        );
        pack.pools.insert(
            TITLE_PATTERNS.to_string(),
            PoolSpec::new(PoolCategory::TitlePattern, &["The {pool:nouns}"]),
        );
        pack.pools.insert(NOUNS.to_string(), PoolSpec::new(PoolCategory::Noun, &["gate"]));
        let mut generator = pack.generator(small_config(1), None).unwrap();

        assert_eq!(generator.generate_chapter(None).unwrap().title, "Only Title");
        // Curated titles are gone; the one pattern still has a noun.
        assert_eq!(generator.generate_chapter(None).unwrap().title, "The Gate");

        let titles = generator.uniqueness_stats().titles;
        assert!(matches!(
            generator.generate_chapter(None),
            Err(GeneratorError::TitleExhausted(3))
        ));
        assert_eq!(generator.uniqueness_stats().titles, titles);
        assert_eq!(generator.generated_count(), 2);
        assert!(generator.stats().retry_exhaustions >= 2);
        assert!(generator.stats().title_retries >= 4);
    }

    #[test]
    fn directive_sentences_fold_into_one_clause() {
        assert_eq!(
            directive_clause("Rain falls. The keeper vanishes!  Bells ring"),
            "Rain falls, The keeper vanishes, Bells ring"
        );
        assert_eq!(directive_clause("A storm rolls in."), "A storm rolls in");
    }

    #[test]
    fn repeated_directive_is_woven_again() {
        let text = "Rain falls. The lighthouse keeper vanishes without a trace overnight. Bells ring";
        let mut generator = generator(9);
        generator.add_directive(text, 1);
        let first = generator.generate_chapter(None).unwrap();
        assert_eq!(first.directives, vec![text.to_string()]);

        generator.add_directive(text, 1);
        let second = generator.generate_chapter(None).unwrap();
        assert_eq!(second.directives, vec![text.to_string()]);
        assert_eq!(generator.directives().pending().count(), 0);
        assert_eq!(generator.stats().directive_deferrals, 0);
    }

    #[test]
    fn unweavable_directive_is_deferred() {
        // A weave that is nothing but the directive repeats its sentence.
        let mut pack = ContentPack::builtin().unwrap();
        pack.grammar.merge(
            GrammarSet::parse_ron(
                r#"{ "directive_weave": Rule(alternatives: [(weight: 1, text: "{story.directive}.")]) }"#,
            )
            .unwrap(),
        );
        let mut generator = pack.generator(EngineConfig::default().with_seed(9), None).unwrap();
        let text = "The lighthouse keeper vanishes without a trace overnight";

        generator.add_directive(text, 1);
        let first = generator.generate_chapter(None).unwrap();
        assert_eq!(first.directives, vec![text.to_string()]);

        let again = generator.add_directive(text, 1);
        let second = generator.generate_chapter(None).unwrap();
        assert!(second.directives.is_empty());
        assert_eq!(generator.stats().directive_deferrals, 1);
        assert!(generator.directives().get(again.id).unwrap().is_pending());
        assert_eq!(generator.generated_count(), 2);
    }

    #[test]
    fn title_casing() {
        assert_eq!(title_case("the ashen lantern of  the deep"), "The Ashen Lantern of the Deep");
        assert_eq!(title_case("beneath a  hollow moon"), "Beneath a Hollow Moon");
    }

    #[test]
    fn validate_chapter_flags_a_replay() {
        let mut generator = generator(3);
        let chapter = generator.generate_chapter(None).unwrap();
        let report = generator.validate_chapter(&chapter);
        assert!(!report.valid);
        assert!(!report.duplicates.is_empty());
    }

    #[test]
    fn persistence_archives_chapters() {
        let persistence = Persistence::in_memory();
        let mut generator = ContentPack::builtin()
            .unwrap()
            .generator(EngineConfig::default(), Some(persistence.clone()))
            .unwrap();
        generator.generate_chapter(None).unwrap();
        generator.generate_chapter(None).unwrap();
        let stored: Option<ChapterRecord> = persistence.load(&keys::chapter(2));
        assert_eq!(stored.map(|c| c.number), Some(2));
        let tracker: Option<StoryTracker> = persistence.load(keys::TRACKER);
        assert_eq!(tracker.map(|t| t.generated), Some(2));

        generator.reset();
        assert!(persistence.keys_with_prefix(keys::CHAPTER_PREFIX).is_empty());
        assert_eq!(generator.generated_count(), 0);
        assert!(generator.chapter(1).is_none());
    }
}
