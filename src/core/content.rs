/// The pools and grammar a serial is written from.
///
/// A pack is two RON files: `pools.ron` maps pool names to [`PoolSpec`]s and
/// `grammar.ron` holds the rules paragraph skeletons expand through. The
/// built-in pack is compiled into the crate.

use ron::error::SpannedError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::core::config::EngineConfig;
use crate::core::expansion::PoolExpansionEngine;
use crate::core::generator::{
    ChapterGenerator, GeneratorError, DIRECTIVE_RULE, REQUIRED_POOLS, STORY_FIELDS,
};
use crate::core::grammar::{GrammarError, GrammarSet, Template, TemplateSegment, MC_FIELDS};
use crate::core::persistence::Persistence;
use crate::core::pools::{PoolCategory, PoolError, PoolSpec};
use crate::core::uniqueness::HistoricalIndex;
use crate::schema::category::Category;

const BUILTIN_POOLS: &str = include_str!("../../content/pools.ron");
const BUILTIN_GRAMMAR: &str = include_str!("../../content/grammar.ron");

pub const POOLS_FILE: &str = "pools.ron";
pub const GRAMMAR_FILE: &str = "grammar.ron";

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] SpannedError),
    #[error("grammar error: {0}")]
    Grammar(#[from] GrammarError),
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("generator error: {0}")]
    Generator(#[from] GeneratorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One finding from [`ContentPack::lint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintIssue {
    pub severity: Severity,
    /// Rule or pool the issue was found in.
    pub location: String,
    pub message: String,
}

impl LintIssue {
    fn error(location: &str, message: String) -> Self {
        Self {
            severity: Severity::Error,
            location: location.to_string(),
            message,
        }
    }
}

impl fmt::Display for LintIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        write!(f, "{}: {}: {}", label, self.location, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContentPack {
    /// Ordered by name so pools register the same way every run.
    pub pools: BTreeMap<String, PoolSpec>,
    pub grammar: GrammarSet,
}

impl ContentPack {
    pub fn builtin() -> Result<ContentPack, ContentError> {
        Self::parse(BUILTIN_POOLS, BUILTIN_GRAMMAR)
    }

    pub fn parse(pools_ron: &str, grammar_ron: &str) -> Result<ContentPack, ContentError> {
        let pools: BTreeMap<String, PoolSpec> = ron::from_str(pools_ron)?;
        let grammar = GrammarSet::parse_ron(grammar_ron)?;
        Ok(ContentPack { pools, grammar })
    }

    /// Load `pools.ron` and `grammar.ron` from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<ContentPack, ContentError> {
        let pools = std::fs::read_to_string(dir.join(POOLS_FILE))?;
        let grammar = std::fs::read_to_string(dir.join(GRAMMAR_FILE))?;
        let pack = Self::parse(&pools, &grammar)?;
        tracing::info!(
            dir = %dir.display(),
            pools = pack.pools.len(),
            rules = pack.grammar.rules.len(),
            "content pack loaded"
        );
        Ok(pack)
    }

    /// Overlay another pack. Pools and rules from `other` replace ones
    /// with the same name.
    pub fn merge(&mut self, other: ContentPack) {
        self.pools.extend(other.pools);
        self.grammar.merge(other.grammar);
    }

    pub fn pool_engine(&self, config: &EngineConfig) -> Result<PoolExpansionEngine, ContentError> {
        let mut engine = PoolExpansionEngine::new(config.expansion.clone(), config.seed);
        for (name, spec) in &self.pools {
            engine.register_pool(name, spec.clone())?;
        }
        Ok(engine)
    }

    /// Wire a generator over this pack with the default uniqueness index.
    pub fn generator(
        &self,
        config: EngineConfig,
        persistence: Option<Persistence>,
    ) -> Result<ChapterGenerator, ContentError> {
        let mut engine = self.pool_engine(&config)?;
        if let Some(persistence) = &persistence {
            engine = engine.with_persistence(persistence.clone());
        }
        let index = HistoricalIndex::new(config.uniqueness.clone());

        let mut builder = ChapterGenerator::builder()
            .config(config)
            .with_grammar(self.grammar.clone())
            .with_pools(Box::new(engine))
            .with_uniqueness(Box::new(index));
        if let Some(persistence) = persistence {
            builder = builder.with_persistence(persistence);
        }
        Ok(builder.build()?)
    }

    /// Check that every reference in the pack resolves and that the rules a
    /// generator needs are present.
    pub fn lint(&self) -> Vec<LintIssue> {
        let mut issues = Vec::new();
        let error = |issues: &mut Vec<LintIssue>, location: &str, message: &str| {
            issues.push(LintIssue::error(location, message.to_string()))
        };

        for pool in REQUIRED_POOLS {
            if !self.pools.contains_key(pool) {
                error(&mut issues, pool, "required pool is missing");
            }
        }
        for category in Category::ALL {
            let template_pool = category.template_pool();
            if !self.pools.contains_key(&template_pool) {
                error(&mut issues, &template_pool, "template pool is missing");
            }
            let body = format!("{}_body", category.name());
            if !self.grammar.rules.contains_key(&body) {
                error(&mut issues, &body, "body rule is missing");
            }
        }
        match self.grammar.rules.get(DIRECTIVE_RULE) {
            None => error(&mut issues, DIRECTIVE_RULE, "rule is missing"),
            Some(rule) => {
                if !rule.requires.is_empty() || !rule.excludes.is_empty() {
                    error(&mut issues, DIRECTIVE_RULE, "rule must not be gated");
                }
                for alt in &rule.alternatives {
                    let carries = alt.template.segments.iter().any(
                        |s| matches!(s, TemplateSegment::StoryField(f) if f == "directive"),
                    );
                    if !carries {
                        error(&mut issues, DIRECTIVE_RULE, "alternative drops {story.directive}");
                    }
                }
            }
        }

        let mut names: Vec<&String> = self.grammar.rules.keys().collect();
        names.sort();
        for name in names {
            let rule = &self.grammar.rules[name];
            if rule.alternatives.is_empty() {
                error(&mut issues, name, "rule has no alternatives");
            }
            for alt in &rule.alternatives {
                self.lint_template(name, &alt.template, &mut issues);
            }
        }

        for (name, spec) in &self.pools {
            if spec.items.is_empty() {
                issues.push(LintIssue {
                    severity: Severity::Warning,
                    location: name.clone(),
                    message: "pool has no seed items".to_string(),
                });
            }
            if matches!(spec.category, PoolCategory::Template | PoolCategory::TitlePattern) {
                for text in spec.items.iter().chain(&spec.reserve) {
                    match Template::parse(text) {
                        Ok(template) => self.lint_template(name, &template, &mut issues),
                        Err(e) => issues.push(LintIssue::error(name, format!("'{}': {}", text, e))),
                    }
                }
            }
        }

        for cycle in self.rule_cycles() {
            issues.push(LintIssue::error(&cycle[0], format!("rule cycle: {}", cycle.join(" -> "))));
        }
        issues
    }

    fn lint_template(&self, location: &str, template: &Template, issues: &mut Vec<LintIssue>) {
        for segment in &template.segments {
            let problem = match segment {
                TemplateSegment::RuleRef(rule) if !self.grammar.rules.contains_key(rule) => {
                    Some(format!("references unknown rule '{}'", rule))
                }
                TemplateSegment::PoolRef(pool) if !self.pools.contains_key(pool) => {
                    Some(format!("references unknown pool '{}'", pool))
                }
                TemplateSegment::MainCharacter(field) if !MC_FIELDS.contains(&field.as_str()) => {
                    Some(format!("unknown field 'mc.{}'", field))
                }
                TemplateSegment::StoryField(field)
                    if !STORY_FIELDS.contains(&field.as_str()) =>
                {
                    Some(format!("unknown field 'story.{}'", field))
                }
                _ => None,
            };
            if let Some(message) = problem {
                issues.push(LintIssue::error(location, message));
            }
        }
    }

    /// Rule reference cycles, each reported once from its smallest name.
    fn rule_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            grammar: &GrammarSet,
            name: &str,
            marks: &mut HashMap<String, Mark>,
            stack: &mut Vec<String>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            match marks.get(name) {
                Some(Mark::Done) => return,
                Some(Mark::Visiting) => {
                    if let Some(start) = stack.iter().position(|n| n == name) {
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(name.to_string());
                        cycles.push(cycle);
                    }
                    return;
                }
                None => {}
            }
            let Some(rule) = grammar.rules.get(name) else { return };
            marks.insert(name.to_string(), Mark::Visiting);
            stack.push(name.to_string());
            let mut refs: Vec<&str> = rule
                .alternatives
                .iter()
                .flat_map(|alt| alt.template.rule_refs())
                .collect();
            refs.sort_unstable();
            refs.dedup();
            for next in refs {
                visit(grammar, next, marks, stack, cycles);
            }
            stack.pop();
            marks.insert(name.to_string(), Mark::Done);
        }

        let mut names: Vec<&String> = self.grammar.rules.keys().collect();
        names.sort();
        let mut marks = HashMap::new();
        let mut stack = Vec::new();
        let mut cycles = Vec::new();
        for name in names {
            visit(&self.grammar, name, &mut marks, &mut stack, &mut cycles);
        }
        cycles
    }
}
