/// Stochastic grammar runtime — template parsing, RON loading, and expansion.

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::schema::protagonist::Protagonist;

/// Expansion stops descending past this many nested rule references.
pub const MAX_DEPTH: usize = 12;

/// Protagonist fields a template may read as `{mc.<field>}`.
pub const MC_FIELDS: [&str; 12] = [
    "name",
    "subject",
    "object",
    "possessive",
    "level",
    "hp",
    "mp",
    "resource",
    "resource_max",
    "strength",
    "agility",
    "intelligence",
];

#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("template parse error: {0}")]
    TemplateParse(String),
    #[error("rule not found: {0}")]
    RuleNotFound(String),
    #[error("pool unavailable or empty: {0}")]
    PoolUnavailable(String),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("expansion exceeded depth {0}")]
    DepthExceeded(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

/// A segment of a parsed template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TemplateSegment {
    /// Literal text, emitted as-is.
    Literal(String),
    /// Reference to another grammar rule: `{rule_name}`.
    RuleRef(String),
    /// A word drawn from a content pool: `{pool:adjectives}`.
    PoolRef(String),
    /// Protagonist field: `{mc.name}`, `{mc.level}`, `{mc.possessive}`.
    MainCharacter(String),
    /// Per-chapter story field: `{story.setting}`, `{story.directive}`.
    StoryField(String),
}

/// A parsed template: a sequence of segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub segments: Vec<TemplateSegment>,
}

impl Template {
    /// Parse a template string into a sequence of segments.
    ///
    /// Syntax:
    /// - `{rule_name}` → `RuleRef`
    /// - `{pool:name}` → `PoolRef`
    /// - `{mc.field}` → `MainCharacter`
    /// - `{story.field}` → `StoryField`
    /// - `{{` / `}}` → literal braces
    pub fn parse(input: &str) -> Result<Template, GrammarError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '{' => {
                    if !literal.is_empty() {
                        segments.push(TemplateSegment::Literal(std::mem::take(&mut literal)));
                    }
                    let mut content = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        match inner {
                            '{' => {
                                return Err(GrammarError::TemplateParse(
                                    "nested braces are not allowed".to_string(),
                                ))
                            }
                            '}' => {
                                closed = true;
                                break;
                            }
                            other => content.push(other),
                        }
                    }
                    if !closed {
                        return Err(GrammarError::TemplateParse("unclosed brace".to_string()));
                    }
                    segments.push(Self::parse_segment(content.trim())?);
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(GrammarError::TemplateParse(
                        "unmatched closing brace".to_string(),
                    ))
                }
                other => literal.push(other),
            }
        }

        if !literal.is_empty() {
            segments.push(TemplateSegment::Literal(literal));
        }

        Ok(Template { segments })
    }

    fn parse_segment(content: &str) -> Result<TemplateSegment, GrammarError> {
        if content.is_empty() {
            return Err(GrammarError::TemplateParse("empty braces".to_string()));
        }

        if let Some(pool) = content.strip_prefix("pool:") {
            if pool.is_empty() {
                return Err(GrammarError::TemplateParse("empty pool name".to_string()));
            }
            return Ok(TemplateSegment::PoolRef(pool.to_string()));
        }

        if let Some(field) = content.strip_prefix("mc.") {
            if field.is_empty() {
                return Err(GrammarError::TemplateParse(
                    "empty protagonist field name".to_string(),
                ));
            }
            return Ok(TemplateSegment::MainCharacter(field.to_string()));
        }

        if let Some(field) = content.strip_prefix("story.") {
            if field.is_empty() {
                return Err(GrammarError::TemplateParse("empty story field name".to_string()));
            }
            return Ok(TemplateSegment::StoryField(field.to_string()));
        }

        Ok(TemplateSegment::RuleRef(content.to_string()))
    }

    /// Rule names referenced by this template.
    pub fn rule_refs(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            TemplateSegment::RuleRef(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Pool names referenced by this template.
    pub fn pool_refs(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            TemplateSegment::PoolRef(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// A weighted text alternative within a grammar rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub weight: u32,
    pub template: Template,
}

/// A single grammar rule with tag preconditions and weighted alternatives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrammarRule {
    pub name: String,
    pub requires: Vec<String>,
    pub excludes: Vec<String>,
    pub alternatives: Vec<Alternative>,
}

impl GrammarRule {
    /// A rule whose gates are not satisfied expands to nothing.
    pub fn admits(&self, tags: &FxHashSet<String>) -> bool {
        self.requires.iter().all(|t| tags.contains(t)) && !self.excludes.iter().any(|t| tags.contains(t))
    }
}

/// Read-only word source used while expanding `{pool:...}` references.
pub trait PoolSource {
    /// Draw a word from `pool` without consuming it.
    fn sample(&self, pool: &str, rng: &mut StdRng) -> Option<String>;
}

/// Everything an expansion may read: gating tags, the word source, the
/// protagonist, and per-chapter story fields.
pub struct SelectionContext<'a> {
    pub tags: FxHashSet<String>,
    pub pools: &'a dyn PoolSource,
    pub mc: Option<&'a Protagonist>,
    pub story: FxHashMap<String, String>,
}

impl<'a> SelectionContext<'a> {
    pub fn new(pools: &'a dyn PoolSource) -> Self {
        Self {
            tags: FxHashSet::default(),
            pools,
            mc: None,
            story: FxHashMap::default(),
        }
    }

    fn mc_field(&self, field: &str) -> Result<String, GrammarError> {
        let mc = self
            .mc
            .ok_or_else(|| GrammarError::UnknownField(format!("mc.{}", field)))?;
        let value = match field {
            "name" => mc.name.clone(),
            "subject" => mc.pronouns.subject().to_string(),
            "object" => mc.pronouns.object().to_string(),
            "possessive" => mc.pronouns.possessive().to_string(),
            "level" => mc.level.to_string(),
            "hp" => mc.max_hp.to_string(),
            "mp" => mc.max_mp.to_string(),
            "resource" => mc.resource_name.clone(),
            "resource_max" => mc.max_resource.to_string(),
            "strength" => mc.strength.to_string(),
            "agility" => mc.agility.to_string(),
            "intelligence" => mc.intelligence.to_string(),
            _ => return Err(GrammarError::UnknownField(format!("mc.{}", field))),
        };
        Ok(value)
    }
}

/// A set of named grammar rules.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GrammarSet {
    pub rules: HashMap<String, GrammarRule>,
}

// The RON format is flatter than the internal types, so deserialize into
// these first and parse templates afterwards.

#[derive(Debug, Deserialize)]
struct RonAlternative {
    weight: u32,
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Rule")]
struct RonRule {
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    excludes: Vec<String>,
    alternatives: Vec<RonAlternative>,
}

impl GrammarSet {
    /// Load a grammar set from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<GrammarSet, GrammarError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse a grammar set from a RON string.
    pub fn parse_ron(input: &str) -> Result<GrammarSet, GrammarError> {
        let raw: HashMap<String, RonRule> = ron::from_str(input)?;
        let mut rules = HashMap::with_capacity(raw.len());

        for (name, ron_rule) in raw {
            let alternatives = ron_rule
                .alternatives
                .into_iter()
                .map(|alt| {
                    Ok(Alternative {
                        weight: alt.weight,
                        template: Template::parse(&alt.text)?,
                    })
                })
                .collect::<Result<Vec<_>, GrammarError>>()?;
            rules.insert(
                name.clone(),
                GrammarRule {
                    name,
                    requires: ron_rule.requires,
                    excludes: ron_rule.excludes,
                    alternatives,
                },
            );
        }

        Ok(GrammarSet { rules })
    }

    /// Merge another grammar set into this one. Rules from `other`
    /// override rules in `self` with the same name.
    pub fn merge(&mut self, other: GrammarSet) {
        self.rules.extend(other.rules);
    }

    /// Expand a named rule.
    pub fn expand(
        &self,
        rule_name: &str,
        ctx: &SelectionContext<'_>,
        rng: &mut StdRng,
    ) -> Result<String, GrammarError> {
        let mut out = String::new();
        self.expand_rule(rule_name, ctx, rng, 0, &mut out)?;
        Ok(out)
    }

    /// Expand an ad-hoc template (e.g. a paragraph skeleton from a pool).
    pub fn expand_template(
        &self,
        template: &Template,
        ctx: &SelectionContext<'_>,
        rng: &mut StdRng,
    ) -> Result<String, GrammarError> {
        let mut out = String::new();
        self.expand_segments(template, ctx, rng, 0, &mut out)?;
        Ok(out)
    }

    fn expand_rule(
        &self,
        rule_name: &str,
        ctx: &SelectionContext<'_>,
        rng: &mut StdRng,
        depth: usize,
        out: &mut String,
    ) -> Result<(), GrammarError> {
        if depth > MAX_DEPTH {
            return Err(GrammarError::DepthExceeded(MAX_DEPTH));
        }
        let rule = self
            .rules
            .get(rule_name)
            .ok_or_else(|| GrammarError::RuleNotFound(rule_name.to_string()))?;
        if !rule.admits(&ctx.tags) || rule.alternatives.is_empty() {
            return Ok(());
        }

        let weights: Vec<u32> = rule.alternatives.iter().map(|a| a.weight).collect();
        let index = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(rng),
            // All-zero weights: treat the rule as disabled.
            Err(_) => return Ok(()),
        };
        self.expand_segments(&rule.alternatives[index].template, ctx, rng, depth + 1, out)
    }

    fn expand_segments(
        &self,
        template: &Template,
        ctx: &SelectionContext<'_>,
        rng: &mut StdRng,
        depth: usize,
        out: &mut String,
    ) -> Result<(), GrammarError> {
        for segment in &template.segments {
            match segment {
                TemplateSegment::Literal(text) => out.push_str(text),
                TemplateSegment::RuleRef(name) => self.expand_rule(name, ctx, rng, depth, out)?,
                TemplateSegment::PoolRef(pool) => {
                    let word = ctx
                        .pools
                        .sample(pool, rng)
                        .ok_or_else(|| GrammarError::PoolUnavailable(pool.clone()))?;
                    out.push_str(&word);
                }
                TemplateSegment::MainCharacter(field) => out.push_str(&ctx.mc_field(field)?),
                TemplateSegment::StoryField(field) => {
                    let value = ctx
                        .story
                        .get(field.as_str())
                        .ok_or_else(|| GrammarError::UnknownField(format!("story.{}", field)))?;
                    out.push_str(value);
                }
            }
        }
        Ok(())
    }
}
