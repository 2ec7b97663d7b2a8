/// Content pack tests. The shipped pools and grammar are complete and
/// varied enough to drive a long serial.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serial_engine::core::config::EngineConfig;
use serial_engine::core::content::ContentPack;
use serial_engine::core::grammar::SelectionContext;
use serial_engine::core::pools::{item_key, PoolCategory};
use serial_engine::core::variety::VarietyPass;
use serial_engine::schema::category::Category;
use serial_engine::schema::protagonist::{Pronouns, Protagonist};
use std::collections::HashSet;
use std::path::Path;

#[test]
fn builtin_pack_matches_content_dir() {
    let builtin = ContentPack::builtin().unwrap();
    let on_disk = ContentPack::load_from_dir(Path::new("content")).unwrap();
    assert_eq!(builtin.pools.len(), on_disk.pools.len());
    assert_eq!(builtin.grammar.rules.len(), on_disk.grammar.rules.len());
}

#[test]
fn builtin_pack_has_no_lint_issues() {
    let pack = ContentPack::builtin().unwrap();
    let issues = pack.lint();
    assert!(issues.is_empty(), "{:#?}", issues);
}

#[test]
fn every_category_has_varied_rules() {
    let pack = ContentPack::builtin().unwrap();
    for category in Category::ALL {
        for part in ["opening", "body", "closing"] {
            let name = format!("{}_{}", category.name(), part);
            let rule = pack
                .grammar
                .rules
                .get(&name)
                .unwrap_or_else(|| panic!("missing rule {}", name));
            assert!(
                rule.alternatives.len() >= 4,
                "{} has only {} alternatives",
                name,
                rule.alternatives.len()
            );
        }
        let templates = &pack.pools[&category.template_pool()];
        assert_eq!(templates.category, PoolCategory::Template);
        assert!(templates.items.len() >= 3);
    }
}

#[test]
fn long_alternatives_carry_two_pool_slots() {
    // A sentence with fewer variable slots repeats within a few hundred
    // chapters and starts burning retries.
    let pack = ContentPack::builtin().unwrap();
    for (name, rule) in &pack.grammar.rules {
        if !["_opening", "_body", "_closing"].iter().any(|s| name.ends_with(s)) {
            continue;
        }
        for alt in &rule.alternatives {
            let lone_rule = alt.template.segments.len() == 1 && alt.template.rule_refs().count() == 1;
            if lone_rule {
                continue;
            }
            assert!(
                alt.template.pool_refs().count() >= 2,
                "{}: {:?}",
                name,
                alt.template
            );
        }
    }
}

#[test]
fn pools_hold_distinct_items() {
    let pack = ContentPack::builtin().unwrap();
    for (name, spec) in &pack.pools {
        let keys: HashSet<String> = spec.items.iter().chain(&spec.reserve).map(|i| item_key(i)).collect();
        assert_eq!(keys.len(), spec.items.len() + spec.reserve.len(), "duplicates in {}", name);
        if !matches!(spec.category, PoolCategory::Template | PoolCategory::TitlePattern) {
            assert!(
                spec.items.iter().all(|i| !i.contains(['.', '!', '?'])),
                "{} holds sentence punctuation",
                name
            );
        }
    }
    assert!(pack.pools["adjectives"].items.len() >= 90);
    assert!(pack.pools["nouns"].items.len() >= 90);
}

#[test]
fn directive_weave_keeps_the_directive_intact() {
    let pack = ContentPack::builtin().unwrap();
    let engine = pack.pool_engine(&EngineConfig::default()).unwrap();
    let mc = Protagonist::new("Kai", Pronouns::TheyThem, "Aether");
    let directive = "A mysterious stranger appears";

    let mut ctx = SelectionContext::new(&engine);
    ctx.mc = Some(&mc);
    ctx.tags.insert("type:real".to_string());
    ctx.story.insert("directive".to_string(), directive.to_string());

    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let text = pack.grammar.expand("directive_weave", &ctx, &mut rng).unwrap();
        let finished = VarietyPass::apply(&text);
        assert!(finished.contains(directive), "seed {}: {}", seed, finished);
    }
}
