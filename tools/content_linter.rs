/// Content Linter — validates a content pack before it is used for a serial.
///
/// Usage: content_linter [<content_dir>] [--smoke <chapters>] [--seed <n>]
///
/// Without a directory the built-in pack is checked. `--smoke` additionally
/// generates that many chapters in memory and reports any failure.

use serial_engine::core::config::EngineConfig;
use serial_engine::core::content::{ContentPack, Severity};
use std::path::Path;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "serial_engine=warn".into()))
        .with(fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Usage: content_linter [<content_dir>] [--smoke <chapters>] [--seed <n>]");
        process::exit(0);
    }

    let mut content_dir = None;
    let mut smoke = 0u64;
    let mut seed = EngineConfig::default().seed;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--smoke" if i + 1 < args.len() => {
                i += 1;
                smoke = args[i].parse().unwrap_or(0);
            }
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = args[i].parse().unwrap_or(seed);
            }
            other if !other.starts_with("--") && content_dir.is_none() => {
                content_dir = Some(other.to_string());
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                process::exit(1);
            }
        }
        i += 1;
    }

    let loaded = match &content_dir {
        Some(dir) => ContentPack::load_from_dir(Path::new(dir)),
        None => ContentPack::builtin(),
    };
    let pack = match loaded {
        Ok(pack) => pack,
        Err(e) => {
            eprintln!("ERROR: Failed to load content pack: {}", e);
            process::exit(1);
        }
    };

    println!(
        "Loaded {} pools and {} grammar rules from {}",
        pack.pools.len(),
        pack.grammar.rules.len(),
        content_dir.as_deref().unwrap_or("the built-in pack")
    );

    let issues = pack.lint();
    let errors = issues.iter().filter(|i| i.severity == Severity::Error).count();
    let warnings = issues.len() - errors;

    println!("\n=== Content Lint Report ===\n");
    if issues.is_empty() {
        println!("All checks passed!");
    }
    for issue in &issues {
        println!("{}", issue);
    }

    // Rules with very few alternatives repeat quickly under the uniqueness checks.
    let mut thin: Vec<(&String, usize)> = pack
        .grammar
        .rules
        .iter()
        .map(|(name, rule)| (name, rule.alternatives.len()))
        .filter(|(_, n)| *n < 3)
        .collect();
    thin.sort();
    for (name, n) in &thin {
        println!("NOTE: rule '{}' has only {} alternatives", name, n);
    }

    println!("\nSummary: {} errors, {} warnings", errors, warnings);
    if errors > 0 {
        process::exit(1);
    }

    if smoke > 0 {
        let config = EngineConfig::default().with_seed(seed);
        let mut generator = match pack.generator(config, None) {
            Ok(generator) => generator,
            Err(e) => {
                eprintln!("ERROR: Pack cannot drive a generator: {}", e);
                process::exit(1);
            }
        };
        for _ in 0..smoke {
            if let Err(e) = generator.generate_chapter(None) {
                eprintln!(
                    "ERROR: Smoke run failed at chapter {}: {}",
                    generator.next_chapter_number(),
                    e
                );
                process::exit(1);
            }
        }
        let stats = generator.uniqueness_stats();
        println!(
            "Smoke run: {} chapters, {} retries, uniqueness rate {:.3}",
            smoke,
            generator.stats().paragraph_retries + generator.stats().title_retries,
            stats.uniqueness_rate
        );
    }
}
