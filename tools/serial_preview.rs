/// Serial Preview — interactive shell for driving a serial by hand.
///
/// Usage: serial_preview [--content <dir>] [--config <file>] [--seed <n>]
///                       [--store <dir>] [--chapters <n>]
///
/// With `--chapters` the reader is simulated until that many chapters exist,
/// a summary is printed, and the tool exits. Otherwise it starts a shell.
///
/// Commands:
///   next                   — generate the next chapter if the buffer allows
///   read <n>               — mark chapter n as read (tops up the buffer)
///   show <n>               — print a chapter
///   directive <delay> <t>  — queue a directive for delay chapters from now
///   expand <pool>          — expand a pool by hand
///   bulk <n>               — simulate a reader until n more chapters exist
///   stats | pools | progress
///   reset                  — wipe the serial and start over
///   help | quit

use serial_engine::core::config::EngineConfig;
use serial_engine::core::content::ContentPack;
use serial_engine::core::generator::ChapterGenerator;
use serial_engine::core::persistence::{FileStore, Persistence};
use serial_engine::core::scheduler::{GenerationOutcome, ReadingScheduler, SchedulerError};
use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "serial_engine=info".into()))
        .with(fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let mut content_dir = None;
    let mut config_path = None;
    let mut seed = None;
    let mut store_dir = None;
    let mut batch = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--content" if i + 1 < args.len() => {
                i += 1;
                content_dir = Some(args[i].clone());
            }
            "--config" if i + 1 < args.len() => {
                i += 1;
                config_path = Some(args[i].clone());
            }
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = args[i].parse::<u64>().ok();
            }
            "--store" if i + 1 < args.len() => {
                i += 1;
                store_dir = Some(args[i].clone());
            }
            "--chapters" if i + 1 < args.len() => {
                i += 1;
                batch = args[i].parse::<u64>().ok();
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => EngineConfig::load_from_ron(Path::new(path)).unwrap_or_else(|e| {
            eprintln!("ERROR: Failed to load config: {}", e);
            process::exit(1);
        }),
        None => EngineConfig::default(),
    };
    if let Some(seed) = seed {
        config.seed = seed;
    }

    let pack = match &content_dir {
        Some(dir) => ContentPack::load_from_dir(Path::new(dir)),
        None => ContentPack::builtin(),
    }
    .unwrap_or_else(|e| {
        eprintln!("ERROR: Failed to load content pack: {}", e);
        process::exit(1);
    });

    let persistence = match &store_dir {
        Some(dir) => match FileStore::open(Path::new(dir)) {
            Ok(store) => Persistence::new(Arc::new(store)),
            Err(e) => {
                eprintln!("ERROR: Failed to open store: {}", e);
                process::exit(1);
            }
        },
        None => Persistence::in_memory(),
    };

    let scheduler_config = config.scheduler.clone();
    let mut generator = pack
        .generator(config, Some(persistence.clone()))
        .unwrap_or_else(|e| {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        });
    let resumed = generator.resume();
    let mut scheduler = ReadingScheduler::load(&scheduler_config, persistence);

    println!("Seed: {}", generator.seed());
    if resumed > 0 {
        println!("Resumed {} chapters from {}", resumed, store_dir.as_deref().unwrap_or("-"));
    }

    if let Some(count) = batch {
        if let Err(e) = simulate_reader(&mut scheduler, &mut generator, count) {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        }
        for chapter in generator.chapters() {
            println!(
                "{:>4}  {:<4} {:>5} words  {}",
                chapter.number,
                format!("{:?}", chapter.chapter_type),
                chapter.word_count,
                chapter.title
            );
        }
        print_stats(&generator);
        return;
    }

    println!("Type 'help' for commands.\n");
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("serial> ");
        stdout.flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let cmd = parts[0].to_lowercase();

        match cmd.as_str() {
            "quit" | "exit" | "q" => {
                println!("Goodbye.");
                break;
            }
            "help" | "h" | "?" => print_help(),
            "next" => match scheduler.generate_next(&mut generator) {
                Ok(GenerationOutcome::Generated(chapter)) => {
                    println!("Chapter {}: {} ({} words)", chapter.number, chapter.title, chapter.word_count);
                }
                Ok(GenerationOutcome::Refused(refusal)) => {
                    println!(
                        "Refused: chapter {} is past the reading buffer (max {}). Read more first.",
                        refusal.requested, refusal.max_allowed
                    );
                }
                Err(e) => println!("ERROR: {}", e),
            },
            "read" => {
                let Some(n) = parts.get(1).and_then(|s| s.parse::<u64>().ok()) else {
                    println!("Usage: read <chapter>");
                    continue;
                };
                match scheduler.update_reading_progress(n, &mut generator) {
                    Ok(report) => {
                        if !report.generated.is_empty() {
                            println!("Generated chapters {:?}", report.generated);
                        }
                        let progress = scheduler.reading_progress();
                        println!(
                            "Read up to {}, generation allowed up to {}",
                            progress.last_chapter_read, progress.max_allowed_chapter
                        );
                    }
                    Err(e) => println!("ERROR: {}", e),
                }
            }
            "show" => {
                let Some(n) = parts.get(1).and_then(|s| s.parse::<u64>().ok()) else {
                    println!("Usage: show <chapter>");
                    continue;
                };
                match generator.chapter(n) {
                    Some(chapter) => {
                        println!("\n--- Chapter {}: {} ---", chapter.number, chapter.title);
                        println!(
                            "[{} | {:?} | {}]\n",
                            chapter.arc, chapter.chapter_type, chapter.setting
                        );
                        println!("{}", chapter.body());
                        println!("--- End ({} words) ---\n", chapter.word_count);
                    }
                    None => println!("Chapter {} has not been generated.", n),
                }
            }
            "directive" => {
                let delay = parts.get(1).and_then(|s| s.parse::<u64>().ok());
                let text = parts.get(2..).map(|rest| rest.join(" ")).unwrap_or_default();
                match delay {
                    Some(delay) if !text.is_empty() => {
                        let directive = generator.add_directive(&text, delay);
                        println!(
                            "Directive {} queued for chapter {}",
                            directive.id, directive.target_chapter
                        );
                    }
                    _ => println!("Usage: directive <delay> <text>"),
                }
            }
            "expand" => {
                let Some(pool) = parts.get(1) else {
                    println!("Usage: expand <pool>");
                    continue;
                };
                match generator.expand_pool(pool) {
                    Ok(added) => println!("Added {} items to '{}'", added, pool),
                    Err(e) => println!("ERROR: {}", e),
                }
            }
            "bulk" => {
                let Some(n) = parts.get(1).and_then(|s| s.parse::<u64>().ok()).filter(|n| *n > 0)
                else {
                    println!("Usage: bulk <n>");
                    continue;
                };
                match simulate_reader(&mut scheduler, &mut generator, n) {
                    Ok(()) => print_stats(&generator),
                    Err(e) => println!("ERROR: {}", e),
                }
            }
            "stats" => print_stats(&generator),
            "pools" => {
                println!("{:<28} {:>6} {:>6} {:>7} {:>5}", "pool", "items", "used", "avail", "exp");
                for stats in generator.pool_stats() {
                    println!(
                        "{:<28} {:>6} {:>6} {:>6.0}% {:>5}",
                        stats.name,
                        stats.item_count,
                        stats.used_items,
                        stats.available_ratio * 100.0,
                        stats.expansion_count
                    );
                }
            }
            "progress" => {
                let state = scheduler.state();
                println!(
                    "Read: {}  Generated: {}  Buffer: {}  Auto: {}",
                    state.last_chapter_read,
                    state.last_chapter_generated,
                    state.buffer_chapters,
                    state.auto_generate
                );
                for entry in state.generation_history.iter().rev().take(5) {
                    println!(
                        "  chapter {} generated at {} (reader at {})",
                        entry.chapter, entry.generated_at, entry.read_at_generation
                    );
                }
            }
            "reset" => {
                generator.reset();
                scheduler.reset();
                println!("Serial reset.");
            }
            other => println!("Unknown command '{}'. Type 'help'.", other),
        }
    }
}

/// Advance a simulated reader one chapter at a time until `count` more
/// chapters exist.
fn simulate_reader(
    scheduler: &mut ReadingScheduler,
    generator: &mut ChapterGenerator,
    count: u64,
) -> Result<(), SchedulerError> {
    let target = generator.generated_count() + count;
    while generator.generated_count() < target {
        let next = scheduler.state().last_chapter_read + 1;
        scheduler.update_reading_progress(next, generator)?;
        if !scheduler.state().auto_generate {
            scheduler.generate_chapters_up_to_buffer(generator)?;
        }
    }
    Ok(())
}

fn print_stats(generator: &ChapterGenerator) {
    let stats = generator.stats();
    let uniqueness = generator.uniqueness_stats();

    let chapters: Vec<_> = generator.chapters().collect();
    let words: usize = chapters.iter().map(|c| c.word_count).sum();
    let titles: HashSet<&str> = chapters.iter().map(|c| c.title.as_str()).collect();

    println!("\n=== Serial Stats ===\n");
    println!("Chapters:            {}", chapters.len());
    if !chapters.is_empty() {
        println!("Average words:       {}", words / chapters.len());
    }
    println!("Distinct titles:     {} / {}", titles.len(), chapters.len());
    println!("Paragraph retries:   {}", stats.paragraph_retries);
    println!("Title retries:       {}", stats.title_retries);
    println!("Category fallbacks:  {}", stats.category_fallbacks);
    println!("Pool expansions:     {}", stats.pool_expansions);
    println!("Failed generations:  {}", stats.failed_generations);
    println!(
        "Tracked:             {} titles, {} paragraphs, {} sentences",
        uniqueness.titles, uniqueness.paragraphs, uniqueness.sentences
    );
    println!(
        "Rejected:            {} ({} near-duplicates)",
        uniqueness.rejected, uniqueness.near_duplicates
    );
    println!("Uniqueness rate:     {:.4}\n", uniqueness.uniqueness_rate);
}

fn print_usage() {
    println!("Usage: serial_preview [--content <dir>] [--config <file>] [--seed <n>]");
    println!("                      [--store <dir>] [--chapters <n>]");
}

fn print_help() {
    println!("Commands:");
    println!("  next                   generate the next chapter if the buffer allows");
    println!("  read <n>               mark chapter n as read");
    println!("  show <n>               print a chapter");
    println!("  directive <delay> <t>  queue a directive");
    println!("  expand <pool>          expand a pool by hand");
    println!("  bulk <n>               simulate a reader until n more chapters exist");
    println!("  stats                  generation and uniqueness counters");
    println!("  pools                  pool sizes and usage");
    println!("  progress               reading state and recent generations");
    println!("  reset                  wipe the serial");
    println!("  quit                   exit");
}
