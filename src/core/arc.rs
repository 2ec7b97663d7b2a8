/// Arc/type state machine: decides where each chapter sits in the story.
///
/// States are the configured arcs; the last one is absorbing. A chapter
/// first bumps `chapters_in_arc`, and when that exceeds the current arc's
/// length the machine moves to the next arc and the counter restarts at 1.

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::Rng;

use crate::core::config::ArcSpec;
use crate::schema::category::Category;
use crate::schema::chapter::ChapterType;
use crate::schema::tracker::StoryTracker;

/// Advance the tracker by one chapter and return the arc the chapter
/// belongs to.
pub fn step_arc<'a>(tracker: &mut StoryTracker, arcs: &'a [ArcSpec]) -> &'a ArcSpec {
    let last = arcs.len().saturating_sub(1);
    let index = tracker.arc_index.min(last);
    tracker.chapters_in_arc += 1;

    if index < last && tracker.chapters_in_arc > arcs[index].length {
        tracker.arc_index = index + 1;
        tracker.chapters_in_arc = 1;
        tracker.arc_name = arcs[index + 1].name.clone();
        tracing::info!(arc = %tracker.arc_name, "arc advanced");
    } else {
        tracker.arc_index = index;
    }
    &arcs[tracker.arc_index]
}

/// Pick the chapter type for the next chapter.
///
/// The arc's `vr_ratio` drives the draw, but a run of the same type never
/// grows past `max_run`.
pub fn choose_type(
    tracker: &StoryTracker,
    arc: &ArcSpec,
    max_run: u32,
    rng: &mut StdRng,
) -> ChapterType {
    let drawn = if rng.gen_bool(arc.vr_ratio.clamp(0.0, 1.0)) {
        ChapterType::Vr
    } else {
        ChapterType::Real
    };

    if max_run > 0 && tracker.last_type == Some(drawn) && tracker.run_length(drawn) >= max_run {
        drawn.other()
    } else {
        drawn
    }
}

/// Plan `count` paragraph categories for a chapter of `chapter_type` in `arc`.
///
/// Categories are weighted by the arc and never repeat back to back.
pub fn plan_categories(
    arc: &ArcSpec,
    chapter_type: ChapterType,
    count: usize,
    rng: &mut StdRng,
) -> Vec<Category> {
    let candidates: Vec<Category> = Category::ALL
        .iter()
        .copied()
        .filter(|c| c.fits(chapter_type))
        .collect();

    let mut plan: Vec<Category> = Vec::with_capacity(count);
    for _ in 0..count {
        let previous = plan.last().copied();
        let options: Vec<Category> = candidates
            .iter()
            .copied()
            .filter(|c| Some(*c) != previous)
            .collect();
        let weights: Vec<u32> = options.iter().map(|c| arc.weight_of(*c).max(1)).collect();
        let picked = match WeightedIndex::new(&weights) {
            Ok(dist) => options[dist.sample(rng)],
            Err(_) => options[rng.gen_range(0..options.len())],
        };
        plan.push(picked);
    }
    plan
}
