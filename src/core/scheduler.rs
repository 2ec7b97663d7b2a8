/// Keeps generation at most `buffer_chapters` ahead of the privileged reader.
///
/// The scheduler does not own the generator; callers pass it in, which keeps
/// a single mutable owner of story state. Reading state is persisted after
/// every mutation.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::core::config::SchedulerConfig;
use crate::core::generator::{ChapterGenerator, GeneratorError};
use crate::core::persistence::{keys, Persistence};
use crate::schema::chapter::ChapterRecord;
use crate::schema::reading::{AdminReadingState, GenerationEntry, ReadingProgress};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("generation failed: {0}")]
    Generator(#[from] GeneratorError),
}

/// Shared flag that stops a catch-up run between chapters.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a catch-up run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    /// Chapter numbers committed by this run, in order.
    pub generated: Vec<u64>,
    /// The run stopped early because the cancel flag was raised.
    pub cancelled: bool,
}

/// A generation request the buffer does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardRefusal {
    pub requested: u64,
    pub max_allowed: u64,
}

#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Generated(ChapterRecord),
    Refused(GuardRefusal),
}

pub struct ReadingScheduler {
    state: AdminReadingState,
    persistence: Persistence,
    cancel: CancelFlag,
}

impl ReadingScheduler {
    pub fn new(config: &SchedulerConfig, persistence: Persistence) -> Self {
        Self {
            state: AdminReadingState::new(config.buffer_chapters, config.auto_generate),
            persistence,
            cancel: CancelFlag::new(),
        }
    }

    /// Pick up the reading state left in the store, if any.
    pub fn load(config: &SchedulerConfig, persistence: Persistence) -> Self {
        let state = persistence
            .load(keys::READING_STATE)
            .unwrap_or_else(|| AdminReadingState::new(config.buffer_chapters, config.auto_generate));
        Self {
            state,
            persistence,
            cancel: CancelFlag::new(),
        }
    }

    pub fn state(&self) -> &AdminReadingState {
        &self.state
    }

    /// A handle other threads can use to stop a running catch-up.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn persist(&self) {
        self.persistence.save(keys::READING_STATE, &self.state);
    }

    pub fn set_buffer_chapters(&mut self, buffer_chapters: u64) {
        self.state.buffer_chapters = buffer_chapters;
        self.persist();
    }

    pub fn set_auto_generate(&mut self, auto_generate: bool) {
        self.state.auto_generate = auto_generate;
        self.persist();
    }

    pub fn can_generate_chapter(&self, number: u64) -> bool {
        number <= self.state.max_allowed_chapter()
    }

    pub fn reading_progress(&self) -> ReadingProgress {
        ReadingProgress {
            last_chapter_read: self.state.last_chapter_read,
            max_allowed_chapter: self.state.max_allowed_chapter(),
            generation_history: self.state.generation_history.clone(),
        }
    }

    /// Record that the reader reached chapter `chapter`, then top up the
    /// buffer if auto-generation is on.
    pub fn update_reading_progress(
        &mut self,
        chapter: u64,
        generator: &mut ChapterGenerator,
    ) -> Result<CatchUpReport, SchedulerError> {
        if chapter > self.state.last_chapter_read {
            self.state.last_chapter_read = chapter;
            self.persist();
            tracing::info!(chapter, "reading progress advanced");
        }
        if self.state.auto_generate {
            self.generate_chapters_up_to_buffer(generator)
        } else {
            Ok(CatchUpReport::default())
        }
    }

    pub fn generate_chapters_up_to_buffer(
        &mut self,
        generator: &mut ChapterGenerator,
    ) -> Result<CatchUpReport, SchedulerError> {
        self.generate_chapters_up_to_buffer_with(generator, |_| {})
    }

    /// Generate every chapter from the generator's next one up to
    /// `last_read + buffer` in order, calling `on_chapter` after each commit. Cancellation is
    /// checked before each chapter; everything committed before it stays.
    pub fn generate_chapters_up_to_buffer_with<F>(
        &mut self,
        generator: &mut ChapterGenerator,
        mut on_chapter: F,
    ) -> Result<CatchUpReport, SchedulerError>
    where
        F: FnMut(&ChapterRecord),
    {
        self.sync_with(generator);
        let target = self.state.max_allowed_chapter();
        let mut report = CatchUpReport::default();
        let first = generator.next_chapter_number();
        if target < first {
            return Ok(report);
        }

        tracing::info!(from = first, to = target, "catching up to reading buffer");
        for number in first..=target {
            if self.cancel.is_cancelled() {
                self.cancel.clear();
                report.cancelled = true;
                tracing::info!(stopped_before = number, "catch-up cancelled");
                break;
            }
            let chapter = generator.generate_chapter(Some(number))?;
            self.record_generation(number);
            report.generated.push(number);
            on_chapter(&chapter);
        }
        Ok(report)
    }

    /// Generate the generator's next chapter if the buffer allows it.
    pub fn generate_next(
        &mut self,
        generator: &mut ChapterGenerator,
    ) -> Result<GenerationOutcome, SchedulerError> {
        self.sync_with(generator);
        let requested = generator.next_chapter_number();
        if !self.can_generate_chapter(requested) {
            let refusal = GuardRefusal {
                requested,
                max_allowed: self.state.max_allowed_chapter(),
            };
            tracing::debug!(requested, max_allowed = refusal.max_allowed, "generation refused");
            return Ok(GenerationOutcome::Refused(refusal));
        }
        let chapter = generator.generate_chapter(Some(requested))?;
        self.record_generation(requested);
        Ok(GenerationOutcome::Generated(chapter))
    }

    /// The generator's tracker is authoritative for what exists; chapters
    /// committed by direct calls, a reset or a resume are adopted here.
    fn sync_with(&mut self, generator: &ChapterGenerator) {
        let generated = generator.next_chapter_number().saturating_sub(1);
        if generated != self.state.last_chapter_generated {
            tracing::debug!(
                scheduler = self.state.last_chapter_generated,
                generator = generated,
                "adopting generator chapter count"
            );
            self.state.last_chapter_generated = generated;
            self.persist();
        }
    }

    fn record_generation(&mut self, chapter: u64) {
        self.state.last_chapter_generated = chapter;
        self.state.generation_history.push(GenerationEntry {
            chapter,
            read_at_generation: self.state.last_chapter_read,
            generated_at: Utc::now(),
        });
        self.persist();
    }

    /// Zero the counters and history. Buffer size and auto-generation stay.
    pub fn reset(&mut self) {
        self.state = AdminReadingState::new(self.state.buffer_chapters, self.state.auto_generate);
        self.cancel.clear();
        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::core::content::ContentPack;

    fn setup(buffer: u64, auto: bool) -> (ReadingScheduler, ChapterGenerator, Persistence) {
        let persistence = Persistence::in_memory();
        let config = SchedulerConfig {
            buffer_chapters: buffer,
            auto_generate: auto,
        };
        let scheduler = ReadingScheduler::new(&config, persistence.clone());
        let generator = ContentPack::builtin()
            .unwrap()
            .generator(EngineConfig::default(), None)
            .unwrap();
        (scheduler, generator, persistence)
    }

    #[test]
    fn guard_boundary() {
        let (scheduler, _, _) = setup(3, false);
        assert!(scheduler.can_generate_chapter(3));
        assert!(!scheduler.can_generate_chapter(4));
        assert_eq!(scheduler.reading_progress().max_allowed_chapter, 3);
    }

    #[test]
    fn manual_mode_does_not_generate() {
        let (mut scheduler, mut generator, _) = setup(2, false);
        let report = scheduler.update_reading_progress(1, &mut generator).unwrap();
        assert!(report.generated.is_empty());
        assert_eq!(scheduler.state().last_chapter_read, 1);
        assert_eq!(generator.generated_count(), 0);
    }

    #[test]
    fn reading_progress_never_goes_back() {
        let (mut scheduler, mut generator, _) = setup(1, false);
        scheduler.update_reading_progress(4, &mut generator).unwrap();
        scheduler.update_reading_progress(2, &mut generator).unwrap();
        assert_eq!(scheduler.state().last_chapter_read, 4);
    }

    #[test]
    fn guarded_generation_refuses_past_buffer() {
        let (mut scheduler, mut generator, _) = setup(1, false);
        assert!(matches!(
            scheduler.generate_next(&mut generator).unwrap(),
            GenerationOutcome::Generated(_)
        ));
        match scheduler.generate_next(&mut generator).unwrap() {
            GenerationOutcome::Refused(refusal) => {
                assert_eq!(refusal, GuardRefusal { requested: 2, max_allowed: 1 })
            }
            GenerationOutcome::Generated(c) => panic!("chapter {} slipped past the guard", c.number),
        }
        scheduler.update_reading_progress(1, &mut generator).unwrap();
        assert!(matches!(
            scheduler.generate_next(&mut generator).unwrap(),
            GenerationOutcome::Generated(_)
        ));
    }

    #[test]
    fn state_is_persisted_and_reloaded() {
        let (mut scheduler, mut generator, persistence) = setup(2, true);
        scheduler.update_reading_progress(1, &mut generator).unwrap();
        let stored: AdminReadingState = persistence.load(keys::READING_STATE).unwrap();
        assert_eq!(stored.last_chapter_generated, 3);
        assert_eq!(stored.generation_history.len(), 3);

        let reloaded = ReadingScheduler::load(&SchedulerConfig::default(), persistence);
        assert_eq!(reloaded.state(), &stored);
    }

    #[test]
    fn cancellation_before_start() {
        let (mut scheduler, mut generator, _) = setup(2, false);
        scheduler.cancel_flag().cancel();
        let report = scheduler.generate_chapters_up_to_buffer(&mut generator).unwrap();
        assert!(report.cancelled);
        assert!(report.generated.is_empty());
        // The flag is consumed by the run it stopped.
        let report = scheduler.generate_chapters_up_to_buffer(&mut generator).unwrap();
        assert_eq!(report.generated, vec![1, 2]);
    }

    #[test]
    fn direct_generator_calls_do_not_wedge_catch_up() {
        let (mut scheduler, mut generator, _) = setup(10, true);
        assert!(scheduler.can_generate_chapter(1));
        generator.generate_chapter(None).unwrap();

        let report = scheduler.update_reading_progress(1, &mut generator).unwrap();
        assert_eq!(report.generated, (2..=11).collect::<Vec<_>>());
        assert_eq!(scheduler.state().last_chapter_generated, 11);
        assert_eq!(generator.generated_count(), 11);

        let report = scheduler.update_reading_progress(2, &mut generator).unwrap();
        assert_eq!(report.generated, vec![12]);
    }

    #[test]
    fn generator_reset_is_adopted() {
        let (mut scheduler, mut generator, _) = setup(2, false);
        scheduler.generate_chapters_up_to_buffer(&mut generator).unwrap();
        generator.reset();
        assert!(matches!(
            scheduler.generate_next(&mut generator).unwrap(),
            GenerationOutcome::Generated(ref c) if c.number == 1
        ));
        assert_eq!(scheduler.state().last_chapter_generated, 1);
    }

    #[test]
    fn reset_keeps_settings() {
        let (mut scheduler, mut generator, _) = setup(2, true);
        scheduler.update_reading_progress(1, &mut generator).unwrap();
        scheduler.reset();
        assert_eq!(scheduler.state().last_chapter_read, 0);
        assert_eq!(scheduler.state().last_chapter_generated, 0);
        assert!(scheduler.state().generation_history.is_empty());
        assert_eq!(scheduler.state().buffer_chapters, 2);
    }
}
