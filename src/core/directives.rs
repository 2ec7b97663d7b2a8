/// Externally injected instructions waiting for a chapter.

use serde::{Deserialize, Serialize};

use crate::schema::directive::{Directive, DirectiveStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectiveQueue {
    directives: Vec<Directive>,
    next_id: u64,
}

impl DirectiveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `text` for the chapter `delay_chapters` after `current_chapter`.
    pub fn add(&mut self, text: &str, delay_chapters: u64, current_chapter: u64) -> Directive {
        self.next_id += 1;
        let directive = Directive {
            id: self.next_id,
            text: text.trim().to_string(),
            target_chapter: current_chapter.saturating_add(delay_chapters),
            status: DirectiveStatus::Pending,
            incorporated_in: None,
        };
        self.directives.push(directive.clone());
        tracing::info!(
            id = directive.id,
            target = directive.target_chapter,
            "directive queued"
        );
        directive
    }

    /// The pending directive with the earliest target that `chapter` may
    /// carry. Ties go to the one queued first.
    pub fn next_due(&self, chapter: u64) -> Option<&Directive> {
        self.directives
            .iter()
            .filter(|d| d.is_due(chapter))
            .min_by_key(|d| (d.target_chapter, d.id))
    }

    /// Flip a pending directive to incorporated. Returns false if it is
    /// unknown or was already consumed.
    pub fn mark_incorporated(&mut self, id: u64, chapter: u64) -> bool {
        match self.directives.iter_mut().find(|d| d.id == id) {
            Some(d) if d.is_pending() => {
                d.status = DirectiveStatus::Incorporated;
                d.incorporated_in = Some(chapter);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: u64) -> Option<&Directive> {
        self.directives.iter().find(|d| d.id == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Directive> {
        self.directives.iter().filter(|d| d.is_pending())
    }

    pub fn all(&self) -> &[Directive] {
        &self.directives
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    pub fn clear(&mut self) {
        self.directives.clear();
        self.next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_relative_to_current_chapter() {
        let mut queue = DirectiveQueue::new();
        let d = queue.add("  A mysterious stranger appears ", 3, 0);
        assert_eq!(d.target_chapter, 3);
        assert_eq!(d.text, "A mysterious stranger appears");
        assert_eq!(d.status, DirectiveStatus::Pending);
        let later = queue.add("The tower falls", 2, 7);
        assert_eq!(later.target_chapter, 9);
        assert_ne!(d.id, later.id);
    }

    #[test]
    fn earliest_due_first() {
        let mut queue = DirectiveQueue::new();
        let late = queue.add("late", 5, 0);
        let early = queue.add("early", 2, 0);
        let tie = queue.add("tie", 2, 0);
        assert!(queue.next_due(1).is_none());
        assert_eq!(queue.next_due(6).map(|d| d.id), Some(early.id));
        assert!(queue.mark_incorporated(early.id, 6));
        assert_eq!(queue.next_due(6).map(|d| d.id), Some(tie.id));
        assert!(queue.mark_incorporated(tie.id, 7));
        assert_eq!(queue.next_due(7).map(|d| d.id), Some(late.id));
    }

    #[test]
    fn consumed_at_most_once() {
        let mut queue = DirectiveQueue::new();
        let d = queue.add("once", 0, 4);
        assert!(queue.mark_incorporated(d.id, 4));
        assert!(!queue.mark_incorporated(d.id, 5));
        assert_eq!(queue.get(d.id).and_then(|d| d.incorporated_in), Some(4));
        assert_eq!(queue.pending().count(), 0);
        assert!(!queue.mark_incorporated(99, 5));
    }

    #[test]
    fn huge_delay_saturates() {
        let mut queue = DirectiveQueue::new();
        let d = queue.add("someday", u64::MAX, 12);
        assert_eq!(d.target_chapter, u64::MAX);
        assert!(queue.next_due(1_000_000).is_none());
    }

    #[test]
    fn clear_restarts_ids() {
        let mut queue = DirectiveQueue::new();
        queue.add("a", 1, 0);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.add("b", 1, 0).id, 1);
    }
}
