/// Corpus-wide duplicate rejection for titles, paragraphs and sentences.
///
/// Identity is a 64-bit hash of the normalized text (case-folded,
/// whitespace-collapsed). A hash hit is confirmed against the stored text,
/// so a collision between different strings is counted but never treated
/// as a duplicate. Paragraphs are also split into sentences, each tracked on
/// its own once it is long enough, and compared by token overlap against a
/// window of recent paragraphs.

use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use crate::core::config::UniquenessConfig;
use crate::schema::chapter::ChapterRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentKind {
    Title,
    Paragraph,
    Sentence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    Empty,
    /// The exact (normalized) content has been produced before.
    Duplicate(ContentKind),
    /// A sentence inside the paragraph has been produced before.
    DuplicateSentence(String),
    /// The same sentence appears twice in the candidate itself.
    RepeatedSentence(String),
    /// Token overlap with a recent paragraph reached the threshold.
    NearDuplicate { similarity: f64 },
}

impl RejectReason {
    fn is_exact(&self) -> bool {
        matches!(
            self,
            Self::Duplicate(_) | Self::DuplicateSentence(_) | Self::RepeatedSentence(_)
        )
    }
}

/// Outcome of a uniqueness check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Verdict {
    Unique,
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Unique)
    }

    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            Self::Unique => None,
            Self::Rejected(reason) => Some(reason),
        }
    }
}

/// One offending element of a candidate chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateElement {
    pub kind: ContentKind,
    /// Paragraph index for paragraph and sentence findings.
    pub paragraph: Option<usize>,
    pub content: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterValidation {
    pub valid: bool,
    pub duplicates: Vec<DuplicateElement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UniquenessStats {
    pub titles: u64,
    pub paragraphs: u64,
    pub sentences: u64,
    /// Everything currently registered.
    pub generated: u64,
    /// Rejections caused by exact repeats.
    pub duplicates: u64,
    pub near_duplicates: u64,
    /// All rejections, exact and near.
    pub rejected: u64,
    /// Distinct strings that shared a 64-bit hash.
    pub hash_collisions: u64,
    pub uniqueness_rate: f64,
}

/// Position in the registration log; see [`UniquenessChecker::rollback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

/// What the chapter generator needs from the uniqueness layer.
pub trait UniquenessChecker: Send {
    fn check_title(&self, title: &str) -> Verdict;
    fn check_paragraph(&self, paragraph: &str) -> Verdict;
    fn check_sentence(&self, sentence: &str) -> Verdict;

    /// Check, and register on success.
    fn validate_title(&mut self, title: &str) -> Verdict;
    fn validate_paragraph(&mut self, paragraph: &str) -> Verdict;
    fn validate_sentence(&mut self, sentence: &str) -> Verdict;

    /// Report every offending element of a candidate chapter without
    /// registering anything.
    fn validate_chapter(&self, chapter: &ChapterRecord) -> ChapterValidation;

    /// Register an already accepted chapter (used when rebuilding from an
    /// archive).
    fn register_chapter(&mut self, chapter: &ChapterRecord);

    fn stats(&self) -> UniquenessStats;

    fn checkpoint(&self) -> Checkpoint;
    /// Undo every registration made since `checkpoint`.
    fn rollback(&mut self, checkpoint: Checkpoint);
    /// Forget the undo log; earlier checkpoints become invalid.
    fn commit(&mut self);

    fn reset(&mut self);
}

/// Case-fold and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// First eight bytes of SHA-256 over the normalized text.
pub fn content_hash(normalized: &str) -> u64 {
    let digest = Sha256::digest(normalized.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Split text into sentences after `.`, `!` or `?` (and any closing quotes)
/// followed by whitespace or the end of the text.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut i = 0;
    while i < chars.len() {
        let (_, c) = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let mut end = i + 1;
            while end < chars.len() && matches!(chars[end].1, '.' | '!' | '?' | '"' | '\'' | ')') {
                end += 1;
            }
            if end == chars.len() || chars[end].1.is_whitespace() {
                let byte_end = if end == chars.len() { text.len() } else { chars[end].0 };
                let sentence = text[start..byte_end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = byte_end;
            }
            i = end;
        } else {
            i += 1;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn token_set(normalized: &str) -> FxHashSet<u64> {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| {
            let mut hasher = FxHasher::default();
            t.hash(&mut hasher);
            hasher.finish()
        })
        .collect()
}

/// Jaccard overlap of two token sets.
pub fn token_overlap(a: &FxHashSet<u64>, b: &FxHashSet<u64>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let shared = small.iter().filter(|t| large.contains(t)).count();
    shared as f64 / (a.len() + b.len() - shared) as f64
}

#[derive(Debug, Clone, Default)]
struct HashIndex {
    buckets: FxHashMap<u64, Vec<Box<str>>>,
}

impl HashIndex {
    /// Returns (present, collided): `collided` is set when the hash matched
    /// only different strings.
    fn lookup(&self, hash: u64, normalized: &str) -> (bool, bool) {
        match self.buckets.get(&hash) {
            None => (false, false),
            Some(bucket) => {
                let present = bucket.iter().any(|s| &**s == normalized);
                (present, !present)
            }
        }
    }

    fn insert(&mut self, hash: u64, normalized: &str) {
        self.buckets
            .entry(hash)
            .or_default()
            .push(normalized.into());
    }

    fn remove_last(&mut self, hash: u64) {
        if let Some(bucket) = self.buckets.get_mut(&hash) {
            bucket.pop();
            if bucket.is_empty() {
                self.buckets.remove(&hash);
            }
        }
    }

    fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    tokens: FxHashSet<u64>,
}

#[derive(Debug, Clone)]
struct LogEntry {
    kind: ContentKind,
    hash: u64,
    /// Set when registering a paragraph pushed it into the similarity window.
    windowed: bool,
    evicted: Option<WindowEntry>,
}

/// The canonical [`UniquenessChecker`].
#[derive(Debug, Clone)]
pub struct HistoricalIndex {
    config: UniquenessConfig,
    titles: HashIndex,
    paragraphs: HashIndex,
    sentences: HashIndex,
    window: VecDeque<WindowEntry>,
    log: Vec<LogEntry>,
    stats: UniquenessStats,
}

impl HistoricalIndex {
    pub fn new(config: UniquenessConfig) -> Self {
        Self {
            config,
            titles: HashIndex::default(),
            paragraphs: HashIndex::default(),
            sentences: HashIndex::default(),
            window: VecDeque::new(),
            log: Vec::new(),
            stats: UniquenessStats::default(),
        }
    }

    fn index(&self, kind: ContentKind) -> &HashIndex {
        match kind {
            ContentKind::Title => &self.titles,
            ContentKind::Paragraph => &self.paragraphs,
            ContentKind::Sentence => &self.sentences,
        }
    }

    fn index_mut(&mut self, kind: ContentKind) -> &mut HashIndex {
        match kind {
            ContentKind::Title => &mut self.titles,
            ContentKind::Paragraph => &mut self.paragraphs,
            ContentKind::Sentence => &mut self.sentences,
        }
    }

    fn tracks_sentence(&self, normalized: &str) -> bool {
        normalized.chars().count() >= self.config.min_sentence_chars
    }

    fn seen(&self, kind: ContentKind, normalized: &str) -> bool {
        self.index(kind).lookup(content_hash(normalized), normalized).0
    }

    fn check_exact(&self, kind: ContentKind, text: &str) -> Verdict {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Verdict::Rejected(RejectReason::Empty);
        }
        if self.seen(kind, &normalized) {
            return Verdict::Rejected(RejectReason::Duplicate(kind));
        }
        Verdict::Unique
    }

    fn near_duplicate(&self, tokens: &FxHashSet<u64>) -> Option<f64> {
        let threshold = self.config.similarity_threshold?;
        self.window
            .iter()
            .map(|entry| token_overlap(tokens, &entry.tokens))
            .find(|s| *s >= threshold)
    }

    fn note_rejection(&mut self, verdict: &Verdict) {
        if let Verdict::Rejected(reason) = verdict {
            self.stats.rejected += 1;
            if reason.is_exact() {
                self.stats.duplicates += 1;
            } else if matches!(reason, RejectReason::NearDuplicate { .. }) {
                self.stats.near_duplicates += 1;
            }
        }
    }

    fn register(&mut self, kind: ContentKind, normalized: &str) {
        let hash = content_hash(normalized);
        let (present, collided) = self.index(kind).lookup(hash, normalized);
        if present {
            return;
        }
        if collided {
            self.stats.hash_collisions += 1;
            tracing::debug!(?kind, hash, "64-bit hash collision between distinct texts");
        }
        self.index_mut(kind).insert(hash, normalized);

        let mut entry = LogEntry {
            kind,
            hash,
            windowed: false,
            evicted: None,
        };
        if kind == ContentKind::Paragraph && self.config.similarity_threshold.is_some() {
            self.window.push_back(WindowEntry {
                tokens: token_set(normalized),
            });
            entry.windowed = true;
            if self.window.len() > self.config.similarity_window.max(1) {
                entry.evicted = self.window.pop_front();
            }
        }
        self.log.push(entry);

        match kind {
            ContentKind::Title => self.stats.titles += 1,
            ContentKind::Paragraph => self.stats.paragraphs += 1,
            ContentKind::Sentence => self.stats.sentences += 1,
        }
    }

    fn register_paragraph(&mut self, paragraph: &str) {
        let normalized = normalize(paragraph);
        self.register(ContentKind::Paragraph, &normalized);
        for sentence in split_sentences(paragraph) {
            let normalized = normalize(sentence);
            if self.tracks_sentence(&normalized) {
                self.register(ContentKind::Sentence, &normalized);
            }
        }
    }

    /// Number of distinct entries per kind.
    pub fn len(&self, kind: ContentKind) -> usize {
        self.index(kind).len()
    }
}

impl UniquenessChecker for HistoricalIndex {
    fn check_title(&self, title: &str) -> Verdict {
        self.check_exact(ContentKind::Title, title)
    }

    fn check_paragraph(&self, paragraph: &str) -> Verdict {
        let normalized = normalize(paragraph);
        if normalized.is_empty() {
            return Verdict::Rejected(RejectReason::Empty);
        }
        if self.seen(ContentKind::Paragraph, &normalized) {
            return Verdict::Rejected(RejectReason::Duplicate(ContentKind::Paragraph));
        }

        let mut local: FxHashSet<String> = FxHashSet::default();
        for sentence in split_sentences(paragraph) {
            let sentence_norm = normalize(sentence);
            if !self.tracks_sentence(&sentence_norm) {
                continue;
            }
            if self.seen(ContentKind::Sentence, &sentence_norm) {
                return Verdict::Rejected(RejectReason::DuplicateSentence(sentence.to_string()));
            }
            if !local.insert(sentence_norm) {
                return Verdict::Rejected(RejectReason::RepeatedSentence(sentence.to_string()));
            }
        }

        if let Some(similarity) = self.near_duplicate(&token_set(&normalized)) {
            return Verdict::Rejected(RejectReason::NearDuplicate { similarity });
        }
        Verdict::Unique
    }

    fn check_sentence(&self, sentence: &str) -> Verdict {
        let normalized = normalize(sentence);
        if normalized.is_empty() {
            return Verdict::Rejected(RejectReason::Empty);
        }
        if !self.tracks_sentence(&normalized) {
            return Verdict::Unique;
        }
        self.check_exact(ContentKind::Sentence, sentence)
    }

    fn validate_title(&mut self, title: &str) -> Verdict {
        let verdict = self.check_title(title);
        if verdict.is_valid() {
            self.register(ContentKind::Title, &normalize(title));
        } else {
            self.note_rejection(&verdict);
        }
        verdict
    }

    fn validate_paragraph(&mut self, paragraph: &str) -> Verdict {
        let verdict = self.check_paragraph(paragraph);
        if verdict.is_valid() {
            self.register_paragraph(paragraph);
        } else {
            self.note_rejection(&verdict);
        }
        verdict
    }

    fn validate_sentence(&mut self, sentence: &str) -> Verdict {
        let verdict = self.check_sentence(sentence);
        if verdict.is_valid() {
            let normalized = normalize(sentence);
            if self.tracks_sentence(&normalized) {
                self.register(ContentKind::Sentence, &normalized);
            }
        } else {
            self.note_rejection(&verdict);
        }
        verdict
    }

    fn validate_chapter(&self, chapter: &ChapterRecord) -> ChapterValidation {
        let mut duplicates = Vec::new();

        if let Verdict::Rejected(reason) = self.check_title(&chapter.title) {
            duplicates.push(DuplicateElement {
                kind: ContentKind::Title,
                paragraph: None,
                content: chapter.title.clone(),
                reason,
            });
        }

        let mut chapter_paragraphs: FxHashSet<String> = FxHashSet::default();
        let mut chapter_sentences: FxHashSet<String> = FxHashSet::default();
        for (index, paragraph) in chapter.paragraphs.iter().enumerate() {
            let normalized = normalize(paragraph);
            let paragraph_reason = if normalized.is_empty() {
                Some(RejectReason::Empty)
            } else if self.seen(ContentKind::Paragraph, &normalized) {
                Some(RejectReason::Duplicate(ContentKind::Paragraph))
            } else if !chapter_paragraphs.insert(normalized.clone()) {
                Some(RejectReason::Duplicate(ContentKind::Paragraph))
            } else {
                self.near_duplicate(&token_set(&normalized))
                    .map(|similarity| RejectReason::NearDuplicate { similarity })
            };
            if let Some(reason) = paragraph_reason {
                duplicates.push(DuplicateElement {
                    kind: ContentKind::Paragraph,
                    paragraph: Some(index),
                    content: paragraph.clone(),
                    reason,
                });
            }

            for sentence in split_sentences(paragraph) {
                let sentence_norm = normalize(sentence);
                if !self.tracks_sentence(&sentence_norm) {
                    continue;
                }
                let reason = if self.seen(ContentKind::Sentence, &sentence_norm) {
                    Some(RejectReason::Duplicate(ContentKind::Sentence))
                } else if !chapter_sentences.insert(sentence_norm) {
                    Some(RejectReason::RepeatedSentence(sentence.to_string()))
                } else {
                    None
                };
                if let Some(reason) = reason {
                    duplicates.push(DuplicateElement {
                        kind: ContentKind::Sentence,
                        paragraph: Some(index),
                        content: sentence.to_string(),
                        reason,
                    });
                }
            }
        }

        ChapterValidation {
            valid: duplicates.is_empty(),
            duplicates,
        }
    }

    fn register_chapter(&mut self, chapter: &ChapterRecord) {
        self.register(ContentKind::Title, &normalize(&chapter.title));
        for paragraph in &chapter.paragraphs {
            self.register_paragraph(paragraph);
        }
    }

    fn stats(&self) -> UniquenessStats {
        let mut stats = self.stats.clone();
        stats.generated = stats.titles + stats.paragraphs + stats.sentences;
        let attempts = stats.generated + stats.rejected;
        stats.uniqueness_rate = if attempts == 0 {
            1.0
        } else {
            stats.generated as f64 / attempts as f64
        };
        stats
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.log.len())
    }

    fn rollback(&mut self, checkpoint: Checkpoint) {
        while self.log.len() > checkpoint.0 {
            let Some(entry) = self.log.pop() else { break };
            self.index_mut(entry.kind).remove_last(entry.hash);
            if entry.windowed {
                self.window.pop_back();
                if let Some(evicted) = entry.evicted {
                    self.window.push_front(evicted);
                }
            }
            match entry.kind {
                ContentKind::Title => self.stats.titles -= 1,
                ContentKind::Paragraph => self.stats.paragraphs -= 1,
                ContentKind::Sentence => self.stats.sentences -= 1,
            }
        }
    }

    fn commit(&mut self) {
        self.log.clear();
    }

    fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}
