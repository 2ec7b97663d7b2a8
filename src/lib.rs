//! Serial Engine — a perpetual serialized-fiction generator.
//!
//! Chapters are composed from content pools and a stochastic grammar, checked
//! against every sentence, paragraph and title already written, and paced by
//! how far a privileged reader has read. Pools grow as they are consumed so
//! the serial never has to repeat itself.

pub mod core;
pub mod schema;

pub use crate::core::config::EngineConfig;
pub use crate::core::content::{ContentError, ContentPack};
pub use crate::core::generator::{ChapterGenerator, GeneratorError};
pub use crate::core::persistence::{FileStore, MemoryStore, Persistence};
pub use crate::core::scheduler::{ReadingScheduler, SchedulerError};
pub use crate::schema::chapter::ChapterRecord;
