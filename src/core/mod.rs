pub mod arc;
pub mod config;
pub mod content;
pub mod directives;
pub mod expansion;
pub mod generator;
pub mod grammar;
pub mod persistence;
pub mod pools;
pub mod scheduler;
pub mod uniqueness;
pub mod variety;
