//! Plain data records shared by the engine and its external consumers.

pub mod category;
pub mod chapter;
pub mod directive;
pub mod protagonist;
pub mod reading;
pub mod tracker;
