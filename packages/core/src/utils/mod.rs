//! Utility functions shared across the store and query layers.

mod markdown;

pub use markdown::normalize_content;
