//! Rendering analysis results for people and tools.

pub mod generator;

pub use generator::{generate_json_report, generate_markdown_report, write_report};
