//! Interpretation of aider's free-text output.
//!
//! The aider CLI talks to humans: file diffs, progress bars, model
//! banners, and questions all share one unframed text stream. This crate
//! turns a chunk of that stream into typed records — segmentation first,
//! then edit extraction and per-line classification, assembled by the
//! aggregator.

pub mod classify;
pub mod edits;
pub mod output;
pub mod segment;

pub use classify::{AiderInfo, LineClass, MetaLine, classify_line, is_confirmation_prompt};
pub use edits::{CodeBlock, EditBlock, EditFormat, Extracted, extract_block, is_plausible_path};
pub use output::{ParsedOutput, parse_output};
pub use segment::{Segment, fence_label, segment};
