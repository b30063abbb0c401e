//! Per-chunk aggregation: raw subprocess text in, typed records out.
//!
//! Drives segmentation, then feeds code segments through the extractor
//! chain and plain lines through the classifier, assembling metadata,
//! residual conversation, edits, code blocks, and pending prompts into one
//! result. Pure over its input chunk; safe to call concurrently.

use crate::classify::{AiderInfo, LineClass, MetaLine, classify_line, strip_decorations};
use crate::edits::{CodeBlock, EditBlock, Extracted, extract_block, is_plausible_path};
use crate::segment::{Segment, fence_label, segment};

/// Everything extracted from one chunk of aider output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub info: AiderInfo,
    pub user_message: String,
    pub edit_blocks: Vec<EditBlock>,
    pub code_blocks: Vec<CodeBlock>,
    pub prompts: Vec<String>,
    /// Paths aider reported adding to or dropping from its chat context.
    pub files_added: Vec<String>,
    pub files_dropped: Vec<String>,
}

struct Aggregator {
    out: ParsedOutput,
    message_lines: Vec<String>,
    capture_started: bool,
}

impl Aggregator {
    fn new() -> Self {
        Self {
            out: ParsedOutput::default(),
            message_lines: Vec::new(),
            capture_started: false,
        }
    }

    fn plain_line(&mut self, line: &str) {
        match classify_line(line) {
            LineClass::Blank => {
                // Blank lines inside a captured message keep paragraph
                // breaks; leading blanks never start the capture.
                if self.capture_started {
                    self.message_lines.push(String::new());
                }
            }
            LineClass::CommandEcho => {}
            LineClass::ConfirmationPrompt => {
                let prompt = strip_decorations(line);
                if self.out.prompts.last() != Some(&prompt) {
                    self.out.prompts.push(prompt);
                }
            }
            LineClass::Meta(meta) => match self.out.info.absorb(meta) {
                Some(MetaLine::FileAdded(path)) => self.out.files_added.push(path),
                Some(MetaLine::FileDropped(path)) => self.out.files_dropped.push(path),
                _ => {}
            },
            LineClass::Text => {
                self.capture_started = true;
                self.message_lines.push(line.trim_end().to_string());
            }
        }
    }

    fn code_segment(&mut self, path_hint: Option<&str>, open: &str, lines: &[String]) {
        let label = fence_label(open).unwrap_or("");
        match extract_block(path_hint, label, lines) {
            Extracted::Edit(block) => self.out.edit_blocks.push(block),
            Extracted::Code(block) => self.out.code_blocks.push(block),
        }
    }

    fn finish(mut self) -> ParsedOutput {
        let mut message = self.message_lines.join("\n");
        message.truncate(message.trim_end().len());
        self.out.user_message = message;
        self.out
    }
}

/// Interpret one chunk of subprocess output.
pub fn parse_output(chunk: &str) -> ParsedOutput {
    let segments = segment(chunk);
    let mut agg = Aggregator::new();

    let mut i = 0;
    while i < segments.len() {
        match &segments[i] {
            Segment::Line(line) => {
                // A path-looking line directly above a fence labels that
                // block instead of joining the conversation.
                if let Some(Segment::Code { open, lines, .. }) = segments.get(i + 1) {
                    let candidate = line.trim();
                    if is_plausible_path(candidate)
                        && !matches!(classify_line(line), LineClass::CommandEcho)
                    {
                        agg.code_segment(Some(candidate), open, lines);
                        i += 2;
                        continue;
                    }
                }
                agg.plain_line(line);
            }
            Segment::Code { open, lines, .. } => {
                agg.code_segment(None, open, lines);
            }
            Segment::Incomplete { lines, .. } => {
                // Truncated mid-stream: the body still reads as ordinary
                // conversational text, a later chunk may close the block.
                for line in lines {
                    agg.plain_line(line);
                }
            }
        }
        i += 1;
    }

    agg.finish()
}
