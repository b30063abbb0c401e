//! Fence-aware segmentation of raw aider output.
//!
//! Aider interleaves conversational text with triple-backtick code blocks
//! and gives us no out-of-band framing, so everything downstream (edit
//! extraction, line classification) starts from this pass. The scanner is a
//! two-state machine: outside-fence lines are plain, an opening fence
//! collects body lines until the closing fence arrives.

/// A classified span of raw subprocess text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// An ordinary line outside any fenced block.
    Line(String),
    /// A complete fenced block: opening fence, body lines, closing fence.
    Code {
        open: String,
        lines: Vec<String>,
        close: String,
    },
    /// A fence that was opened but never closed before the chunk ended.
    /// The body is kept; a later chunk may complete the block, and in the
    /// meantime the lines still read as conversational text.
    Incomplete { open: String, lines: Vec<String> },
}

/// The text following a fence marker, trimmed, if the line is a fence line.
///
/// A fence line is optional leading whitespace, three backticks, and an
/// optional label. Returns `Some("")` for a bare fence.
pub fn fence_label(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix("```")?;
    Some(rest.trim())
}

fn is_fence_line(line: &str) -> bool {
    fence_label(line).is_some()
}

/// Split a chunk of output into segments.
///
/// Coverage is lossless: joining the segment lines with `\n` reconstructs
/// the input exactly. The scanner self-checks that property and degrades to
/// one plain-line segment per line if it ever fails to hold, since this is
/// a best-effort heuristic pass, not a strict grammar.
pub fn segment(text: &str) -> Vec<Segment> {
    let segments = scan(text);
    if reassemble(&segments) == text {
        segments
    } else {
        text.split('\n')
            .map(|line| Segment::Line(line.to_string()))
            .collect()
    }
}

fn scan(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut open: Option<String> = None;
    let mut body: Vec<String> = Vec::new();

    for line in text.split('\n') {
        match open.take() {
            None => {
                if is_fence_line(line) {
                    open = Some(line.to_string());
                } else {
                    segments.push(Segment::Line(line.to_string()));
                }
            }
            Some(opened) => {
                if is_fence_line(line) {
                    segments.push(Segment::Code {
                        open: opened,
                        lines: std::mem::take(&mut body),
                        close: line.to_string(),
                    });
                } else {
                    body.push(line.to_string());
                    open = Some(opened);
                }
            }
        }
    }

    if let Some(opened) = open {
        segments.push(Segment::Incomplete {
            open: opened,
            lines: body,
        });
    }

    segments
}

/// Rebuild the original text from a segment list.
pub fn reassemble(segments: &[Segment]) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for seg in segments {
        match seg {
            Segment::Line(line) => lines.push(line),
            Segment::Code { open, lines: body, close } => {
                lines.push(open);
                lines.extend(body.iter().map(String::as_str));
                lines.push(close);
            }
            Segment::Incomplete { open, lines: body } => {
                lines.push(open);
                lines.extend(body.iter().map(String::as_str));
            }
        }
    }
    lines.join("\n")
}
