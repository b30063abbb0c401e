//! Extraction of file edits from fenced output blocks.
//!
//! Aider emits edits in several notations (whole-file replacement, inline
//! and fenced SEARCH/REPLACE, unified diff). Each extractor recognizes one
//! notation and produces a normalized record, or declines. Dispatch order
//! is fixed; the first extractor to match wins, and anything unmatched is
//! reported as a plain code block rather than dropped.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The edit notations aider can be configured to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EditFormat {
    Whole,
    Diff,
    DiffFenced,
    Udiff,
    EditorDiff,
    EditorWhole,
}

impl EditFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditFormat::Whole => "whole",
            EditFormat::Diff => "diff",
            EditFormat::DiffFenced => "diff-fenced",
            EditFormat::Udiff => "udiff",
            EditFormat::EditorDiff => "editor-diff",
            EditFormat::EditorWhole => "editor-whole",
        }
    }

    /// Parse one of aider's `--edit-format` names.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "whole" => Some(EditFormat::Whole),
            "diff" => Some(EditFormat::Diff),
            "diff-fenced" => Some(EditFormat::DiffFenced),
            "udiff" => Some(EditFormat::Udiff),
            "editor-diff" => Some(EditFormat::EditorDiff),
            "editor-whole" => Some(EditFormat::EditorWhole),
            _ => None,
        }
    }
}

/// One proposed single-file mutation extracted from the stream.
///
/// `old_text` is absent for whole-file replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditBlock {
    pub format: EditFormat,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_text: Option<String>,
    pub new_text: String,
}

/// A fenced block that is not an edit (paste-back, illustrative snippet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeBlock {
    pub path: String,
    pub content: String,
}

/// Label used when a plain code block carries no path or language.
pub const UNKNOWN_PATH: &str = "unknown";

pub(crate) const SEARCH_MARKER: &str = "<<<<<<< SEARCH";
pub(crate) const DIVIDER_MARKER: &str = "=======";
pub(crate) const REPLACE_MARKER: &str = ">>>>>>> REPLACE";

static BARE_IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").unwrap());

/// Whether a line reads as a file path rather than diff or code content.
///
/// A path has no whitespace, carries no fence or diff-marker syntax, and
/// either contains `/` or `.` or is a bare identifier.
pub fn is_plausible_path(line: &str) -> bool {
    let candidate = line.trim();
    if candidate.is_empty() || candidate.chars().any(char::is_whitespace) {
        return false;
    }
    if candidate.starts_with("```")
        || candidate.starts_with("<<<")
        || candidate.starts_with(">>>")
        || candidate.starts_with("===")
        || candidate.starts_with('+')
        || candidate.starts_with('-')
    {
        return false;
    }
    candidate.contains('/') || candidate.contains('.') || BARE_IDENT_RE.is_match(candidate)
}

/// Result of running the extractor chain over one fenced block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Edit(EditBlock),
    Code(CodeBlock),
}

/// Run the extractor chain over one fenced block.
///
/// `path_hint` is the plain line immediately preceding the fence when it
/// looked like a path; `label` is the text after the opening fence marker.
pub fn extract_block(path_hint: Option<&str>, label: &str, lines: &[String]) -> Extracted {
    // 1. Path + fence pairing: SEARCH/REPLACE if the marker is present,
    //    otherwise the body is the whole new file content.
    if let Some(path) = path_hint {
        if lines.iter().any(|l| l.trim() == SEARCH_MARKER) {
            return match extract_search_replace(path, lines) {
                Some(block) => Extracted::Edit(block),
                None => Extracted::Code(CodeBlock {
                    path: path.to_string(),
                    content: lines.join("\n"),
                }),
            };
        }
        return Extracted::Edit(EditBlock {
            format: EditFormat::Whole,
            path: path.to_string(),
            old_text: None,
            new_text: lines.join("\n"),
        });
    }

    // 2. Diff-fenced: the path is the first body line.
    if let Some(block) = extract_diff_fenced(lines) {
        return Extracted::Edit(block);
    }

    // 3. Unified diff, only for blocks labeled as such.
    if matches!(label, "diff" | "udiff")
        && let Some(block) = extract_udiff(lines)
    {
        return Extracted::Edit(block);
    }

    // 4. Fallback: a plain code block labeled by the fence label.
    let path = if label.is_empty() {
        UNKNOWN_PATH.to_string()
    } else {
        label.to_string()
    };
    Extracted::Code(CodeBlock {
        path,
        content: lines.join("\n"),
    })
}

/// Extract the first SEARCH/REPLACE triplet from a block body.
///
/// Later triplets in the same block are ignored, matching upstream
/// behavior.
fn extract_search_replace(path: &str, lines: &[String]) -> Option<EditBlock> {
    let start = lines.iter().position(|l| l.trim() == SEARCH_MARKER)?;
    let divider = start
        + 1
        + lines[start + 1..]
            .iter()
            .position(|l| l.trim() == DIVIDER_MARKER)?;
    let end = divider
        + 1
        + lines[divider + 1..]
            .iter()
            .position(|l| l.trim() == REPLACE_MARKER)?;

    Some(EditBlock {
        format: EditFormat::Diff,
        path: path.trim().to_string(),
        old_text: Some(lines[start + 1..divider].join("\n")),
        new_text: lines[divider + 1..end].join("\n"),
    })
}

/// A standalone fenced block whose first line is the path and whose body
/// carries a SEARCH/REPLACE triplet.
fn extract_diff_fenced(lines: &[String]) -> Option<EditBlock> {
    let (first, rest) = lines.split_first()?;
    if !is_plausible_path(first) {
        return None;
    }
    let mut block = extract_search_replace(first.trim(), rest)?;
    block.format = EditFormat::DiffFenced;
    Some(block)
}

/// Scan a `diff`/`udiff` block line by line.
///
/// `--- ` sets a candidate path, `+++ <nonempty>` overrides it; `-`/`+`
/// lines accumulate into old/new text. No path means no edit.
fn extract_udiff(lines: &[String]) -> Option<EditBlock> {
    let mut path: Option<String> = None;
    let mut old_lines: Vec<&str> = Vec::new();
    let mut new_lines: Vec<&str> = Vec::new();

    for line in lines {
        if let Some(rest) = line.strip_prefix("--- ") {
            let rest = rest.trim();
            if !rest.is_empty() {
                path = Some(rest.to_string());
            }
        } else if line.starts_with("---") {
            // Bare separator, not a header.
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let rest = rest.trim();
            if !rest.is_empty() {
                path = Some(rest.to_string());
            }
        } else if line.starts_with("+++") {
        } else if let Some(rest) = line.strip_prefix('+') {
            new_lines.push(rest);
        } else if let Some(rest) = line.strip_prefix('-') {
            old_lines.push(rest);
        }
    }

    Some(EditBlock {
        format: EditFormat::Udiff,
        path: path?,
        old_text: Some(old_lines.join("\n")),
        new_text: new_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(body: &[&str]) -> Vec<String> {
        body.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn whole_file_replacement() {
        let result = extract_block(Some("src/app.py"), "python", &lines(&["x = 1", "y = 2"]));
        assert_eq!(
            result,
            Extracted::Edit(EditBlock {
                format: EditFormat::Whole,
                path: "src/app.py".into(),
                old_text: None,
                new_text: "x = 1\ny = 2".into(),
            })
        );
    }

    #[test]
    fn search_replace_under_path() {
        let body = lines(&[
            "<<<<<<< SEARCH",
            "old line",
            "=======",
            "new line",
            ">>>>>>> REPLACE",
        ]);
        let result = extract_block(Some("app.py"), "", &body);
        assert_eq!(
            result,
            Extracted::Edit(EditBlock {
                format: EditFormat::Diff,
                path: "app.py".into(),
                old_text: Some("old line".into()),
                new_text: "new line".into(),
            })
        );
    }

    #[test]
    fn only_first_triplet_honored() {
        let body = lines(&[
            "<<<<<<< SEARCH",
            "a",
            "=======",
            "b",
            ">>>>>>> REPLACE",
            "<<<<<<< SEARCH",
            "c",
            "=======",
            "d",
            ">>>>>>> REPLACE",
        ]);
        let Extracted::Edit(block) = extract_block(Some("f.py"), "", &body) else {
            panic!("expected an edit");
        };
        assert_eq!(block.old_text.as_deref(), Some("a"));
        assert_eq!(block.new_text, "b");
    }

    #[test]
    fn malformed_triplet_degrades_to_code() {
        let body = lines(&["<<<<<<< SEARCH", "a", "======="]);
        assert!(matches!(
            extract_block(Some("f.py"), "", &body),
            Extracted::Code(_)
        ));
    }

    #[test]
    fn diff_fenced_path_inside_block() {
        let body = lines(&[
            "src/lib.rs",
            "<<<<<<< SEARCH",
            "fn old() {}",
            "=======",
            "fn new() {}",
            ">>>>>>> REPLACE",
        ]);
        let Extracted::Edit(block) = extract_block(None, "", &body) else {
            panic!("expected an edit");
        };
        assert_eq!(block.format, EditFormat::DiffFenced);
        assert_eq!(block.path, "src/lib.rs");
        assert_eq!(block.old_text.as_deref(), Some("fn old() {}"));
    }

    #[test]
    fn unified_diff() {
        let body = lines(&["--- a/f", "+++ a/f", "-old", "+new"]);
        let Extracted::Edit(block) = extract_block(None, "diff", &body) else {
            panic!("expected an edit");
        };
        assert_eq!(block.format, EditFormat::Udiff);
        assert_eq!(block.path, "a/f");
        assert_eq!(block.old_text.as_deref(), Some("old"));
        assert_eq!(block.new_text, "new");
    }

    #[test]
    fn udiff_without_headers_declines() {
        let body = lines(&["-old", "+new"]);
        assert!(matches!(
            extract_block(None, "diff", &body),
            Extracted::Code(_)
        ));
    }

    #[test]
    fn udiff_ignores_context_and_hunk_lines() {
        let body = lines(&["--- a/f", "+++ b/f", "@@ -1,2 +1,2 @@", " ctx", "-x", "+y"]);
        let Extracted::Edit(block) = extract_block(None, "udiff", &body) else {
            panic!("expected an edit");
        };
        assert_eq!(block.path, "b/f");
        assert_eq!(block.old_text.as_deref(), Some("x"));
        assert_eq!(block.new_text, "y");
    }

    #[test]
    fn plain_block_falls_back_to_label() {
        let result = extract_block(None, "python", &lines(&["print(1)"]));
        assert_eq!(
            result,
            Extracted::Code(CodeBlock {
                path: "python".into(),
                content: "print(1)".into(),
            })
        );
    }

    #[test]
    fn unlabeled_block_is_unknown() {
        let Extracted::Code(code) = extract_block(None, "", &lines(&["stuff"])) else {
            panic!("expected a code block");
        };
        assert_eq!(code.path, UNKNOWN_PATH);
    }

    #[test]
    fn path_plausibility() {
        assert!(is_plausible_path("src/main.rs"));
        assert!(is_plausible_path("setup.py"));
        assert!(is_plausible_path("Makefile"));
        assert!(!is_plausible_path("two words"));
        assert!(!is_plausible_path("```python"));
        assert!(!is_plausible_path("<<<<<<< SEARCH"));
        assert!(!is_plausible_path("+added.line"));
        assert!(!is_plausible_path("-removed.line"));
        assert!(!is_plausible_path(""));
    }

    #[test]
    fn edit_format_names() {
        for format in [
            EditFormat::Whole,
            EditFormat::Diff,
            EditFormat::DiffFenced,
            EditFormat::Udiff,
            EditFormat::EditorDiff,
            EditFormat::EditorWhole,
        ] {
            assert_eq!(EditFormat::parse(format.as_str()), Some(format));
        }
        assert_eq!(EditFormat::parse("patch"), None);
    }
}
