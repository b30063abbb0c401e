//! Per-line heuristics over aider's plain output lines.
//!
//! Classification runs an ordered rule table so precedence stays auditable:
//! command echo > confirmation prompt > structured metadata > residual text.
//! Each rule is a named function, unit-testable on its own.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Category assigned to one plain output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    /// Empty after decoration stripping.
    Blank,
    /// Echo of a shell command (`$ cargo test`).
    CommandEcho,
    /// A yes/no or multiple-choice question aider is blocking on.
    ConfirmationPrompt,
    /// A recognized structured metadata line.
    Meta(MetaLine),
    /// Residual conversational text.
    Text,
}

/// One recognized metadata line, with its captured payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaLine {
    Version(String),
    MainModel(String),
    WeakModel(String),
    GitRepo(String),
    RepoMap(String),
    ChatTokens(String),
    Cost(String),
    Warning(String),
    Error(String),
    FileAdded(String),
    FileDropped(String),
    Notice(String),
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Aider v(\S+)").unwrap());
static MAIN_MODEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Main model:\s*(.+)$").unwrap());
static WEAK_MODEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Weak model:\s*(.+)$").unwrap());
static GIT_REPO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Git repo:\s*(.+)$").unwrap());
static REPO_MAP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Repo-map:\s*(.+)$").unwrap());
static TOKENS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Tokens?:\s*(.+)$").unwrap());
static COST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Cost:\s*(.+)$").unwrap());
static FILE_ADDED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Added (.+?) to the chat").unwrap());
static FILE_DROPPED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:Removed|Dropped) (.+?) from the chat").unwrap());

/// Yes/no phrasings aider uses when blocking for input.
static YES_NO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\(y/n\)|\[y/n\]|\(y\)es|\(d\)on'?t ask").unwrap());
static ADD_FILE_PROMPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)add .+ to the chat\?").unwrap());

/// Progress-bar block characters (tqdm-style) stripped before classification.
static PROGRESS_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[█▉▊▋▌▍▎▏░▒▓]+").unwrap());

/// Leading status glyphs aider prefixes onto warnings, errors, and file notices.
const STATUS_GLYPHS: &[char] = &['⚠', '✘', '✖', '✗', '❌', '📁', '🔴', 'ℹ'];

/// Informational prefixes that are metadata rather than conversation.
const NOTICE_PREFIXES: &[&str] = &[
    "Use /help",
    "Commit ",
    "Applied edit to ",
    "Scraping ",
    "Added .aider",
    "Restored previous conversation",
];

/// Strip leading status glyphs and progress-bar runs from a line.
pub fn strip_decorations(line: &str) -> String {
    let mut rest = line.trim();
    loop {
        let Some(first) = rest.chars().next() else {
            break;
        };
        if STATUS_GLYPHS.contains(&first) {
            rest = rest[first.len_utf8()..].trim_start();
            continue;
        }
        break;
    }
    PROGRESS_RUN_RE.replace_all(rest, "").trim().to_string()
}

// ---------------------------------------------------------------------------
// Rules, in priority order
// ---------------------------------------------------------------------------

fn command_echo_rule(line: &str) -> Option<LineClass> {
    if line.starts_with("$ ") || line.starts_with("❯ ") {
        Some(LineClass::CommandEcho)
    } else {
        None
    }
}

fn confirmation_prompt_rule(line: &str) -> Option<LineClass> {
    if !line.contains('?') {
        return None;
    }
    if YES_NO_RE.is_match(line) || ADD_FILE_PROMPT_RE.is_match(line) {
        Some(LineClass::ConfirmationPrompt)
    } else {
        None
    }
}

fn metadata_rule(line: &str) -> Option<LineClass> {
    let capture = |re: &Regex| re.captures(line).map(|c| c[1].trim().to_string());

    if let Some(v) = capture(&VERSION_RE) {
        return Some(LineClass::Meta(MetaLine::Version(v)));
    }
    if let Some(v) = capture(&MAIN_MODEL_RE) {
        return Some(LineClass::Meta(MetaLine::MainModel(v)));
    }
    if let Some(v) = capture(&WEAK_MODEL_RE) {
        return Some(LineClass::Meta(MetaLine::WeakModel(v)));
    }
    if let Some(v) = capture(&GIT_REPO_RE) {
        return Some(LineClass::Meta(MetaLine::GitRepo(v)));
    }
    if let Some(v) = capture(&REPO_MAP_RE) {
        return Some(LineClass::Meta(MetaLine::RepoMap(v)));
    }
    if let Some(v) = capture(&TOKENS_RE) {
        return Some(LineClass::Meta(MetaLine::ChatTokens(v)));
    }
    if let Some(v) = capture(&COST_RE) {
        return Some(LineClass::Meta(MetaLine::Cost(v)));
    }
    if let Some(v) = capture(&FILE_ADDED_RE) {
        return Some(LineClass::Meta(MetaLine::FileAdded(v)));
    }
    if let Some(v) = capture(&FILE_DROPPED_RE) {
        return Some(LineClass::Meta(MetaLine::FileDropped(v)));
    }

    let lower = line.to_lowercase();
    if lower.contains("warning") {
        return Some(LineClass::Meta(MetaLine::Warning(line.to_string())));
    }
    if lower.contains("error") {
        return Some(LineClass::Meta(MetaLine::Error(line.to_string())));
    }

    for prefix in NOTICE_PREFIXES {
        if line.starts_with(prefix) {
            return Some(LineClass::Meta(MetaLine::Notice(line.to_string())));
        }
    }

    None
}

type Rule = fn(&str) -> Option<LineClass>;

/// Priority-ordered classification rules. First match wins.
const RULES: &[(&str, Rule)] = &[
    ("command-echo", command_echo_rule),
    ("confirmation-prompt", confirmation_prompt_rule),
    ("metadata", metadata_rule),
];

/// Classify one plain output line into exactly one category.
pub fn classify_line(raw: &str) -> LineClass {
    let line = strip_decorations(raw);
    if line.is_empty() {
        return LineClass::Blank;
    }
    for (_name, rule) in RULES {
        if let Some(class) = rule(&line) {
            return class;
        }
    }
    LineClass::Text
}

/// Whether a line reads as a question aider is blocking on.
pub fn is_confirmation_prompt(line: &str) -> bool {
    matches!(classify_line(line), LineClass::ConfirmationPrompt)
}

// ---------------------------------------------------------------------------
// AiderInfo
// ---------------------------------------------------------------------------

/// Metadata aggregated from the lines of one output chunk.
///
/// Accumulates only within one aggregation pass; callers decide how to merge
/// across chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiderInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weak_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_map: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_tokens: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl AiderInfo {
    /// Fold one recognized metadata line into the aggregate.
    pub fn absorb(&mut self, meta: MetaLine) -> Option<MetaLine> {
        match meta {
            MetaLine::Version(v) => self.version = Some(v),
            MetaLine::MainModel(v) => self.main_model = Some(v),
            MetaLine::WeakModel(v) => self.weak_model = Some(v),
            MetaLine::GitRepo(v) => self.git_repo = Some(v),
            MetaLine::RepoMap(v) => self.repo_map = Some(v),
            MetaLine::ChatTokens(v) => self.chat_tokens = Some(v),
            MetaLine::Cost(v) => self.cost = Some(v),
            MetaLine::Warning(v) => self.warnings.push(v),
            MetaLine::Error(v) => self.errors.push(v),
            other => return Some(other),
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for AiderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<String> = Vec::new();
        if let Some(v) = &self.version {
            lines.push(format!("Aider v{v}"));
        }
        if let Some(v) = &self.main_model {
            lines.push(format!("Main model: {v}"));
        }
        if let Some(v) = &self.weak_model {
            lines.push(format!("Weak model: {v}"));
        }
        if let Some(v) = &self.git_repo {
            lines.push(format!("Git repo: {v}"));
        }
        if let Some(v) = &self.repo_map {
            lines.push(format!("Repo-map: {v}"));
        }
        if let Some(v) = &self.chat_tokens {
            lines.push(format!("Tokens: {v}"));
        }
        if let Some(v) = &self.cost {
            lines.push(format!("Cost: {v}"));
        }
        lines.extend(self.warnings.iter().cloned());
        lines.extend(self.errors.iter().cloned());
        write!(f, "{}", lines.join("\n"))
    }
}
