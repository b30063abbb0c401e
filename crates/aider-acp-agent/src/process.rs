//! The aider subprocess and its lifecycle-event channel.
//!
//! Aider has no machine-readable protocol; it prints text and blocks on a
//! readline prompt. The wrapper spawns the CLI with piped stdio, scans each
//! stdout flush for turn boundaries and confirmation questions, and turns
//! what it sees into one channel of [`ProcessEvent`]s. The orchestrator
//! never subscribes to anything else; awaiting a turn is a single receive.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use aider_acp_parser::is_confirmation_prompt;

/// Where the subprocess currently is in its read/respond cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Ready,
    Processing,
    WaitingForConfirmation,
}

/// Lifecycle messages emitted over the process event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The input prompt is showing; aider is idle.
    Ready,
    /// A flush of raw stdout text.
    Data(String),
    /// Aider is blocking on a yes/no style question.
    ConfirmationRequired(String),
    /// A processing phase ended and the prompt came back.
    TurnCompleted,
    /// Non-fatal stderr noise worth surfacing.
    Warning(String),
    /// Stderr text that reads as a real error. Terminal for the in-flight
    /// turn, not for the process.
    Errored(String),
    /// The process went away.
    Exited(String),
}

/// Seam between the orchestrator and the real subprocess.
pub trait CliProcess: Send + Sync {
    fn send_command(&self, text: &str)
    -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    fn answer_confirmation(
        &self,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    fn interrupt(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    fn stop(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    fn state(&self) -> ProcessState;
}

// ---------------------------------------------------------------------------
// Output heuristics
// ---------------------------------------------------------------------------

/// The readline prompt aider shows when idle: `>`, `architect>`, `ask>`.
static INPUT_PROMPT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z-]*>$").unwrap());

/// tqdm-style progress scans: percent markers, block-character bars,
/// rate suffixes. Pure screen noise, never an error.
static PROGRESS_NOISE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+%\||[█▉▊▋▌▍▎▏░▒▓]|it/s\]|\ds/it\]").unwrap());

/// Python teardown chatter that reads scary but is not a failure.
const CLEANUP_NOTICE_MARKERS: &[&str] = &[
    "resource_tracker",
    "Unable to clean up",
    "leaked semaphore",
    "Exception ignored in",
];

fn last_non_empty_line(chunk: &str) -> Option<&str> {
    chunk.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

fn is_input_prompt(line: &str) -> bool {
    INPUT_PROMPT_RE.is_match(line.trim())
}

/// Classification for one stderr line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StderrKind {
    Noise,
    Cleanup,
    Fatal,
}

fn triage_stderr(line: &str) -> StderrKind {
    if PROGRESS_NOISE_RE.is_match(line) {
        return StderrKind::Noise;
    }
    if CLEANUP_NOTICE_MARKERS.iter().any(|m| line.contains(m)) {
        return StderrKind::Cleanup;
    }
    StderrKind::Fatal
}

/// Inspect one stdout flush and emit the events it implies.
fn scan_stdout_chunk(
    state: &StdMutex<ProcessState>,
    tx: &mpsc::UnboundedSender<ProcessEvent>,
    chunk: &str,
) {
    let _ = tx.send(ProcessEvent::Data(chunk.to_string()));

    let Some(tail) = last_non_empty_line(chunk) else {
        return;
    };

    if is_confirmation_prompt(tail) {
        *state.lock().unwrap() = ProcessState::WaitingForConfirmation;
        let _ = tx.send(ProcessEvent::ConfirmationRequired(tail.to_string()));
    } else if is_input_prompt(tail) {
        let previous = {
            let mut s = state.lock().unwrap();
            let previous = *s;
            *s = ProcessState::Ready;
            previous
        };
        if previous == ProcessState::Processing {
            let _ = tx.send(ProcessEvent::TurnCompleted);
        }
        let _ = tx.send(ProcessEvent::Ready);
    }
}

// ---------------------------------------------------------------------------
// AiderProcess
// ---------------------------------------------------------------------------

enum WriteCmd {
    Send(String),
    Close,
}

pub struct AiderProcess {
    state: Arc<StdMutex<ProcessState>>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<WriteCmd>>>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
}

impl AiderProcess {
    /// Spawn the aider CLI and wire up the event channel.
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: &std::path::Path,
    ) -> anyhow::Result<(Arc<Self>, mpsc::UnboundedReceiver<ProcessEvent>)> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.env("NO_COLOR", "1");

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn '{}': {}", command, e))?;

        let pid = child.id();
        let child_stdout = child.stdout.take().expect("child stdout");
        let child_stderr = child.stderr.take().expect("child stderr");
        let mut child_stdin = child.stdin.take().expect("child stdin");

        let (event_tx, event_rx) = mpsc::unbounded_channel::<ProcessEvent>();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteCmd>();
        let state = Arc::new(StdMutex::new(ProcessState::Starting));

        tokio::spawn(async move {
            while let Some(cmd) = write_rx.recv().await {
                match cmd {
                    WriteCmd::Send(payload) => {
                        if child_stdin.write_all(payload.as_bytes()).await.is_err() {
                            break;
                        }
                        let _ = child_stdin.flush().await;
                    }
                    WriteCmd::Close => break,
                }
            }
            let _ = child_stdin.shutdown().await;
        });

        {
            let state = state.clone();
            let tx = event_tx.clone();
            tokio::spawn(async move {
                let mut stdout = child_stdout;
                let mut buf = vec![0u8; 8192];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                            scan_stdout_chunk(&state, &tx, &chunk);
                        }
                    }
                }
                debug!("[aider] stdout closed, process likely exited");
                let _ = tx.send(ProcessEvent::Exited("aider process exited".to_string()));
            });
        }

        {
            let tx = event_tx;
            tokio::spawn(async move {
                let mut lines = BufReader::new(child_stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let text = line.trim().to_string();
                    if text.is_empty() {
                        continue;
                    }
                    match triage_stderr(&text) {
                        StderrKind::Noise => {}
                        StderrKind::Cleanup => {
                            let _ = tx.send(ProcessEvent::Warning(text));
                        }
                        StderrKind::Fatal => {
                            let _ = tx.send(ProcessEvent::Errored(text));
                        }
                    }
                }
            });
        }

        let process = Arc::new(Self {
            state,
            write_tx: Mutex::new(Some(write_tx)),
            child: Mutex::new(Some(child)),
            pid,
        });

        Ok((process, event_rx))
    }

    async fn write_line(&self, text: &str) -> anyhow::Result<()> {
        let payload = format!("{}\n", text);
        let tx = self.write_tx.lock().await;
        match tx.as_ref() {
            Some(tx) => {
                tx.send(WriteCmd::Send(payload))
                    .map_err(|_| anyhow::anyhow!("aider stdin is closed"))?;
                Ok(())
            }
            None => Err(anyhow::anyhow!("aider stdin is closed")),
        }
    }
}

impl CliProcess for AiderProcess {
    fn send_command(
        &self,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let text = text.to_string();
        Box::pin(async move {
            self.write_line(&text).await?;
            *self.state.lock().unwrap() = ProcessState::Processing;
            Ok(())
        })
    }

    fn answer_confirmation(
        &self,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let text = text.to_string();
        Box::pin(async move {
            self.write_line(&text).await?;
            *self.state.lock().unwrap() = ProcessState::Processing;
            Ok(())
        })
    }

    fn interrupt(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            #[cfg(unix)]
            if let Some(pid) = self.pid {
                let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
                if ret == 0 {
                    return Ok(());
                }
                debug!("[aider] SIGINT delivery failed, falling back to stop");
            }
            // Signal delivery failed (or no pid): hard stop, losing any
            // unflushed output.
            self.stop().await
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(tx) = self.write_tx.lock().await.take() {
                let _ = tx.send(WriteCmd::Close);
            }
            if let Some(mut child) = self.child.lock().await.take() {
                let _ = child.kill().await;
            }
            Ok(())
        })
    }

    fn state(&self) -> ProcessState {
        *self.state.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn prompt_tail_detection() {
        assert!(is_input_prompt(">"));
        assert!(is_input_prompt("> "));
        assert!(is_input_prompt("architect>"));
        assert!(!is_input_prompt("> quoted reply"));
        assert!(!is_input_prompt("1 > 0"));
    }

    #[test]
    fn last_non_empty_line_skips_blanks() {
        assert_eq!(last_non_empty_line("a\nb\n\n  \n"), Some("b"));
        assert_eq!(last_non_empty_line("\n\n"), None);
    }

    #[test]
    fn processing_then_prompt_completes_turn() {
        let state = StdMutex::new(ProcessState::Processing);
        let (tx, mut rx) = mpsc::unbounded_channel();
        scan_stdout_chunk(&state, &tx, "All done.\n> ");
        let events = drain(&mut rx);
        assert_eq!(events[0], ProcessEvent::Data("All done.\n> ".into()));
        assert!(events.contains(&ProcessEvent::TurnCompleted));
        assert!(events.contains(&ProcessEvent::Ready));
        assert_eq!(*state.lock().unwrap(), ProcessState::Ready);
    }

    #[test]
    fn first_prompt_is_ready_without_turn() {
        let state = StdMutex::new(ProcessState::Starting);
        let (tx, mut rx) = mpsc::unbounded_channel();
        scan_stdout_chunk(&state, &tx, "Aider v0.86.1\n> ");
        let events = drain(&mut rx);
        assert!(!events.contains(&ProcessEvent::TurnCompleted));
        assert!(events.contains(&ProcessEvent::Ready));
    }

    #[test]
    fn confirmation_tail_blocks() {
        let state = StdMutex::new(ProcessState::Processing);
        let (tx, mut rx) = mpsc::unbounded_channel();
        scan_stdout_chunk(&state, &tx, "Add notes.md to the chat? (Y)es/(N)o [Yes]:");
        let events = drain(&mut rx);
        assert!(matches!(
            events[1],
            ProcessEvent::ConfirmationRequired(ref q) if q.contains("notes.md")
        ));
        assert_eq!(*state.lock().unwrap(), ProcessState::WaitingForConfirmation);
    }

    #[test]
    fn mid_stream_chunk_emits_data_only() {
        let state = StdMutex::new(ProcessState::Processing);
        let (tx, mut rx) = mpsc::unbounded_channel();
        scan_stdout_chunk(&state, &tx, "Here is the plan:\nfirst, ");
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(*state.lock().unwrap(), ProcessState::Processing);
    }

    #[test]
    fn stderr_triage() {
        assert_eq!(triage_stderr(" 45%|████▌     | 140/312"), StderrKind::Noise);
        assert_eq!(
            triage_stderr("Scanning repo:  12%| 3.21it/s]"),
            StderrKind::Noise
        );
        assert_eq!(
            triage_stderr("UserWarning: resource_tracker: There appear to be leaked semaphore objects"),
            StderrKind::Cleanup
        );
        assert_eq!(
            triage_stderr("Traceback (most recent call last):"),
            StderrKind::Fatal
        );
    }
}
