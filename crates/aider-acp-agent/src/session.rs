//! Per-session state and the turn protocol.
//!
//! One `Session` owns one aider subprocess and everything scoped to the
//! conversation: chat file lists, the current mode and plan, the tool-call
//! log, and the turn-in-flight bookkeeping. The event pump is the only
//! consumer of the process channel; a turn suspends on a single oneshot
//! that resolves on the first of completion, error, or exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use aider_acp_parser::{EditBlock, parse_output};
use aider_acp_rpc::schema::{
    ContentBlock, PermissionOption, PermissionOptionKind, PermissionOutcome, PlanEntry,
    PlanEntryPriority, PlanEntryStatus, RequestPermissionRequest, SessionNotification,
    SessionUpdate, StopReason, ToolCallContent, ToolCallLocation, ToolCallRef, ToolCallStatus,
    ToolKind,
};

use crate::client::AcpClient;
use crate::process::{CliProcess, ProcessEvent, ProcessState};
use crate::resources::{PromptResource, materialize};
use crate::tool_log::ToolCallLog;

/// Chat modes exposed to the editor, aider's own mode names.
pub const AVAILABLE_MODES: &[(&str, &str)] =
    &[("code", "Code"), ("architect", "Architect"), ("ask", "Ask")];

pub const DEFAULT_MODE: &str = "code";

/// How a turn's wait ended. Exactly one of these resolves each turn.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TurnEnd {
    Completed,
    Errored(String),
    Exited(String),
}

pub struct Session {
    pub id: String,
    pub working_dir: PathBuf,
    client: Arc<dyn AcpClient>,
    process: Mutex<Option<Arc<dyn CliProcess>>>,
    files: Mutex<Vec<String>>,
    read_only_files: Mutex<Vec<String>>,
    current_mode: Mutex<String>,
    current_plan: Mutex<Option<Vec<PlanEntry>>>,
    cancelled: AtomicBool,
    pending_question: Mutex<Option<String>>,
    tool_calls: Mutex<ToolCallLog>,
    turn_waiter: Mutex<Option<oneshot::Sender<TurnEnd>>>,
    pump_handle: ArcSwapOption<JoinHandle<()>>,
}

impl Session {
    pub fn new(id: String, working_dir: PathBuf, client: Arc<dyn AcpClient>) -> Arc<Self> {
        Arc::new(Self {
            id,
            working_dir,
            client,
            process: Mutex::new(None),
            files: Mutex::new(Vec::new()),
            read_only_files: Mutex::new(Vec::new()),
            current_mode: Mutex::new(DEFAULT_MODE.to_string()),
            current_plan: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            pending_question: Mutex::new(None),
            tool_calls: Mutex::new(ToolCallLog::default()),
            turn_waiter: Mutex::new(None),
            pump_handle: ArcSwapOption::empty(),
        })
    }

    /// Hand the session its subprocess and start the event pump.
    pub async fn attach_process(
        self: &Arc<Self>,
        process: Arc<dyn CliProcess>,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        *self.process.lock().await = Some(process);

        let session = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                session.handle_process_event(event).await;
            }
        });
        self.pump_handle.store(Some(Arc::new(handle)));
    }

    pub async fn current_mode(&self) -> String {
        self.current_mode.lock().await.clone()
    }

    pub async fn files(&self) -> Vec<String> {
        self.files.lock().await.clone()
    }

    pub async fn read_only_files(&self) -> Vec<String> {
        self.read_only_files.lock().await.clone()
    }

    /// Stop the subprocess and the pump. The session stays addressable.
    pub async fn shutdown(&self) {
        if let Some(process) = self.process.lock().await.take() {
            let _ = process.stop().await;
        }
        if let Some(handle) = self.pump_handle.swap(None) {
            handle.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Turn protocol
    // -----------------------------------------------------------------------

    /// Run one turn to completion.
    pub async fn prompt(&self, content: Vec<ContentBlock>) -> anyhow::Result<StopReason> {
        // Validate before touching the subprocess.
        let (text_parts, resources) = split_content(content)?;
        let prompt_text = text_parts.join("\n");

        // Fresh turn state.
        self.cancelled.store(false, Ordering::SeqCst);
        *self.current_plan.lock().await = None;

        let process = self
            .process()
            .await
            .ok_or_else(|| anyhow::anyhow!("aider process is not running"))?;

        // A question is already on the table: this prompt answers it.
        if process.state() == ProcessState::WaitingForConfirmation {
            return self.answer_pending_confirmation(&process, &prompt_text).await;
        }

        let mut plan: Vec<PlanEntry> = Vec::new();
        if !resources.is_empty() {
            plan.push(plan_entry(format!(
                "Add {} attached file(s) to the chat",
                resources.len()
            )));
        }
        if !prompt_text.is_empty() {
            plan.push(plan_entry("Run the prompt".to_string()));
        }
        if !plan.is_empty() {
            self.publish_plan(plan.clone()).await;
        }

        if !resources.is_empty() {
            self.advance_plan(0, PlanEntryStatus::InProgress).await;
            for resource in &resources {
                if self.cancelled.load(Ordering::SeqCst) {
                    break;
                }
                match self.apply_resource(&process, resource).await? {
                    TurnEnd::Completed => {}
                    _ => return Ok(self.stop_reason()),
                }
            }
            self.advance_plan(0, PlanEntryStatus::Completed).await;
        }

        if !prompt_text.is_empty() && !self.cancelled.load(Ordering::SeqCst) {
            let index = plan.len() - 1;
            self.advance_plan(index, PlanEntryStatus::InProgress).await;
            let wait = self.begin_turn_wait().await;
            process.send_command(&prompt_text).await?;
            let _ = finish_wait(wait).await;
            self.advance_plan(index, PlanEntryStatus::Completed).await;
        }

        Ok(self.stop_reason())
    }

    /// Fire-and-forget cancellation of the in-flight turn.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.interrupt_process().await;
    }

    pub async fn set_mode(&self, mode_id: &str) -> anyhow::Result<()> {
        if !AVAILABLE_MODES.iter().any(|(id, _)| *id == mode_id) {
            anyhow::bail!("unknown mode: {mode_id}");
        }
        *self.current_mode.lock().await = mode_id.to_string();
        self.send_update(SessionUpdate::CurrentModeUpdate {
            current_mode_id: mode_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn answer_pending_confirmation(
        &self,
        process: &Arc<dyn CliProcess>,
        prompt_text: &str,
    ) -> anyhow::Result<StopReason> {
        let question = self
            .pending_question
            .lock()
            .await
            .take()
            .unwrap_or_else(|| "Proceed?".to_string());

        let outcome = self
            .client
            .request_permission(RequestPermissionRequest {
                session_id: self.id.clone(),
                tool_call: ToolCallRef {
                    tool_call_id: format!("confirm-{}", Uuid::new_v4()),
                    title: Some(question),
                    kind: Some(ToolKind::Other),
                },
                options: vec![
                    permission_option("allow_once", "Yes", PermissionOptionKind::AllowOnce),
                    permission_option("reject_once", "No", PermissionOptionKind::RejectOnce),
                ],
            })
            .await;

        match outcome {
            PermissionOutcome::Selected { option_id } if option_id.starts_with("allow") => {
                let answer = if prompt_text.is_empty() { "y" } else { prompt_text };
                let wait = self.begin_turn_wait().await;
                process.answer_confirmation(answer).await?;
                let _ = finish_wait(wait).await;
                Ok(self.stop_reason())
            }
            _ => {
                self.cancelled.store(true, Ordering::SeqCst);
                self.interrupt_process().await;
                Ok(self.stop_reason())
            }
        }
    }

    async fn apply_resource(
        &self,
        process: &Arc<dyn CliProcess>,
        resource: &PromptResource,
    ) -> anyhow::Result<TurnEnd> {
        let path = materialize(resource, &self.working_dir).await?;
        let display = path.to_string_lossy().to_string();

        // Files outside the working tree can only join read-only.
        let read_only = matches!(resource, PromptResource::Link { .. })
            && !path.starts_with(&self.working_dir);
        let command = if read_only {
            format!("/read-only {display}")
        } else {
            format!("/add {display}")
        };

        let wait = self.begin_turn_wait().await;
        process.send_command(&command).await?;
        let end = finish_wait(wait).await;

        if end == TurnEnd::Completed {
            let list = if read_only {
                &self.read_only_files
            } else {
                &self.files
            };
            let mut list = list.lock().await;
            if !list.contains(&display) {
                list.push(display);
            }
        }
        Ok(end)
    }

    async fn begin_turn_wait(&self) -> oneshot::Receiver<TurnEnd> {
        let (tx, rx) = oneshot::channel();
        *self.turn_waiter.lock().await = Some(tx);
        rx
    }

    async fn resolve_turn(&self, end: TurnEnd) {
        if let Some(tx) = self.turn_waiter.lock().await.take() {
            let _ = tx.send(end);
        }
    }

    async fn turn_active(&self) -> bool {
        self.turn_waiter.lock().await.is_some()
    }

    fn stop_reason(&self) -> StopReason {
        if self.cancelled.load(Ordering::SeqCst) {
            StopReason::Cancelled
        } else {
            StopReason::EndTurn
        }
    }

    async fn process(&self) -> Option<Arc<dyn CliProcess>> {
        self.process.lock().await.clone()
    }

    async fn interrupt_process(&self) {
        if let Some(process) = self.process().await
            && let Err(err) = process.interrupt().await
        {
            warn!("[session {}] interrupt failed: {}", self.id, err);
        }
    }

    // -----------------------------------------------------------------------
    // Process events
    // -----------------------------------------------------------------------

    async fn handle_process_event(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Ready => {}
            ProcessEvent::Data(chunk) => self.handle_output_chunk(&chunk).await,
            ProcessEvent::Warning(text) => {
                self.send_update(SessionUpdate::AgentThoughtChunk {
                    content: ContentBlock::text(text),
                })
                .await;
            }
            ProcessEvent::ConfirmationRequired(question) => {
                self.handle_confirmation(question).await;
            }
            ProcessEvent::TurnCompleted => self.resolve_turn(TurnEnd::Completed).await,
            ProcessEvent::Errored(text) => {
                warn!("[session {}] aider error: {}", self.id, text);
                self.send_update(SessionUpdate::AgentMessageChunk {
                    content: ContentBlock::text(text.clone()),
                })
                .await;
                self.resolve_turn(TurnEnd::Errored(text)).await;
            }
            ProcessEvent::Exited(message) => {
                debug!("[session {}] {}", self.id, message);
                *self.process.lock().await = None;
                self.resolve_turn(TurnEnd::Exited(message)).await;
            }
        }
    }

    async fn handle_output_chunk(&self, chunk: &str) {
        let parsed = parse_output(chunk);

        if !parsed.info.is_empty() {
            // Re-emitted whenever any field is present; cross-chunk merging
            // is not the interpreter's job.
            self.send_update(SessionUpdate::AgentThoughtChunk {
                content: ContentBlock::text(parsed.info.to_string()),
            })
            .await;
        }

        if !parsed.files_added.is_empty() || !parsed.files_dropped.is_empty() {
            let mut files = self.files.lock().await;
            for path in &parsed.files_added {
                if !files.contains(path) {
                    files.push(path.clone());
                }
            }
            files.retain(|f| !parsed.files_dropped.contains(f));
        }

        if !parsed.user_message.is_empty() {
            self.send_update(SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text(parsed.user_message),
            })
            .await;
        }

        for code in parsed.code_blocks {
            let label = if code.path == "unknown" {
                String::new()
            } else {
                code.path.clone()
            };
            let rendered = format!("```{}\n{}\n```", label, code.content);
            self.send_update(SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text(rendered),
            })
            .await;
        }

        for block in parsed.edit_blocks {
            self.report_edit(block).await;
        }

        // Pending prompts surface through the confirmation flow, which sees
        // the same lines via the process state scan.
    }

    /// One extracted edit becomes a started-then-completed tool call
    /// carrying the normalized diff.
    async fn report_edit(&self, block: EditBlock) {
        let tool_call_id = format!("edit-{}", Uuid::new_v4());

        self.tool_calls
            .lock()
            .await
            .start(&tool_call_id, ToolKind::Edit);
        self.send_update(SessionUpdate::ToolCall {
            tool_call_id: tool_call_id.clone(),
            title: format!("Edit {}", block.path),
            kind: ToolKind::Edit,
            status: ToolCallStatus::InProgress,
            content: Vec::new(),
            locations: vec![ToolCallLocation {
                path: block.path.clone(),
            }],
        })
        .await;

        if let Err(err) = self.tool_calls.lock().await.complete(&tool_call_id) {
            warn!("[session {}] {}", self.id, err);
        }
        self.send_update(SessionUpdate::ToolCallUpdate {
            tool_call_id,
            status: ToolCallStatus::Completed,
            content: vec![ToolCallContent::Diff {
                path: block.path,
                old_text: block.old_text,
                new_text: block.new_text,
            }],
        })
        .await;
    }

    async fn handle_confirmation(&self, question: String) {
        *self.pending_question.lock().await = Some(question.clone());

        if !self.turn_active().await {
            // Idle confirmation: hold the question, the next prompt call
            // answers it.
            return;
        }

        let outcome = self
            .client
            .request_permission(RequestPermissionRequest {
                session_id: self.id.clone(),
                tool_call: ToolCallRef {
                    tool_call_id: format!("confirm-{}", Uuid::new_v4()),
                    title: Some(question),
                    kind: Some(ToolKind::Other),
                },
                options: vec![
                    permission_option("allow_once", "Yes", PermissionOptionKind::AllowOnce),
                    permission_option("allow_always", "Always", PermissionOptionKind::AllowAlways),
                    permission_option("reject_once", "No", PermissionOptionKind::RejectOnce),
                    permission_option("reject_always", "Never", PermissionOptionKind::RejectAlways),
                ],
            })
            .await;

        let answer = match &outcome {
            PermissionOutcome::Selected { option_id } if option_id == "allow_always" => Some("a"),
            PermissionOutcome::Selected { option_id } if option_id == "allow_once" => Some("y"),
            _ => None,
        };

        self.pending_question.lock().await.take();
        match answer {
            Some(text) => {
                if let Some(process) = self.process().await
                    && let Err(err) = process.answer_confirmation(text).await
                {
                    warn!("[session {}] confirmation answer failed: {}", self.id, err);
                }
            }
            None => {
                self.cancelled.store(true, Ordering::SeqCst);
                self.interrupt_process().await;
            }
        }
    }

    async fn publish_plan(&self, entries: Vec<PlanEntry>) {
        *self.current_plan.lock().await = Some(entries.clone());
        self.send_update(SessionUpdate::Plan { entries }).await;
    }

    async fn advance_plan(&self, index: usize, status: PlanEntryStatus) {
        let entries = {
            let mut plan = self.current_plan.lock().await;
            let Some(entries) = plan.as_mut() else {
                return;
            };
            if let Some(entry) = entries.get_mut(index) {
                entry.status = status;
            }
            entries.clone()
        };
        self.send_update(SessionUpdate::Plan { entries }).await;
    }

    async fn send_update(&self, update: SessionUpdate) {
        self.client
            .session_update(SessionNotification {
                session_id: self.id.clone(),
                update,
            })
            .await;
    }
}

fn plan_entry(content: String) -> PlanEntry {
    PlanEntry {
        content,
        priority: PlanEntryPriority::Medium,
        status: PlanEntryStatus::Pending,
    }
}

fn permission_option(id: &str, name: &str, kind: PermissionOptionKind) -> PermissionOption {
    PermissionOption {
        option_id: id.to_string(),
        name: name.to_string(),
        kind,
    }
}

async fn finish_wait(rx: oneshot::Receiver<TurnEnd>) -> TurnEnd {
    rx.await
        .unwrap_or_else(|_| TurnEnd::Exited("event channel closed".to_string()))
}

/// Split prompt content into text parts and resources, rejecting anything
/// this agent cannot forward to aider.
fn split_content(
    content: Vec<ContentBlock>,
) -> anyhow::Result<(Vec<String>, Vec<PromptResource>)> {
    let mut text_parts = Vec::new();
    let mut resources = Vec::new();

    for block in content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::Resource { resource } => {
                if resource.uri().trim().is_empty() {
                    anyhow::bail!("resource content block is missing a URI");
                }
                resources.push(PromptResource::Embedded(resource));
            }
            ContentBlock::ResourceLink { uri, .. } => {
                if uri.trim().is_empty() {
                    anyhow::bail!("resource link is missing a URI");
                }
                resources.push(PromptResource::Link { uri });
            }
            ContentBlock::Image { .. } => anyhow::bail!("unsupported content block: image"),
            ContentBlock::Audio { .. } => anyhow::bail!("unsupported content block: audio"),
        }
    }

    Ok((text_parts, resources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use aider_acp_rpc::schema::{EmbeddedResource, TextResourceContents};

    struct FakeProcess {
        state: StdMutex<ProcessState>,
        commands: StdMutex<Vec<String>>,
        confirmations: StdMutex<Vec<String>>,
        interrupts: StdMutex<u32>,
    }

    impl FakeProcess {
        fn new(state: ProcessState) -> Arc<Self> {
            Arc::new(Self {
                state: StdMutex::new(state),
                commands: StdMutex::new(Vec::new()),
                confirmations: StdMutex::new(Vec::new()),
                interrupts: StdMutex::new(0),
            })
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn confirmations(&self) -> Vec<String> {
            self.confirmations.lock().unwrap().clone()
        }

        fn interrupts(&self) -> u32 {
            *self.interrupts.lock().unwrap()
        }
    }

    impl CliProcess for FakeProcess {
        fn send_command(
            &self,
            text: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            let text = text.to_string();
            Box::pin(async move {
                self.commands.lock().unwrap().push(text);
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
                self.confirmations.lock().unwrap().push(text);
                *self.state.lock().unwrap() = ProcessState::Processing;
                Ok(())
            })
        }

        fn interrupt(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async move {
                *self.interrupts.lock().unwrap() += 1;
                Ok(())
            })
        }

        fn stop(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async move { Ok(()) })
        }

        fn state(&self) -> ProcessState {
            *self.state.lock().unwrap()
        }
    }

    struct FakeClient {
        updates: StdMutex<Vec<SessionNotification>>,
        outcomes: StdMutex<VecDeque<PermissionOutcome>>,
    }

    impl FakeClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                updates: StdMutex::new(Vec::new()),
                outcomes: StdMutex::new(VecDeque::new()),
            })
        }

        fn queue_outcome(&self, outcome: PermissionOutcome) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        fn updates(&self) -> Vec<SessionNotification> {
            self.updates.lock().unwrap().clone()
        }
    }

    impl AcpClient for FakeClient {
        fn session_update(
            &self,
            notification: SessionNotification,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                self.updates.lock().unwrap().push(notification);
            })
        }

        fn request_permission(
            &self,
            _request: RequestPermissionRequest,
        ) -> Pin<Box<dyn Future<Output = PermissionOutcome> + Send + '_>> {
            Box::pin(async move {
                self.outcomes
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(PermissionOutcome::Cancelled)
            })
        }
    }

    async fn fixture(
        state: ProcessState,
    ) -> (Arc<Session>, Arc<FakeProcess>, Arc<FakeClient>) {
        let client = FakeClient::new();
        let session = Session::new(
            "sess-test".into(),
            std::env::temp_dir().join(format!("aider-acp-sess-{}", Uuid::new_v4())),
            client.clone(),
        );
        let process = FakeProcess::new(state);
        let (_tx, rx) = mpsc::unbounded_channel();
        session.attach_process(process.clone(), rx).await;
        (session, process, client)
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn plain_text_turn_ends_with_end_turn() {
        let (session, process, client) = fixture(ProcessState::Ready).await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move {
                session.prompt(vec![ContentBlock::text("add a test")]).await
            })
        };

        {
            let process = process.clone();
            wait_for(move || process.commands().len() == 1).await;
        }
        assert_eq!(process.commands(), vec!["add a test".to_string()]);

        session.handle_process_event(ProcessEvent::TurnCompleted).await;
        let stop = task.await.unwrap().unwrap();
        assert_eq!(stop, StopReason::EndTurn);

        // The plan was synthesized and fully advanced.
        let plans: Vec<_> = client
            .updates()
            .into_iter()
            .filter_map(|n| match n.update {
                SessionUpdate::Plan { entries } => Some(entries),
                _ => None,
            })
            .collect();
        assert!(!plans.is_empty());
        let last = plans.last().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].status, PlanEntryStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_interrupts_and_reports_cancelled() {
        let (session, process, _client) = fixture(ProcessState::Ready).await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move {
                session.prompt(vec![ContentBlock::text("refactor")]).await
            })
        };

        {
            let process = process.clone();
            wait_for(move || process.commands().len() == 1).await;
        }

        session.cancel().await;
        assert_eq!(process.interrupts(), 1);

        // Aider re-prompts after the interrupt lands.
        session.handle_process_event(ProcessEvent::TurnCompleted).await;
        let stop = task.await.unwrap().unwrap();
        assert_eq!(stop, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn unsupported_content_fails_before_any_command() {
        let (session, process, _client) = fixture(ProcessState::Ready).await;

        let err = session
            .prompt(vec![ContentBlock::Image {
                data: None,
                mime_type: Some("image/png".into()),
            }])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported content block"));
        assert!(process.commands().is_empty());
    }

    #[tokio::test]
    async fn empty_resource_uri_rejected() {
        let (session, process, _client) = fixture(ProcessState::Ready).await;

        let err = session
            .prompt(vec![ContentBlock::Resource {
                resource: EmbeddedResource::Text(TextResourceContents {
                    uri: "  ".into(),
                    text: "x".into(),
                }),
            }])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing a URI"));
        assert!(process.commands().is_empty());
    }

    #[tokio::test]
    async fn resources_applied_before_prompt_text() {
        let (session, process, _client) = fixture(ProcessState::Ready).await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .prompt(vec![
                        ContentBlock::Resource {
                            resource: EmbeddedResource::Text(TextResourceContents {
                                uri: "notes.md".into(),
                                text: "remember".into(),
                            }),
                        },
                        ContentBlock::text("use the notes"),
                    ])
                    .await
            })
        };

        // /add first, turn completion, then the prompt text.
        {
            let process = process.clone();
            wait_for(move || process.commands().len() == 1).await;
        }
        assert!(process.commands()[0].starts_with("/add "));
        session.handle_process_event(ProcessEvent::TurnCompleted).await;

        {
            let process = process.clone();
            wait_for(move || process.commands().len() == 2).await;
        }
        assert_eq!(process.commands()[1], "use the notes");
        session.handle_process_event(ProcessEvent::TurnCompleted).await;

        let stop = task.await.unwrap().unwrap();
        assert_eq!(stop, StopReason::EndTurn);

        // The embedded resource landed on disk and in the chat file list.
        let on_disk = session.working_dir.join("notes.md");
        assert_eq!(std::fs::read_to_string(&on_disk).unwrap(), "remember");
        assert_eq!(session.files().await.len(), 1);
        let _ = std::fs::remove_dir_all(&session.working_dir);
    }

    #[tokio::test]
    async fn pending_confirmation_short_circuits_prompt() {
        let (session, process, client) = fixture(ProcessState::WaitingForConfirmation).await;

        // The question arrived while idle, so it parks.
        session
            .handle_process_event(ProcessEvent::ConfirmationRequired(
                "Add notes.md to the chat? (Y)es/(N)o".into(),
            ))
            .await;
        assert!(process.confirmations().is_empty());

        client.queue_outcome(PermissionOutcome::Selected {
            option_id: "allow_once".into(),
        });

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.prompt(vec![ContentBlock::text("yes")]).await })
        };

        {
            let process = process.clone();
            wait_for(move || process.confirmations().len() == 1).await;
        }
        assert_eq!(process.confirmations(), vec!["yes".to_string()]);

        session.handle_process_event(ProcessEvent::TurnCompleted).await;
        let stop = task.await.unwrap().unwrap();
        assert_eq!(stop, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn denied_pending_confirmation_cancels_turn() {
        let (session, process, client) = fixture(ProcessState::WaitingForConfirmation).await;
        session
            .handle_process_event(ProcessEvent::ConfirmationRequired("Continue? [y/N]".into()))
            .await;
        client.queue_outcome(PermissionOutcome::Cancelled);

        let stop = session
            .prompt(vec![ContentBlock::text("go ahead")])
            .await
            .unwrap();
        assert_eq!(stop, StopReason::Cancelled);
        assert_eq!(process.interrupts(), 1);
        assert!(process.confirmations().is_empty());
    }

    #[tokio::test]
    async fn mid_turn_confirmation_allow_always() {
        let (session, process, client) = fixture(ProcessState::Ready).await;
        client.queue_outcome(PermissionOutcome::Selected {
            option_id: "allow_always".into(),
        });

        let task = {
            let session = session.clone();
            tokio::spawn(async move {
                session.prompt(vec![ContentBlock::text("edit the file")]).await
            })
        };

        {
            let process = process.clone();
            wait_for(move || process.commands().len() == 1).await;
        }

        session
            .handle_process_event(ProcessEvent::ConfirmationRequired(
                "Create new file app.py? (Y)es/(N)o".into(),
            ))
            .await;
        assert_eq!(process.confirmations(), vec!["a".to_string()]);

        session.handle_process_event(ProcessEvent::TurnCompleted).await;
        assert_eq!(task.await.unwrap().unwrap(), StopReason::EndTurn);
    }

    #[tokio::test]
    async fn mid_turn_confirmation_denied_interrupts() {
        let (session, process, client) = fixture(ProcessState::Ready).await;
        client.queue_outcome(PermissionOutcome::Selected {
            option_id: "reject_always".into(),
        });

        let task = {
            let session = session.clone();
            tokio::spawn(async move {
                session.prompt(vec![ContentBlock::text("edit the file")]).await
            })
        };

        {
            let process = process.clone();
            wait_for(move || process.commands().len() == 1).await;
        }

        session
            .handle_process_event(ProcessEvent::ConfirmationRequired(
                "Run pytest? (Y)es/(N)o".into(),
            ))
            .await;
        assert_eq!(process.interrupts(), 1);

        session.handle_process_event(ProcessEvent::TurnCompleted).await;
        assert_eq!(task.await.unwrap().unwrap(), StopReason::Cancelled);
    }

    #[tokio::test]
    async fn process_exit_resolves_turn_and_clears_handle() {
        let (session, process, _client) = fixture(ProcessState::Ready).await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.prompt(vec![ContentBlock::text("hi")]).await })
        };
        {
            let process = process.clone();
            wait_for(move || process.commands().len() == 1).await;
        }

        session
            .handle_process_event(ProcessEvent::Exited("aider process exited".into()))
            .await;
        assert_eq!(task.await.unwrap().unwrap(), StopReason::EndTurn);

        // Addressable but inert until a new process is attached.
        let err = session
            .prompt(vec![ContentBlock::text("again")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn edit_blocks_become_paired_tool_calls() {
        let (session, _process, client) = fixture(ProcessState::Ready).await;

        session
            .handle_process_event(ProcessEvent::Data(
                "app.py\n```\n<<<<<<< SEARCH\nold\n=======\nnew\n>>>>>>> REPLACE\n```".into(),
            ))
            .await;

        let updates = client.updates();
        let started = updates.iter().any(|n| {
            matches!(
                &n.update,
                SessionUpdate::ToolCall { status, kind, .. }
                    if *status == ToolCallStatus::InProgress && *kind == ToolKind::Edit
            )
        });
        let completed = updates.iter().any(|n| {
            matches!(
                &n.update,
                SessionUpdate::ToolCallUpdate { status, content, .. }
                    if *status == ToolCallStatus::Completed
                        && matches!(content.first(), Some(ToolCallContent::Diff { path, .. }) if path == "app.py")
            )
        });
        assert!(started);
        assert!(completed);

        // Log replay upholds the start-before-completion pairing.
        let log = session.tool_calls.lock().await;
        assert!(ToolCallLog::replay(log.events()).is_ok());
    }

    #[tokio::test]
    async fn metadata_reemitted_as_thought() {
        let (session, _process, client) = fixture(ProcessState::Ready).await;
        session
            .handle_process_event(ProcessEvent::Data(
                "Aider v0.86.1\nMain model: gpt-4o\n".into(),
            ))
            .await;
        let thoughts: Vec<_> = client
            .updates()
            .into_iter()
            .filter_map(|n| match n.update {
                SessionUpdate::AgentThoughtChunk {
                    content: ContentBlock::Text { text },
                } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(thoughts.len(), 1);
        assert!(thoughts[0].contains("Aider v0.86.1"));
        assert!(thoughts[0].contains("Main model: gpt-4o"));
    }

    #[tokio::test]
    async fn set_mode_notifies_and_validates() {
        let (session, _process, client) = fixture(ProcessState::Ready).await;

        session.set_mode("architect").await.unwrap();
        assert_eq!(session.current_mode().await, "architect");
        assert!(client.updates().iter().any(|n| matches!(
            &n.update,
            SessionUpdate::CurrentModeUpdate { current_mode_id } if current_mode_id == "architect"
        )));

        assert!(session.set_mode("vibe").await.is_err());
    }
}
