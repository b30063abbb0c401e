//! Tool-call tracking for one session.
//!
//! An append-only event log plus a derived index. The log is the source of
//! truth; replaying it must always rebuild the index, which keeps the
//! start-before-completion pairing checkable after the fact.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::bail;

use aider_acp_rpc::schema::{ToolCallStatus, ToolKind};

pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallState {
    pub id: String,
    pub kind: ToolKind,
    pub status: ToolCallStatus,
    pub start_time: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallEvent {
    Started { id: String, kind: ToolKind, at: u64 },
    Completed { id: String, at: u64 },
}

#[derive(Debug, Default)]
pub struct ToolCallLog {
    events: Vec<ToolCallEvent>,
    index: HashMap<String, ToolCallState>,
}

impl ToolCallLog {
    /// Record the start of a tool call.
    pub fn start(&mut self, id: &str, kind: ToolKind) {
        let at = epoch_ms();
        self.events.push(ToolCallEvent::Started {
            id: id.to_string(),
            kind,
            at,
        });
        self.index.insert(
            id.to_string(),
            ToolCallState {
                id: id.to_string(),
                kind,
                status: ToolCallStatus::InProgress,
                start_time: at,
            },
        );
    }

    /// Record completion. Completion must pair with a prior start.
    pub fn complete(&mut self, id: &str) -> anyhow::Result<()> {
        let Some(state) = self.index.get_mut(id) else {
            bail!("completion for unknown tool call: {id}");
        };
        state.status = ToolCallStatus::Completed;
        self.events.push(ToolCallEvent::Completed {
            id: id.to_string(),
            at: epoch_ms(),
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ToolCallState> {
        self.index.get(id)
    }

    pub fn events(&self) -> &[ToolCallEvent] {
        &self.events
    }

    /// Rebuild an index from an event sequence, failing on any completion
    /// that has no prior start.
    pub fn replay(events: &[ToolCallEvent]) -> anyhow::Result<HashMap<String, ToolCallState>> {
        let mut index: HashMap<String, ToolCallState> = HashMap::new();
        for event in events {
            match event {
                ToolCallEvent::Started { id, kind, at } => {
                    index.insert(
                        id.clone(),
                        ToolCallState {
                            id: id.clone(),
                            kind: *kind,
                            status: ToolCallStatus::InProgress,
                            start_time: *at,
                        },
                    );
                }
                ToolCallEvent::Completed { id, .. } => {
                    let Some(state) = index.get_mut(id) else {
                        bail!("replay found completion without start: {id}");
                    };
                    state.status = ToolCallStatus::Completed;
                }
            }
        }
        Ok(index)
    }
}
