//! ACP method dispatch over the session arena.
//!
//! One `AiderAgent` serves one editor connection. Sessions live in a map
//! keyed by generated id; each owns its subprocess exclusively, so two
//! method calls can only ever race across different sessions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use aider_acp_rpc::schema::{
    AgentCapabilities, CancelNotification, InitializeResponse, NewSessionRequest,
    NewSessionResponse, PROTOCOL_VERSION, PromptCapabilities, PromptRequest, PromptResponse,
    SessionModeInfo, SessionModeState, SetModeRequest,
};
use aider_acp_rpc::{RpcError, RpcPeer};

use crate::client::AcpClient;
use crate::config::AgentConfig;
use crate::process::AiderProcess;
use crate::session::{AVAILABLE_MODES, DEFAULT_MODE, Session};

pub struct AiderAgent {
    config: AgentConfig,
    client: Arc<dyn AcpClient>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl AiderAgent {
    pub fn new(config: AgentConfig, client: Arc<dyn AcpClient>) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub async fn initialize(&self, _params: Value) -> Result<Value, RpcError> {
        let response = InitializeResponse {
            protocol_version: PROTOCOL_VERSION,
            agent_capabilities: AgentCapabilities {
                load_session: false,
                prompt_capabilities: PromptCapabilities {
                    image: false,
                    audio: false,
                    embedded_context: true,
                },
            },
        };
        to_result(&response)
    }

    pub async fn new_session(&self, params: Value) -> Result<Value, RpcError> {
        let request: NewSessionRequest =
            serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;

        let id = format!("sess-{}", Uuid::new_v4());
        let working_dir = PathBuf::from(&request.cwd);
        let session = Session::new(id.clone(), working_dir.clone(), self.client.clone());

        let (process, events) = AiderProcess::spawn(
            &self.config.aider_command,
            &self.config.aider_args,
            &working_dir,
        )
        .map_err(|e| RpcError::internal(e.to_string()))?;
        session.attach_process(process, events).await;

        debug!("[agent] session {} started in {}", id, request.cwd);
        self.sessions.lock().await.insert(id.clone(), session);

        let response = NewSessionResponse {
            session_id: id,
            modes: Some(SessionModeState {
                current_mode_id: DEFAULT_MODE.to_string(),
                available_modes: AVAILABLE_MODES
                    .iter()
                    .map(|(id, name)| SessionModeInfo {
                        id: id.to_string(),
                        name: name.to_string(),
                    })
                    .collect(),
            }),
        };
        to_result(&response)
    }

    pub async fn prompt(&self, params: Value) -> Result<Value, RpcError> {
        let request: PromptRequest =
            serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;
        let session = self.session(&request.session_id).await?;

        let stop_reason = session.prompt(request.prompt).await.map_err(|err| {
            let message = err.to_string();
            if message.contains("unsupported content block") || message.contains("missing a URI") {
                RpcError::invalid_params(message)
            } else {
                RpcError::internal(message)
            }
        })?;

        to_result(&PromptResponse { stop_reason })
    }

    pub async fn cancel(&self, params: Value) {
        let Ok(notification) = serde_json::from_value::<CancelNotification>(params) else {
            warn!("[agent] malformed session/cancel notification");
            return;
        };
        match self.session(&notification.session_id).await {
            Ok(session) => session.cancel().await,
            Err(_) => warn!(
                "[agent] cancel for unknown session {}",
                notification.session_id
            ),
        }
    }

    pub async fn set_mode(&self, params: Value) -> Result<Value, RpcError> {
        let request: SetModeRequest =
            serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;
        let session = self.session(&request.session_id).await?;
        session
            .set_mode(&request.mode_id)
            .await
            .map_err(|e| RpcError::invalid_params(e.to_string()))?;
        Ok(Value::Object(serde_json::Map::new()))
    }

    pub async fn shutdown_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            session.shutdown().await;
        }
    }

    async fn session(&self, id: &str) -> Result<Arc<Session>, RpcError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RpcError::not_found(format!("session not found: {id}")))
    }
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}

/// Wire the agent's methods into the RPC peer.
pub async fn register_handlers(agent: &Arc<AiderAgent>, peer: &Arc<RpcPeer>) {
    let a = agent.clone();
    peer.register_request_handler(
        "initialize",
        Arc::new(move |params| {
            let a = a.clone();
            Box::pin(async move { a.initialize(params).await })
        }),
    )
    .await;

    let a = agent.clone();
    peer.register_request_handler(
        "session/new",
        Arc::new(move |params| {
            let a = a.clone();
            Box::pin(async move { a.new_session(params).await })
        }),
    )
    .await;

    let a = agent.clone();
    peer.register_request_handler(
        "session/prompt",
        Arc::new(move |params| {
            let a = a.clone();
            Box::pin(async move { a.prompt(params).await })
        }),
    )
    .await;

    let a = agent.clone();
    peer.register_request_handler(
        "session/set_mode",
        Arc::new(move |params| {
            let a = a.clone();
            Box::pin(async move { a.set_mode(params).await })
        }),
    )
    .await;

    let a = agent.clone();
    peer.on_notification(move |method, params| {
        if method == "session/cancel" {
            let a = a.clone();
            tokio::spawn(async move {
                a.cancel(params).await;
            });
        }
    })
    .await;
}
