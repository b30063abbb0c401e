//! The upstream (editor) side of the conversation.
//!
//! The orchestrator only ever needs two things from the client: a one-way
//! stream of session updates and a blocking permission round-trip. The
//! trait keeps tests off the wire; the production impl rides the RPC peer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use aider_acp_rpc::RpcPeer;
use aider_acp_rpc::schema::{
    PermissionOutcome, RequestPermissionRequest, RequestPermissionResponse, SessionNotification,
};

pub trait AcpClient: Send + Sync {
    fn session_update(
        &self,
        notification: SessionNotification,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Ask the editor to resolve a permission request. Blocks as long as
    /// the user does; an unreachable editor reads as a cancel.
    fn request_permission(
        &self,
        request: RequestPermissionRequest,
    ) -> Pin<Box<dyn Future<Output = PermissionOutcome> + Send + '_>>;
}

pub struct RpcClient {
    peer: Arc<RpcPeer>,
}

impl RpcClient {
    pub fn new(peer: Arc<RpcPeer>) -> Self {
        Self { peer }
    }
}

impl AcpClient for RpcClient {
    fn session_update(
        &self,
        notification: SessionNotification,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let params = match serde_json::to_value(&notification) {
                Ok(v) => v,
                Err(e) => {
                    debug!("[client] failed to serialize session update: {}", e);
                    return;
                }
            };
            self.peer.send_notification("session/update", params).await;
        })
    }

    fn request_permission(
        &self,
        request: RequestPermissionRequest,
    ) -> Pin<Box<dyn Future<Output = PermissionOutcome> + Send + '_>> {
        Box::pin(async move {
            let params = match serde_json::to_value(&request) {
                Ok(v) => v,
                Err(_) => return PermissionOutcome::Cancelled,
            };
            let result = self
                .peer
                .send_request_untimed("session/request_permission", params)
                .await;
            match result {
                Ok(value) => {
                    match serde_json::from_value::<RequestPermissionResponse>(value) {
                        Ok(response) => response.outcome,
                        Err(e) => {
                            debug!("[client] malformed permission response: {}", e);
                            PermissionOutcome::Cancelled
                        }
                    }
                }
                Err(e) => {
                    debug!("[client] permission request failed: {}", e);
                    PermissionOutcome::Cancelled
                }
            }
        })
    }
}
