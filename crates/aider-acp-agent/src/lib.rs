//! The agent side of the adapter: aider subprocess management, the
//! session/turn orchestrator, and ACP method dispatch.

use std::sync::Arc;

pub mod agent;
pub mod client;
pub mod config;
pub mod process;
pub mod resources;
pub mod session;
pub mod tool_log;

pub use agent::AiderAgent;
pub use config::AgentConfig;

use aider_acp_rpc::RpcPeer;
use client::RpcClient;

/// Serve the ACP agent over this process's stdin/stdout until the editor
/// disconnects.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let peer = RpcPeer::new(tokio::io::stdin(), tokio::io::stdout());
    let client = Arc::new(RpcClient::new(peer.clone()));
    let agent = AiderAgent::new(config, client);

    agent::register_handlers(&agent, &peer).await;

    peer.wait_closed().await;
    agent.shutdown_all().await;
    Ok(())
}
