//! ACP plumbing: the JSON-RPC stdio peer and the wire schema.

pub mod schema;
pub mod transport;

pub use transport::{RpcError, RpcPeer};
