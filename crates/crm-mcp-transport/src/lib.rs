//! Streamable HTTP transport for the CRM MCP gateway.
//!
//! Provides:
//! - JSON-RPC envelope types
//! - `McpServer` and the process-wide `ServerSingleton`
//! - `SessionTransport` - one session's view of the server and its event log
//! - Request router and health endpoint (feature: http)

pub mod protocol;
pub mod server;
pub mod stream;

#[cfg(feature = "http")]
pub mod health;
#[cfg(feature = "http")]
pub mod router;

pub use protocol::{ClientMessage, JsonRpcResponse};
#[cfg(feature = "http")]
pub use router::{McpRouter, RouterError, create_router};
pub use server::{BuildError, McpServer, ServerSingleton};
pub use stream::SessionTransport;
