//! Tool-server client library: line-delimited JSON-RPC over a child
//! process's stdio, plus the managed lifecycle around it.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{ServerConfig, ToolServer};
//! use std::time::Duration;
//!
//! # async fn example() -> mcp::Result<()> {
//! let mut config = ServerConfig::new("mcp-filesystem");
//! config.args = vec!["--root".to_string(), "./workspace".to_string()];
//!
//! let server = ToolServer::start(config).await?;
//! for tool in server.tools() {
//!     println!("tool: {}", tool.name);
//! }
//!
//! let result = server
//!     .invoke("read_file", serde_json::json!({"path": "README.md"}), Duration::from_secs(15))
//!     .await?;
//! println!("{result}");
//!
//! server.stop(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

mod error;
mod protocol;
mod server;
mod transport;

pub use error::{Error, Result, StartStage};
pub use protocol::{
    CallToolParams, InboundMessage, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, ListToolsResult, PROTOCOL_VERSION, ServerCapabilities,
    ServerInfo, ServerNotification, ToolSpec,
};
pub use server::{
    DEFAULT_HEALTH_INTERVAL, DEFAULT_INIT_TIMEOUT, RestartPolicy, ServerConfig, ServerEvent,
    ServerId, ServerState, ToolServer,
};
pub use transport::{MAX_LINE_BYTES, Transport};
