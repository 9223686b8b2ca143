//! # tether
//!
//! Subprocess plugin runtime: a host process spawns a plugin executable,
//! discovers its listening address from a handshake line on the child's
//! stdout, and calls the plugin's named services over a stream-multiplexed
//! RPC transport. The transport also forwards the plugin's stdout and
//! stderr back to the host, and the supervisor guarantees termination:
//! graceful first, forced when the plugin is unresponsive.
//!
//! Connections assume a trusted local boundary: there is no authentication
//! or encryption, and a crashed plugin is not revived; one process is one
//! session.
//!
//! ## Host side
//!
//! ```rust,no_run
//! use tether::{ClientConfig, PluginClient, PluginSet};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = PluginClient::new(
//!         ClientConfig::builder()
//!             .command("./my-plugin")
//!             .plugins(PluginSet::new())
//!             .build(),
//!     );
//!
//!     let session = client.protocol().await?;
//!     session.ping().await?;
//!     client.kill().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Plugin side
//!
//! A plugin executable loads the same plugin set and calls
//! [`server::serve`], which announces the listening address on stdout and
//! serves host sessions until the host asks it to quit.

#![warn(missing_docs)]

pub mod broker;
pub mod client;
pub mod handshake;
pub mod mux;
pub mod plugin;
pub mod rpc;
pub mod server;
pub mod session;

pub use broker::StreamBroker;
pub use client::{ClientConfig, ClientError, PluginClient};
pub use handshake::{CORE_PROTOCOL_VERSION, Handshake, PluginAddr};
pub use plugin::{PLUGIN_SERVICE, PluginSet, ServicePlugin};
pub use rpc::{RpcEndpoint, RpcServer, ServiceError, ServiceHandler};
pub use server::{ServeConfig, serve};
pub use session::ClientSession;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::broker::StreamBroker;
    pub use crate::client::{ClientConfig, PluginClient};
    pub use crate::plugin::{PluginSet, ServicePlugin};
    pub use crate::rpc::{RpcEndpoint, ServiceError, ServiceHandler};
    pub use crate::server::{ServeConfig, serve};
    pub use crate::session::ClientSession;
}
