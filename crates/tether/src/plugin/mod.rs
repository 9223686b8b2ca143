//! Plugin factories and the named plugin set.
//!
//! A plugin is a pair of constructors: one builds the server-side handler
//! object that answers RPC in the plugin process, the other wraps an RPC
//! endpoint into the typed proxy handed to host code. Host and plugin must
//! load identical sets under identical names; a name present on one side
//! only surfaces as `unknown plugin type` at dispense time.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::StreamBroker;
use crate::rpc::{RpcEndpoint, ServiceHandler};

/// Service name application handlers are registered under on a dispensed
/// stream.
pub const PLUGIN_SERVICE: &str = "Plugin";

/// Factory for one named service.
pub trait ServicePlugin: Send + Sync {
    /// Construct the server-side handler that will answer calls for this
    /// service. Runs in the plugin process at dispense time.
    ///
    /// # Errors
    ///
    /// A construction failure is reported to the dispensing host as its
    /// stringified message.
    fn server(&self, broker: &Arc<StreamBroker>) -> Result<Arc<dyn ServiceHandler>, PluginError>;

    /// Wrap `endpoint` into the typed proxy returned to host code.
    ///
    /// The proxy is handed back as `Box<dyn Any + Send>`; the caller
    /// downcasts it to the concrete type this plugin produces.
    ///
    /// # Errors
    ///
    /// A construction failure aborts the dispense locally.
    fn client(
        &self,
        broker: &Arc<StreamBroker>,
        endpoint: RpcEndpoint,
    ) -> Result<Box<dyn Any + Send>, PluginError>;
}

/// The services a host or plugin process knows, keyed by unique name.
pub type PluginSet = HashMap<String, Arc<dyn ServicePlugin>>;

/// Plugin constructor errors.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// A server- or client-side constructor failed.
    #[error("{0}")]
    Construction(String),
}
