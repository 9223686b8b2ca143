//! Shared fixtures for the lifecycle tests: the host-side view of the
//! `test` plugin served by the helper binary, plus an observable sink.

use std::any::Any;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tether::broker::StreamBroker;
use tether::client::{ClientConfig, ClientConfigBuilder};
use tether::plugin::{PLUGIN_SERVICE, PluginError, PluginSet, ServicePlugin};
use tether::rpc::{RpcEndpoint, ServiceError, ServiceHandler};
use tokio::io::AsyncWrite;

/// Path of the helper plugin binary built alongside the crate.
pub const TEST_PLUGIN_BIN: &str = env!("CARGO_BIN_EXE_test-plugin");

/// Typed proxy for the `test` service.
pub struct TestProxy {
    endpoint: RpcEndpoint,
}

impl TestProxy {
    pub async fn double(&self, v: i64) -> Result<i64> {
        let value = self.endpoint.call(PLUGIN_SERVICE, "Double", json!(v)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn print_stdio(&self, stdout: &str, stderr: &str) -> Result<()> {
        self.endpoint
            .call(
                PLUGIN_SERVICE,
                "PrintStdio",
                json!({ "stdout": stdout, "stderr": stderr }),
            )
            .await?;
        Ok(())
    }
}

struct Doubler;

#[async_trait]
impl ServiceHandler for Doubler {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "Double" => {
                let v: i64 = serde_json::from_value(params)
                    .map_err(|e| ServiceError::InvalidParams(e.to_string()))?;
                Ok(json!(v * 2))
            },
            other => Err(ServiceError::UnknownMethod(other.to_string())),
        }
    }
}

/// Host-side factory matching the helper binary's `test` plugin.
pub struct TestPlugin;

impl ServicePlugin for TestPlugin {
    fn server(&self, _broker: &Arc<StreamBroker>) -> Result<Arc<dyn ServiceHandler>, PluginError> {
        Ok(Arc::new(Doubler))
    }

    fn client(
        &self,
        _broker: &Arc<StreamBroker>,
        endpoint: RpcEndpoint,
    ) -> Result<Box<dyn Any + Send>, PluginError> {
        Ok(Box::new(TestProxy { endpoint }))
    }
}

/// The plugin set both sides of the tests load.
pub fn test_plugins() -> PluginSet {
    let mut plugins = PluginSet::new();
    plugins.insert("test".to_string(), Arc::new(TestPlugin));
    plugins
}

/// Config builder for launching the helper binary with `args`.
pub fn plugin_config(args: &[&str]) -> ClientConfigBuilder {
    ClientConfig::builder()
        .command(TEST_PLUGIN_BIN)
        .args(args.iter().copied())
        .plugins(test_plugins())
}

/// An in-memory sink whose contents tests can inspect.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn string(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("lock poisoned")).into_owned()
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().expect("lock poisoned").extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
