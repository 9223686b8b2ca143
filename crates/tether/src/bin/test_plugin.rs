//! Helper plugin binary driven by the integration tests.
//!
//! Each mode exercises one corner of the launch/handshake/termination
//! protocol: announcing without serving, never announcing, writing to
//! stderr, serving the real runtime, and reading passed-through stdin.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tether::broker::StreamBroker;
use tether::plugin::{PluginError, PluginSet, ServicePlugin};
use tether::rpc::{RpcEndpoint, ServiceError, ServiceHandler};
use tether::server::{ServeConfig, serve};
use tokio::io::AsyncReadExt;

/// The `test` service: doubles numbers and echoes into its own stdio.
struct TestService;

#[derive(Deserialize)]
struct PrintStdioParams {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[async_trait]
impl ServiceHandler for TestService {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "Double" => {
                let v: i64 = serde_json::from_value(params)
                    .map_err(|e| ServiceError::InvalidParams(e.to_string()))?;
                Ok(json!(v * 2))
            },
            "PrintStdio" => {
                let p: PrintStdioParams = serde_json::from_value(params)
                    .map_err(|e| ServiceError::InvalidParams(e.to_string()))?;
                if !p.stdout.is_empty() {
                    print!("{}", p.stdout);
                    let _ = std::io::stdout().flush();
                }
                if !p.stderr.is_empty() {
                    eprint!("{}", p.stderr);
                    let _ = std::io::stderr().flush();
                }
                Ok(Value::Null)
            },
            other => Err(ServiceError::UnknownMethod(other.to_string())),
        }
    }
}

struct TestPlugin;

impl ServicePlugin for TestPlugin {
    fn server(&self, _broker: &Arc<StreamBroker>) -> Result<Arc<dyn ServiceHandler>, PluginError> {
        Ok(Arc::new(TestService))
    }

    fn client(
        &self,
        _broker: &Arc<StreamBroker>,
        endpoint: RpcEndpoint,
    ) -> Result<Box<dyn std::any::Any + Send>, PluginError> {
        Ok(Box::new(endpoint))
    }
}

fn test_plugins() -> PluginSet {
    let mut plugins = PluginSet::new();
    plugins.insert("test".to_string(), Arc::new(TestPlugin));
    plugins
}

fn announce_mock() {
    println!("tcp|:1234");
    let _ = std::io::stdout().flush();
}

async fn run_serve() {
    if let Err(e) = serve(ServeConfig::new(test_plugins())).await {
        eprintln!("serve failed: {e}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() {
    // Logs must stay off stdout; the first stdout line is the handshake.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(mode) = args.next() else {
        eprintln!("usage: test-plugin <mode> [args]");
        std::process::exit(2);
    };

    match mode.as_str() {
        // Announce an address but never serve it.
        "mock" => {
            announce_mock();
            std::future::pending::<()>().await
        },
        // Never announce anything.
        "start-timeout" => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            std::process::exit(1);
        },
        // Announce, chatter on stderr, exit.
        "stderr" => {
            announce_mock();
            eprintln!("HELLO");
            eprintln!("WORLD");
        },
        // Serve until Quit, then leave a marker file behind.
        "cleanup" => {
            let Some(path) = args.next() else {
                eprintln!("cleanup mode needs a path");
                std::process::exit(2);
            };
            run_serve().await;
            if let Err(e) = std::fs::write(&path, "done") {
                eprintln!("writing cleanup marker failed: {e}");
                std::process::exit(1);
            }
        },
        // The real runtime.
        "serve" => run_serve().await,
        // Announce, then verify stdin passthrough.
        "stdin" => {
            announce_mock();
            let mut buf = [0u8; 5];
            if let Err(e) = tokio::io::stdin().read_exact(&mut buf).await {
                eprintln!("stdin read failed: {e}");
                std::process::exit(100);
            }
            if &buf != b"hello" {
                std::process::exit(1);
            }
        },
        other => {
            eprintln!("unknown mode: {other}");
            std::process::exit(2);
        },
    }
}
