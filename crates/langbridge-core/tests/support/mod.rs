//! Scripted in-memory backends for integration tests
//!
//! [`ScriptedLauncher`] implements `ProcessLauncher` without spawning
//! anything: each launch starts a task that speaks the real framing over
//! `tokio::io::duplex` pipes and answers according to a [`Script`].

#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use langbridge_core::channel::FramedChannel;
use langbridge_core::protocol::{Message, Notification, Request, Response, RpcError};
use langbridge_core::{
    BackendDescriptor, BackendProcess, BridgeError, BridgeResult, LaunchedBackend,
    ProcessLauncher,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How a scripted backend behaves
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Capability object returned from `initialize`
    pub capabilities: Value,
    pub results: HashMap<String, Value>,
    pub errors: HashMap<String, RpcError>,
    pub delays: HashMap<String, Duration>,
    /// Methods that are never answered
    pub hold: HashSet<String>,
    pub handshake_error: Option<RpcError>,
    pub fail_spawn: bool,
    /// Exit with this code as soon as `initialize` arrives
    pub exit_on_initialize: Option<i32>,
    pub launch_delay: Option<Duration>,
}

impl Script {
    /// A language server advertising every provider the adapter maps
    pub fn lsp() -> Self {
        Self {
            capabilities: json!({
                "hoverProvider": true,
                "definitionProvider": true,
                "referencesProvider": true,
                "documentSymbolProvider": true,
                "workspaceSymbolProvider": true,
                "completionProvider": { "triggerCharacters": ["."] },
            }),
            ..Self::default()
        }
    }

    /// A tool server advertising tools
    pub fn mcp() -> Self {
        Self {
            capabilities: json!({ "tools": { "listChanged": false } }),
            ..Self::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_result(mut self, method: &str, result: Value) -> Self {
        self.results.insert(method.to_string(), result);
        self
    }

    pub fn with_error(mut self, method: &str, error: RpcError) -> Self {
        self.errors.insert(method.to_string(), error);
        self
    }

    pub fn with_delay(mut self, method: &str, delay: Duration) -> Self {
        self.delays.insert(method.to_string(), delay);
        self
    }

    pub fn holding(mut self, method: &str) -> Self {
        self.hold.insert(method.to_string());
        self
    }

    pub fn rejecting_handshake(mut self, error: RpcError) -> Self {
        self.handshake_error = Some(error);
        self
    }

    pub fn failing_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    pub fn exiting_on_initialize(mut self, code: i32) -> Self {
        self.exit_on_initialize = Some(code);
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = Some(delay);
        self
    }

    fn answer(&self, request: &Request) -> Response {
        if let Some(error) = self.errors.get(&request.method) {
            return Response::error(request.id.clone(), error.clone());
        }
        if let Some(result) = self.results.get(&request.method) {
            return Response::success(request.id.clone(), result.clone());
        }
        let params = request.params.clone().unwrap_or(Value::Null);
        let result = match request.method.as_str() {
            "textDocument/hover" => json!({
                "contents": {
                    "kind": "plaintext",
                    "value": format!(
                        "{}:{}:{}",
                        params["textDocument"]["uri"].as_str().unwrap_or_default(),
                        params["position"]["line"],
                        params["position"]["character"],
                    ),
                },
            }),
            "tools/call" => json!({
                "content": [{ "type": "text", "text": params["name"] }],
                "isError": false,
                "arguments": params["arguments"],
            }),
            _ => Value::Null,
        };
        Response::success(request.id.clone(), result)
    }
}

/// Control and inspection handle for one launched backend
#[derive(Clone)]
pub struct BackendHandle {
    received: Arc<Mutex<Vec<Message>>>,
    crash: mpsc::UnboundedSender<i32>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl BackendHandle {
    /// Exit abruptly with `code`, closing stdout
    pub fn crash(&self, code: i32) {
        let _ = self.crash.send(code);
    }

    /// Write a message to the bridge as the backend
    pub fn send(&self, message: impl Into<Message>) {
        let _ = self.outbound.send(message.into());
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }

    /// Methods of received requests and notifications, in arrival order
    pub fn methods(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter_map(|m| match m {
                Message::Request(r) => Some(r.method.clone()),
                Message::Notification(n) => Some(n.method.clone()),
                Message::Response(_) => None,
            })
            .collect()
    }

    pub fn requests(&self, method: &str) -> Vec<Request> {
        self.received
            .lock()
            .iter()
            .filter_map(|m| match m {
                Message::Request(r) if r.method == method => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self, method: &str) -> Vec<Notification> {
        self.received
            .lock()
            .iter()
            .filter_map(|m| match m {
                Message::Notification(n) if n.method == method => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.received
            .lock()
            .iter()
            .filter_map(|m| match m {
                Message::Response(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// Poll until a message matching `predicate` has arrived
    pub async fn wait_for(&self, predicate: impl Fn(&[Message]) -> bool) {
        for _ in 0..500 {
            if predicate(&self.received.lock()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("backend never received the expected message");
    }
}

/// Launcher whose backends are in-process tasks
#[derive(Default)]
pub struct ScriptedLauncher {
    script: Mutex<Script>,
    spawns: AtomicUsize,
    backends: Mutex<Vec<BackendHandle>>,
    descriptors: Mutex<Vec<BackendDescriptor>>,
}

impl ScriptedLauncher {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Self::default()
        })
    }

    /// Script used by subsequent launches
    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    /// Launch attempts, failed ones included
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn backend(&self, index: usize) -> BackendHandle {
        self.backends.lock()[index].clone()
    }

    pub fn last_backend(&self) -> BackendHandle {
        self.backends
            .lock()
            .last()
            .cloned()
            .expect("no backend launched")
    }

    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.descriptors.lock().clone()
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(&self, descriptor: &BackendDescriptor) -> BridgeResult<LaunchedBackend> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.descriptors.lock().push(descriptor.clone());
        let script = self.script.lock().clone();

        if let Some(delay) = script.launch_delay {
            tokio::time::sleep(delay).await;
        }
        if script.fail_spawn {
            return Err(BridgeError::handshake(
                descriptor.key().id(),
                format!("failed to spawn '{}': not found", descriptor.command),
            ));
        }

        let (bridge_stdin, backend_stdin) = tokio::io::duplex(64 * 1024);
        let (backend_stdout, bridge_stdout) = tokio::io::duplex(64 * 1024);

        let received = Arc::new(Mutex::new(Vec::new()));
        let (crash_tx, crash_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let handle = BackendHandle {
            received: Arc::clone(&received),
            crash: crash_tx,
            outbound: outbound_tx.clone(),
        };
        self.backends.lock().push(handle);

        tokio::spawn(run_backend(
            script,
            FramedChannel::new(backend_stdin, backend_stdout),
            received,
            crash_rx,
            outbound_tx,
            outbound_rx,
            kill_rx,
            exit_tx,
        ));

        Ok(LaunchedBackend {
            stdin: Box::new(bridge_stdin),
            stdout: Box::new(bridge_stdout),
            process: Box::new(ScriptedProcess {
                kill: Some(kill_tx),
                exit: Some(exit_rx),
                code: None,
            }),
        })
    }
}

struct ScriptedProcess {
    kill: Option<oneshot::Sender<()>>,
    exit: Option<oneshot::Receiver<Option<i32>>>,
    code: Option<Option<i32>>,
}

#[async_trait]
impl BackendProcess for ScriptedProcess {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(code) = self.code {
            return Ok(code);
        }
        let code = match self.exit.take() {
            Some(exit) => exit.await.unwrap_or(None),
            None => None,
        };
        self.code = Some(code);
        Ok(code)
    }

    fn start_kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    fn id(&self) -> Option<u32> {
        None
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_backend(
    script: Script,
    channel: FramedChannel<tokio::io::DuplexStream, tokio::io::DuplexStream, Message>,
    received: Arc<Mutex<Vec<Message>>>,
    mut crash: mpsc::UnboundedReceiver<i32>,
    outbound: mpsc::UnboundedSender<Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    mut kill: oneshot::Receiver<()>,
    exit: oneshot::Sender<Option<i32>>,
) {
    let (mut reader, mut writer) = channel.split();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if writer.send(message).await.is_err() {
                break;
            }
        }
    });

    let code = loop {
        tokio::select! {
            _ = &mut kill => break Some(137),
            Some(code) = crash.recv() => break Some(code),
            frame = reader.next() => {
                let message = match frame {
                    Some(Ok(Ok(message))) => message,
                    Some(Ok(Err(_))) => continue,
                    Some(Err(_)) | None => break Some(0),
                };
                received.lock().push(message.clone());

                match message {
                    Message::Request(request) if request.method == "initialize" => {
                        if let Some(code) = script.exit_on_initialize {
                            break Some(code);
                        }
                        let response = match &script.handshake_error {
                            Some(error) => Response::error(request.id.clone(), error.clone()),
                            None => Response::success(
                                request.id.clone(),
                                json!({
                                    "capabilities": script.capabilities,
                                    "serverInfo": { "name": "scripted", "version": "1.0" },
                                }),
                            ),
                        };
                        let _ = outbound.send(response.into());
                    }
                    Message::Request(request) => {
                        if script.hold.contains(&request.method) {
                            continue;
                        }
                        let response = script.answer(&request);
                        match script.delays.get(&request.method) {
                            Some(delay) => {
                                let delay = *delay;
                                let outbound = outbound.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let _ = outbound.send(response.into());
                                });
                            }
                            None => {
                                let _ = outbound.send(response.into());
                            }
                        }
                    }
                    Message::Notification(notification) if notification.method == "exit" => {
                        break Some(0);
                    }
                    Message::Notification(_) | Message::Response(_) => {}
                }
            }
        }
    };

    writer_task.abort();
    let _ = writer_task.await;
    let _ = exit.send(code);
}

/// Configuration with a `py` language server and a `tools` MCP server
pub fn config(eager: bool, max_restarts: u32) -> langbridge_core::BridgeConfig {
    let toml = format!(
        r#"
        request_timeout_secs = 5
        handshake_timeout_secs = 5
        shutdown_grace_secs = 1

        [restart]
        max_restarts = {max_restarts}
        window_secs = 60
        eager = {eager}

        [restart.backoff]
        initial_delay_ms = 10
        max_delay_ms = 50
        multiplier = 2.0

        [languages.py]
        command = "pylsp"
        extensions = ["py"]
        language_id = "python"

        [languages.tools]
        protocol = "mcp"
        command = "tool-server"
        "#
    );
    langbridge_core::BridgeConfig::from_toml_str(&toml).expect("test config")
}

/// Session options with short timings
pub fn session_options() -> langbridge_core::SessionOptions {
    langbridge_core::SessionOptions::new(
        langbridge_core::SessionSettings {
            handshake_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
            max_frame_len: langbridge_core::channel::DEFAULT_MAX_FRAME_LEN,
        },
        langbridge_core::DiagnosticsAggregator::new(64),
    )
}

/// Route library logs to the test harness; `RUST_LOG` narrows them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
