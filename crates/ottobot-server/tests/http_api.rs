//! Full-stack tests: gateway + in-process worker + fake sandbox runtime,
//! driven over real HTTP and WebSocket connections.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use ottobot_sandbox::{
    SandboxDescriptor, SandboxResult, SandboxSpec, SandboxState, Supervisor,
};
use ottobot_server::worker::WorkerConfig;
use ottobot_server::{
    build_router, Agent, AgentError, AgentFactory, AppState, Config, EventSink, Lifecycle,
    LifecycleConfig, WorkerRuntime,
};
use ottobot_session::{
    MessageEvent, MessageFabric, MessageType, PortAllocator, PortKind, PortRange,
    SessionRegistry, WorkQueue,
};
use ottobot_store::{MemoryStore, Store};

#[derive(Default)]
struct FakeSupervisor {
    created: AtomicUsize,
    running: Mutex<HashSet<String>>,
}

impl FakeSupervisor {
    fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn create(&self, spec: &SandboxSpec) -> SandboxResult<SandboxDescriptor> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SandboxDescriptor {
            sandbox_id: format!("sbx-{n}"),
            session_id: spec.session_id.clone(),
            desktop_port: spec.desktop_port,
            tool_port: spec.tool_port,
            created_at: chrono::Utc::now(),
            memory_limit: "2g".to_string(),
            cpu_shares: 1024,
        })
    }
    async fn start(&self, sandbox_id: &str) -> SandboxResult<()> {
        self.running.lock().unwrap().insert(sandbox_id.to_string());
        Ok(())
    }
    async fn stop(&self, sandbox_id: &str, _grace: Duration) -> SandboxResult<()> {
        self.running.lock().unwrap().remove(sandbox_id);
        Ok(())
    }
    async fn remove(&self, sandbox_id: &str) -> SandboxResult<()> {
        self.running.lock().unwrap().remove(sandbox_id);
        Ok(())
    }
    async fn status(&self, sandbox_id: &str) -> SandboxResult<SandboxState> {
        if self.running.lock().unwrap().contains(sandbox_id) {
            Ok(SandboxState::Running)
        } else {
            Ok(SandboxState::Unknown)
        }
    }
    async fn wait_for_desktop(
        &self,
        _sandbox_id: &str,
        _desktop_port: u16,
        _max_wait: Duration,
    ) -> SandboxResult<()> {
        Ok(())
    }
    async fn reap_stale(&self, _older_than: Duration) -> SandboxResult<usize> {
        Ok(0)
    }
    async fn available(&self) -> bool {
        true
    }
}

struct DoneAgent {
    sink: EventSink,
}

#[async_trait]
impl Agent for DoneAgent {
    async fn process(&self, _prompt: &str) -> Result<(), AgentError> {
        self.sink
            .emit(MessageEvent::new(MessageType::AgentResponse, "done"))
            .await;
        Ok(())
    }
    async fn shutdown(&self) {}
}

struct DoneAgentFactory;

#[async_trait]
impl AgentFactory for DoneAgentFactory {
    async fn spawn(
        &self,
        _session_id: &str,
        _tool_endpoint: &str,
        sink: EventSink,
    ) -> Result<Arc<dyn Agent>, AgentError> {
        Ok(Arc::new(DoneAgent { sink }))
    }
}

struct StackOptions {
    desktop_range: PortRange,
    tool_range: PortRange,
    session_timeout: Duration,
    with_worker: bool,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            desktop_range: PortRange::new(6080, 6081),
            tool_range: PortRange::new(8080, 8081),
            session_timeout: Duration::from_secs(3600),
            with_worker: true,
        }
    }
}

struct Stack {
    base: String,
    ws_base: String,
    client: reqwest::Client,
    registry: SessionRegistry,
    queue: WorkQueue,
    desktop_ports: PortAllocator,
    tool_ports: PortAllocator,
    supervisor: Arc<FakeSupervisor>,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    worker: Option<JoinHandle<()>>,
}

impl Stack {
    async fn start(options: StackOptions) -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new(store.clone(), options.session_timeout);
        let fabric = MessageFabric::new(store.clone());
        let queue = WorkQueue::new(store.clone());
        let desktop_ports =
            PortAllocator::new(store.clone(), PortKind::Desktop, options.desktop_range);
        let tool_ports = PortAllocator::new(store.clone(), PortKind::Tool, options.tool_range);
        let supervisor = Arc::new(FakeSupervisor::default());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = Arc::new(Config {
            api_host: "127.0.0.1".to_string(),
            api_port: addr.port(),
            public_host: "127.0.0.1".to_string(),
            session_timeout: options.session_timeout,
            desktop_ports: options.desktop_range,
            tool_ports: options.tool_range,
            ..Default::default()
        });

        let state = AppState {
            config: config.clone(),
            store: store.clone(),
            registry: registry.clone(),
            fabric: fabric.clone(),
            queue: queue.clone(),
            desktop_ports: desktop_ports.clone(),
            tool_ports: tool_ports.clone(),
            supervisor: supervisor.clone(),
            http: reqwest::Client::new(),
            started_at: Instant::now(),
        };
        let app = build_router(state);
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let cancel = CancellationToken::new();
        let worker = if options.with_worker {
            let lifecycle = Arc::new(Lifecycle::new(
                "w-e2e".to_string(),
                registry.clone(),
                fabric.clone(),
                queue.clone(),
                desktop_ports.clone(),
                tool_ports.clone(),
                supervisor.clone(),
                Arc::new(DoneAgentFactory),
                "127.0.0.1".to_string(),
                LifecycleConfig {
                    stop_pause: Duration::from_millis(10),
                    ..Default::default()
                },
            ));
            let runtime = Arc::new(WorkerRuntime::new(
                "w-e2e".to_string(),
                store.clone(),
                queue.clone(),
                lifecycle,
                WorkerConfig {
                    poll_interval: Duration::from_millis(20),
                    drain_timeout: Duration::from_secs(2),
                    ..Default::default()
                },
            ));
            let parent = cancel.clone();
            let token = runtime.cancellation_token();
            tokio::spawn(async move {
                parent.cancelled().await;
                token.cancel();
            });
            Some(tokio::spawn(async move {
                runtime.run().await.unwrap();
            }))
        } else {
            None
        };

        Self {
            base: format!("http://{addr}"),
            ws_base: format!("ws://{addr}"),
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            registry,
            queue,
            desktop_ports,
            tool_ports,
            supervisor,
            cancel,
            server,
            worker,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker {
            let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
        }
        self.server.abort();
    }

    async fn create_session(&self, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/session", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn session_status(&self, id: &str) -> Option<String> {
        let resp = self
            .client
            .get(format!("{}/session/{id}", self.base))
            .send()
            .await
            .unwrap();
        if resp.status() == 404 {
            return None;
        }
        let body: Value = resp.json().await.unwrap();
        Some(body["status"].as_str().unwrap().to_string())
    }

    async fn wait_for_status(&self, id: &str, expected: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.session_status(id).await.as_deref() == Some(expected) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session {id} never reached {expected}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

async fn next_event(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for chat event")
            .expect("socket closed")
            .expect("socket errored");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn happy_path_create_chat_respond() {
    let stack = Stack::start(StackOptions::default()).await;

    let resp = stack
        .create_session(json!({
            "initial_prompt": "make a hello world",
            "environment": "node",
            "timeout": 600
        }))
        .await;
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    let sid = body["session_id"].as_str().unwrap().to_string();
    assert_eq!(
        body["desktop_url"].as_str().unwrap(),
        "http://127.0.0.1:6080/vnc.html"
    );
    assert_eq!(
        body["chat_url"].as_str().unwrap(),
        format!("{}/session/{sid}/chat", stack.ws_base)
    );

    stack.wait_for_status(&sid, "Ready").await;

    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("{}/session/{sid}/chat", stack.ws_base))
            .await
            .unwrap();

    // Greeting first, then replayed history containing the ready
    // announcement.
    let greeting = next_event(&mut ws).await;
    assert_eq!(greeting["type"], "system_update");
    assert!(greeting["content"]
        .as_str()
        .unwrap()
        .starts_with("Connected to session"));

    let ready = next_event(&mut ws).await;
    assert_eq!(ready["type"], "system_update");
    assert_eq!(ready["metadata"]["desktop_ready"], true);

    ws.send(Message::Text(
        json!({
            "type": "user_prompt",
            "content": "make a hello world",
            "timestamp": chrono::Utc::now().timestamp_millis()
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    // Ack, then the prompt echoed to subscribers, then the agent's answer.
    let mut saw_ack = false;
    let mut saw_prompt = false;
    loop {
        let event = next_event(&mut ws).await;
        match event["type"].as_str().unwrap() {
            "system_update" => {
                assert!(event["content"]
                    .as_str()
                    .unwrap()
                    .starts_with("Message received"));
                saw_ack = true;
            }
            "user_prompt" => {
                assert_eq!(event["content"], "make a hello world");
                saw_prompt = true;
            }
            "agent_response" => {
                assert!(saw_prompt, "agent output arrived before the user prompt");
                assert_eq!(event["content"], "done");
                break;
            }
            other => panic!("unexpected event type {other}"),
        }
    }
    assert!(saw_ack, "ack was never delivered");
    assert!(saw_prompt);

    stack.wait_for_status(&sid, "Running").await;
    stack.stop().await;
}

#[tokio::test]
async fn port_exhaustion_returns_503() {
    let stack = Stack::start(StackOptions {
        desktop_range: PortRange::new(6080, 6080),
        with_worker: false,
        ..Default::default()
    })
    .await;

    let first = stack
        .create_session(json!({"initial_prompt": "one"}))
        .await;
    assert_eq!(first.status(), 201);

    let second = stack
        .create_session(json!({"initial_prompt": "two"}))
        .await;
    assert_eq!(second.status(), 503);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["error"], "Service Unavailable");
    assert!(body["message"].as_str().unwrap().starts_with("No available"));

    // The doomed record was rolled back; only the first session lists.
    let list: Value = stack
        .client
        .get(format!("{}/session", stack.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["total"], 1);

    stack.stop().await;
}

#[tokio::test]
async fn terminate_racing_create_frees_everything() {
    let stack = Stack::start(StackOptions::default()).await;

    let resp = stack
        .create_session(json!({"initial_prompt": "shortlived"}))
        .await;
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    let sid = body["session_id"].as_str().unwrap().to_string();

    let del = stack
        .client
        .delete(format!("{}/session/{sid}", stack.base))
        .send()
        .await
        .unwrap();
    assert_eq!(del.status(), 202);
    let del_body: Value = del.json().await.unwrap();
    assert_eq!(del_body["session_id"], sid.as_str());

    // Converges on Terminated (or the record is already purged), with both
    // ports free and no sandbox running.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = stack.session_status(&sid).await;
        let done = match status.as_deref() {
            None | Some("Terminated") => true,
            Some("Terminating") | Some("Initializing") | Some("Ready") => false,
            Some(other) => panic!("unexpected status {other}"),
        };
        let ports_free = stack.desktop_ports.owner(6080).await.unwrap().is_none()
            && stack.tool_ports.owner(8080).await.unwrap().is_none();
        if done && ports_free && stack.supervisor.running_count() == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "terminate-vs-create race did not converge: status={status:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    stack.stop().await;
}

#[tokio::test]
async fn redelivered_create_job_is_idempotent() {
    let stack = Stack::start(StackOptions::default()).await;

    let resp = stack
        .create_session(json!({"initial_prompt": "once"}))
        .await;
    let body: Value = resp.json().await.unwrap();
    let sid = body["session_id"].as_str().unwrap().to_string();
    stack.wait_for_status(&sid, "Ready").await;

    // Second delivery of the same logical job.
    stack
        .queue
        .enqueue(
            ottobot_session::JobKind::CreateSession,
            &sid,
            json!({}),
        )
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if stack.queue.pending_len().await.unwrap() == 0
            && stack.queue.active_len().await.unwrap() == 0
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "redelivery never drained");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(stack.supervisor.created.load(Ordering::SeqCst), 1);
    assert_eq!(stack.queue.failed_len().await.unwrap(), 0);
    assert_eq!(stack.session_status(&sid).await.as_deref(), Some("Ready"));

    stack.stop().await;
}

#[tokio::test]
async fn validation_rejects_bad_input() {
    let stack = Stack::start(StackOptions {
        with_worker: false,
        ..Default::default()
    })
    .await;

    let empty = stack.create_session(json!({"initial_prompt": ""})).await;
    assert_eq!(empty.status(), 400);

    let long = stack
        .create_session(json!({"initial_prompt": "x".repeat(5001)}))
        .await;
    assert_eq!(long.status(), 400);

    let short_timeout = stack
        .create_session(json!({"initial_prompt": "ok", "timeout": 10}))
        .await;
    assert_eq!(short_timeout.status(), 400);
    let body: Value = short_timeout.json().await.unwrap();
    assert_eq!(body["error"], "Bad Request");

    let missing = stack
        .client
        .get(format!("{}/session/doesnotexist", stack.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    stack.stop().await;
}

#[tokio::test]
async fn logs_endpoint_returns_session_log_tail() {
    let stack = Stack::start(StackOptions::default()).await;
    let resp = stack
        .create_session(json!({"initial_prompt": "logged"}))
        .await;
    let body: Value = resp.json().await.unwrap();
    let sid = body["session_id"].as_str().unwrap().to_string();
    stack.wait_for_status(&sid, "Ready").await;

    let logs: Value = stack
        .client
        .get(format!("{}/session/{sid}/logs", stack.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs["session_id"], sid.as_str());
    let entries = logs["logs"].as_array().unwrap();
    assert!(!entries.is_empty());
    let messages: Vec<&str> = entries
        .iter()
        .map(|e| e["message"].as_str().unwrap())
        .collect();
    assert!(messages.contains(&"session ready"));

    let missing = stack
        .client
        .get(format!("{}/session/ghost/logs", stack.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    stack.stop().await;
}

#[tokio::test]
async fn download_without_tool_port_is_rejected() {
    let stack = Stack::start(StackOptions {
        with_worker: false,
        ..Default::default()
    })
    .await;
    let resp = stack
        .create_session(json!({"initial_prompt": "nodl"}))
        .await;
    let body: Value = resp.json().await.unwrap();
    let sid = body["session_id"].as_str().unwrap().to_string();

    let dl = stack
        .client
        .get(format!("{}/download/{sid}", stack.base))
        .send()
        .await
        .unwrap();
    assert_eq!(dl.status(), 400);

    let missing = stack
        .client
        .get(format!("{}/download/ghost", stack.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    stack.stop().await;
}

#[tokio::test]
async fn session_ttl_expiry_removes_everything() {
    let stack = Stack::start(StackOptions {
        session_timeout: Duration::from_millis(300),
        with_worker: false,
        ..Default::default()
    })
    .await;
    let resp = stack
        .create_session(json!({"initial_prompt": "fleeting"}))
        .await;
    let body: Value = resp.json().await.unwrap();
    let sid = body["session_id"].as_str().unwrap().to_string();

    assert!(stack.session_status(&sid).await.is_some());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(stack.session_status(&sid).await.is_none());
    assert!(stack
        .registry
        .read_messages(&sid, None)
        .await
        .unwrap()
        .is_empty());

    stack.stop().await;
}

#[tokio::test]
async fn health_and_metrics_report_the_fleet() {
    let stack = Stack::start(StackOptions::default()).await;

    // Wait for worker registration to land.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let health: Value = stack
            .client
            .get(format!("{}/health", stack.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if health["services"]["workers"].as_u64() == Some(1) {
            assert_eq!(health["status"], "healthy");
            assert!(health["services"]["store"].as_bool().unwrap());
            assert!(health["services"]["sandbox_runtime"].as_bool().unwrap());
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "worker never registered");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let resp = stack
        .create_session(json!({"initial_prompt": "metrics"}))
        .await;
    let body: Value = resp.json().await.unwrap();
    let sid = body["session_id"].as_str().unwrap().to_string();
    stack.wait_for_status(&sid, "Ready").await;

    let metrics: Value = stack
        .client
        .get(format!("{}/health/metrics", stack.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["active_sessions"], 1);
    assert_eq!(metrics["total_sessions"], 1);
    let workers = metrics["worker_status"].as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["id"], "w-e2e");
    assert!(workers[0]["active"].as_bool().unwrap());

    stack.stop().await;
}

#[tokio::test]
async fn invalid_chat_payload_gets_error_event_and_socket_survives() {
    let stack = Stack::start(StackOptions {
        with_worker: false,
        ..Default::default()
    })
    .await;
    let resp = stack
        .create_session(json!({"initial_prompt": "chatty"}))
        .await;
    let body: Value = resp.json().await.unwrap();
    let sid = body["session_id"].as_str().unwrap().to_string();

    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("{}/session/{sid}/chat", stack.ws_base))
            .await
            .unwrap();
    let greeting = next_event(&mut ws).await;
    assert_eq!(greeting["type"], "system_update");

    ws.send(Message::Text("this is not json".into()))
        .await
        .unwrap();
    let error = next_event(&mut ws).await;
    assert_eq!(error["type"], "error");

    ws.send(Message::Text(
        json!({"type": "resize", "content": "x"}).to_string().into(),
    ))
    .await
    .unwrap();
    let unsupported = next_event(&mut ws).await;
    assert_eq!(unsupported["type"], "error");

    // Still usable afterwards.
    ws.send(Message::Text(
        json!({"type": "user_prompt", "content": "hello", "timestamp": 1})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    let ack = next_event(&mut ws).await;
    assert_eq!(ack["type"], "system_update");
    assert!(ack["content"]
        .as_str()
        .unwrap()
        .starts_with("Message received"));

    stack.stop().await;
}

#[tokio::test]
async fn chat_upgrade_rejected_for_unknown_session() {
    let stack = Stack::start(StackOptions {
        with_worker: false,
        ..Default::default()
    })
    .await;
    let result =
        tokio_tungstenite::connect_async(format!("{}/session/ghost/chat", stack.ws_base)).await;
    assert!(result.is_err(), "upgrade should be refused");
    stack.stop().await;
}
