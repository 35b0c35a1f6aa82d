//! Docker-backed [`Supervisor`].
//!
//! Shells out to the `docker` CLI rather than speaking the engine API: the
//! operations the plane needs are create/start/stop/rm/inspect/ps and the
//! CLI is the stable, debuggable surface for those. The binary is located
//! once at construction; a missing binary degrades the whole service rather
//! than failing per-request.
//!
//! Inside the container the desktop proxy always listens on 6080 and the
//! tool endpoint on 8080; the host-side ports come from the allocators.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use which::which;

use crate::{
    SandboxDescriptor, SandboxError, SandboxResult, SandboxSpec, SandboxState, Supervisor,
};

const DESKTOP_CONTAINER_PORT: u16 = 6080;
const TOOL_CONTAINER_PORT: u16 = 8080;
const SESSION_LABEL: &str = "ottobot.session";
const CREATED_LABEL: &str = "ottobot.created";
const WORKSPACE_DIR: &str = "ottobot-session-data";
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct DockerConfig {
    /// Host path under which per-session workspaces live.
    pub data_root: PathBuf,
    /// Host the readiness probe dials.
    pub probe_host: String,
    /// Image name without the environment tag, e.g. `ottobot/agent`.
    pub image_base: String,
    /// Optional docker network to attach sandboxes to.
    pub network: Option<String>,
    pub memory_limit: String,
    pub cpu_shares: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/ottobot"),
            probe_host: "localhost".to_string(),
            image_base: "ottobot/agent".to_string(),
            network: None,
            memory_limit: "2g".to_string(),
            cpu_shares: 1024,
        }
    }
}

pub struct DockerSupervisor {
    docker_path: PathBuf,
    config: DockerConfig,
    http: reqwest::Client,
}

impl DockerSupervisor {
    pub fn new(config: DockerConfig) -> SandboxResult<Self> {
        let docker_path =
            which("docker").map_err(|_| SandboxError::MissingBinary("docker".to_string()))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        Ok(Self {
            docker_path,
            config,
            http,
        })
    }

    fn image_for(&self, environment: &str) -> String {
        format!("{}:{}", self.config.image_base, environment)
    }

    fn workspace_for(&self, session_id: &str) -> PathBuf {
        self.config
            .data_root
            .join(WORKSPACE_DIR)
            .join(session_id)
    }

    /// Full `docker create` argv for a spec. Split out so the shape is
    /// testable without a docker daemon.
    fn create_args(&self, spec: &SandboxSpec, created_at: DateTime<Utc>) -> Vec<String> {
        let workspace = self.workspace_for(&spec.session_id);
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            format!("ottobot-{}", spec.session_id),
            "--label".into(),
            format!("{SESSION_LABEL}={}", spec.session_id),
            "--label".into(),
            format!("{CREATED_LABEL}={}", created_at.to_rfc3339()),
            "-e".into(),
            format!("SESSION_ID={}", spec.session_id),
            "-e".into(),
            format!("ENVIRONMENT={}", spec.environment),
            "-e".into(),
            format!("DESKTOP_PORT={}", spec.desktop_port),
            "-e".into(),
            format!("TOOL_PORT={}", spec.tool_port),
            "-p".into(),
            format!("{}:{DESKTOP_CONTAINER_PORT}", spec.desktop_port),
            "-p".into(),
            format!("{}:{TOOL_CONTAINER_PORT}", spec.tool_port),
            "-v".into(),
            format!("{}:/workspace", workspace.display()),
            "--memory".into(),
            self.config.memory_limit.clone(),
            "--cpu-shares".into(),
            self.config.cpu_shares.to_string(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--user".into(),
            "1000:1000".into(),
        ];
        if let Some(network) = &self.config.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        args.push(self.image_for(&spec.environment));
        args
    }

    async fn run_docker(&self, args: &[String]) -> SandboxResult<String> {
        let output = Command::new(&self.docker_path)
            .args(args)
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(SandboxError::CommandFailed {
                command: format!("docker {}", args.first().map(String::as_str).unwrap_or("")),
                message,
            })
        }
    }

    /// Idempotent variant: stop/remove of a container that is already gone
    /// or already stopped succeeds.
    async fn run_docker_idempotent(&self, args: &[String]) -> SandboxResult<()> {
        match self.run_docker(args).await {
            Ok(_) => Ok(()),
            Err(SandboxError::CommandFailed { message, .. }) if is_benign(&message) => {
                debug!(message, "docker reported already-done; treating as success");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_benign(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("no such container")
        || lowered.contains("is not running")
        || lowered.contains("already stopped")
        || lowered.contains("is already in progress")
}

#[async_trait]
impl Supervisor for DockerSupervisor {
    async fn create(&self, spec: &SandboxSpec) -> SandboxResult<SandboxDescriptor> {
        let workspace = self.workspace_for(&spec.session_id);
        tokio::fs::create_dir_all(&workspace).await?;

        let created_at = Utc::now();
        let args = self.create_args(spec, created_at);
        let sandbox_id = self.run_docker(&args).await?;
        info!(
            session_id = %spec.session_id,
            sandbox_id = %sandbox_id,
            desktop_port = spec.desktop_port,
            tool_port = spec.tool_port,
            "sandbox created"
        );
        Ok(SandboxDescriptor {
            sandbox_id,
            session_id: spec.session_id.clone(),
            desktop_port: spec.desktop_port,
            tool_port: spec.tool_port,
            created_at,
            memory_limit: self.config.memory_limit.clone(),
            cpu_shares: self.config.cpu_shares,
        })
    }

    async fn start(&self, sandbox_id: &str) -> SandboxResult<()> {
        self.run_docker_idempotent(&["start".to_string(), sandbox_id.to_string()])
            .await
    }

    async fn stop(&self, sandbox_id: &str, grace: Duration) -> SandboxResult<()> {
        self.run_docker_idempotent(&[
            "stop".to_string(),
            "--time".to_string(),
            grace.as_secs().max(1).to_string(),
            sandbox_id.to_string(),
        ])
        .await
    }

    async fn remove(&self, sandbox_id: &str) -> SandboxResult<()> {
        self.run_docker_idempotent(&[
            "rm".to_string(),
            "--force".to_string(),
            sandbox_id.to_string(),
        ])
        .await
    }

    async fn status(&self, sandbox_id: &str) -> SandboxResult<SandboxState> {
        let raw = self
            .run_docker(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Status}}".to_string(),
                sandbox_id.to_string(),
            ])
            .await;
        match raw {
            Ok(state) => Ok(match state.as_str() {
                "running" => SandboxState::Running,
                "exited" | "dead" => SandboxState::Exited,
                _ => SandboxState::Unknown,
            }),
            Err(SandboxError::CommandFailed { message, .. }) if is_benign(&message) => {
                Ok(SandboxState::Unknown)
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_desktop(
        &self,
        sandbox_id: &str,
        desktop_port: u16,
        max_wait: Duration,
    ) -> SandboxResult<()> {
        let url = format!(
            "http://{}:{desktop_port}/vnc.html",
            self.config.probe_host
        );
        let deadline = Instant::now() + max_wait;
        loop {
            // Any HTTP response at all proves the port proxy is up.
            match self.http.head(&url).send().await {
                Ok(response) => {
                    debug!(url, status = %response.status(), "desktop probe answered");
                    return Ok(());
                }
                Err(error) => {
                    debug!(url, %error, "desktop probe not ready");
                }
            }
            // A container that already exited will never answer; a failing
            // status check is inconclusive and does not end the wait.
            if let Ok(SandboxState::Exited) = self.status(sandbox_id).await {
                return Err(SandboxError::ExitedEarly(sandbox_id.to_string()));
            }
            if Instant::now() + PROBE_INTERVAL > deadline {
                return Err(SandboxError::ReadinessTimeout {
                    port: desktop_port,
                    waited_secs: max_wait.as_secs(),
                });
            }
            sleep(PROBE_INTERVAL).await;
        }
    }

    async fn reap_stale(&self, older_than: Duration) -> SandboxResult<usize> {
        let ids = self
            .run_docker(&[
                "ps".to_string(),
                "--all".to_string(),
                "--filter".to_string(),
                format!("label={SESSION_LABEL}"),
                "--format".to_string(),
                "{{.ID}}".to_string(),
            ])
            .await?;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::hours(2));
        let mut removed = 0;
        for id in ids.lines().filter(|line| !line.is_empty()) {
            let created = self
                .run_docker(&[
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{.Created}}".to_string(),
                    id.to_string(),
                ])
                .await;
            let Ok(created_raw) = created else {
                continue; // disappeared between ps and inspect
            };
            let Ok(created_at) = created_raw.parse::<DateTime<Utc>>() else {
                warn!(sandbox_id = id, raw = created_raw, "unparseable container creation time");
                continue;
            };
            if created_at < cutoff {
                if self.remove(id).await.is_ok() {
                    info!(sandbox_id = id, "reaped stale sandbox");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn available(&self) -> bool {
        self.run_docker(&["info".to_string(), "--format".to_string(), "{{.ID}}".to_string()])
            .await
            .is_ok()
    }
}
