use std::time::Duration;

use ottobot_session::PortRange;

/// Runtime configuration shared by the gateway and the worker. Built from
/// the `ottobotd` command line (every field has an environment binding
/// there); the defaults here keep tests and local runs short.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub api_host: String,
    pub api_port: u16,
    /// Host clients (and the readiness probe) use to reach published
    /// sandbox ports; distinct from the bind address, which is usually
    /// `0.0.0.0`.
    pub public_host: String,
    pub worker_concurrency: usize,
    pub max_sessions_per_worker: usize,
    pub session_timeout: Duration,
    pub desktop_ports: PortRange,
    pub tool_ports: PortRange,
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: "0.0.0.0".to_string(),
            api_port: crate::DEFAULT_API_PORT,
            public_host: "localhost".to_string(),
            worker_concurrency: 2,
            max_sessions_per_worker: 10,
            session_timeout: Duration::from_secs(3600),
            desktop_ports: PortRange::new(6080, 6200),
            tool_ports: PortRange::new(8080, 8200),
            cors_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn desktop_url(&self, desktop_port: u16) -> String {
        format!("http://{}:{}/vnc.html", self.public_host, desktop_port)
    }

    pub fn chat_url(&self, session_id: &str) -> String {
        format!(
            "ws://{}:{}/session/{}/chat",
            self.public_host, self.api_port, session_id
        )
    }

    pub fn tool_endpoint(&self, tool_port: u16) -> String {
        format!("http://{}:{}", self.public_host, tool_port)
    }

    pub fn download_url(&self, tool_port: u16) -> String {
        format!("{}/download", self.tool_endpoint(tool_port))
    }
}
