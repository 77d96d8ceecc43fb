use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Environment variable holding the session secret handed to the backend
pub const SESSION_SECRET_ENV: &str = "SESSION_SECRET";

/// Fallback session secret when the environment does not provide one
pub const DEFAULT_SESSION_SECRET: &str = "change-me";

/// Loopback address the backend is always bound to
pub const BACKEND_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Top-level configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// External listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Supervised backend settings
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listening port (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Upper bound on a single upstream exchange in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle keep-alive connections to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
        }
    }
}

/// Configuration for the supervised backend process
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// gateway. Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Program to execute. A value containing spaces is split with shell
    /// quoting rules and the remaining words are prepended to `args`.
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments; `{addr}`, `{host}`, `{port}` and `{root}` are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Document root served by the backend
    #[serde(default = "default_root")]
    pub root: String,

    /// Port the backend listens on (always on 127.0.0.1)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Extra environment variables for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Command-line fragment identifying stale instances from earlier runs.
    /// Defaults to the rendered launch command.
    pub stale_pattern: Option<String>,

    /// Delay after stale cleanup so the OS can reclaim the port
    #[serde(default = "default_cleanup_settle")]
    pub cleanup_settle_ms: u64,

    /// Delay after spawning before checking for an immediate exit
    #[serde(default = "default_spawn_check")]
    pub spawn_check_ms: u64,

    /// How long to wait for the backend to answer at all
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Pause between readiness probes
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Timeout of a single readiness probe
    #[serde(default = "default_ready_probe_timeout")]
    pub ready_probe_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on shutdown
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Number of stderr lines kept for spawn diagnostics
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            root: default_root(),
            port: default_backend_port(),
            env: HashMap::new(),
            stale_pattern: None,
            cleanup_settle_ms: default_cleanup_settle(),
            spawn_check_ms: default_spawn_check(),
            ready_timeout_secs: default_ready_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            ready_probe_timeout_secs: default_ready_probe_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

impl BackendConfig {
    /// Create a backend config for an arbitrary command (builder pattern)
    pub fn new(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            port,
            ..Self::default()
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the document root (builder pattern)
    pub fn with_root(mut self, root: &str) -> Self {
        self.root = root.to_string();
        self
    }

    /// Socket address the backend is expected to listen on
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(BACKEND_HOST), self.port)
    }

    /// Base URL for upstream requests, without trailing slash
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr())
    }

    /// Resolve program and arguments with placeholders substituted
    pub fn command_line(&self) -> anyhow::Result<(String, Vec<String>)> {
        let mut words = shell_words::split(&self.command)
            .map_err(|e| anyhow::anyhow!("Invalid backend command '{}': {}", self.command, e))?;
        if words.is_empty() {
            anyhow::bail!("Backend command is empty");
        }
        let program = words.remove(0);
        let args = words
            .iter()
            .chain(self.args.iter())
            .map(|arg| self.render(arg))
            .collect();
        Ok((program, args))
    }

    fn render(&self, template: &str) -> String {
        template
            .replace("{addr}", &self.addr().to_string())
            .replace("{host}", &BACKEND_HOST.to_string())
            .replace("{port}", &self.port.to_string())
            .replace("{root}", &self.root)
    }

    /// Argument sequence identifying leftovers of previous runs.
    ///
    /// An explicit pattern is split like a shell command line. Matching is
    /// done on whole arguments, so `127.0.0.1:9001` never matches
    /// `127.0.0.1:90010`.
    pub fn stale_pattern(&self) -> anyhow::Result<Vec<String>> {
        if let Some(ref pattern) = self.stale_pattern {
            return shell_words::split(pattern)
                .map_err(|e| anyhow::anyhow!("Invalid stale pattern '{}': {}", pattern, e));
        }
        let (program, args) = self.command_line()?;
        Ok(std::iter::once(program).chain(args).collect())
    }

    pub fn cleanup_settle(&self) -> Duration {
        Duration::from_millis(self.cleanup_settle_ms)
    }

    pub fn spawn_check(&self) -> Duration {
        Duration::from_millis(self.spawn_check_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn ready_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_probe_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_command() -> String {
    "php".to_string()
}

fn default_args() -> Vec<String> {
    vec![
        "-S".to_string(),
        "{addr}".to_string(),
        "-t".to_string(),
        "{root}".to_string(),
    ]
}

fn default_root() -> String {
    ".".to_string()
}

fn default_backend_port() -> u16 {
    9001
}

fn default_cleanup_settle() -> u64 {
    1000
}

fn default_spawn_check() -> u64 {
    500
}

fn default_ready_timeout() -> u64 {
    20
}

fn default_ready_poll_interval() -> u64 {
    1000
}

fn default_ready_probe_timeout() -> u64 {
    2
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_log_tail_lines() -> usize {
    50
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise from `default_path` if it
    /// exists, otherwise fall back to built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(
        path: Option<P>,
        default_path: &Path,
    ) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if default_path.exists() => Self::load(default_path),
            None => Ok(Self::default()),
        }
    }

    /// Session secret from the environment, with the fallback flagged
    pub fn session_secret() -> (String, bool) {
        match std::env::var(SESSION_SECRET_ENV) {
            Ok(secret) if !secret.is_empty() => (secret, true),
            _ => (DEFAULT_SESSION_SECRET.to_string(), false),
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.listen_addr() {
            errors.push(e.to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("'server.request_timeout_secs' must be greater than 0".to_string());
        }

        let backend = &self.backend;
        if let Err(e) = backend.command_line() {
            errors.push(e.to_string());
        }
        if backend.port == 0 {
            errors.push("'backend.port' must be greater than 0".to_string());
        }
        if backend.ready_timeout_secs == 0 {
            errors.push("'backend.ready_timeout_secs' must be greater than 0".to_string());
        }
        if backend.ready_poll_interval_ms == 0 {
            errors.push("'backend.ready_poll_interval_ms' must be greater than 0".to_string());
        }
        if backend.ready_probe_timeout_secs == 0 {
            errors.push("'backend.ready_probe_timeout_secs' must be greater than 0".to_string());
        }
        if backend.stale_pattern.is_some() {
            if let Err(e) = backend.stale_pattern() {
                errors.push(e.to_string());
            }
        }
        if backend.port == self.server.port {
            let overlaps = self
                .server
                .listen_addr()
                .map(|addr| addr.ip().is_unspecified() || addr.ip().is_loopback())
                .unwrap_or(false);
            if overlaps {
                errors.push(format!(
                    "'backend.port' {} collides with the listening port",
                    backend.port
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
