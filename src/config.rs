//! Process-environment configuration, in the teacher's `config.rs` shape:
//! a `Settings` struct deserialized once via the `config` crate from
//! environment variables under a fixed prefix, cached behind a
//! `OnceLock`. Covers both the core's own knobs and the `SystemConfig`
//! surface spec.md §6 requires (docker timeout, git clone timeout, ssl
//! verify, proxy).

use serde::Deserialize;
use std::sync::OnceLock;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Absolute base directory under which per-task workspaces are created.
    #[serde(default = "default_workspace_base_dir")]
    pub workspace_base_dir: String,

    /// Absolute base directory under which per-dev-environment persistent
    /// session directories (`DevEnvironment::session_dir`) live in host mode.
    #[serde(default = "default_session_base_dir")]
    pub session_base_dir: String,

    /// Maximum number of conversations the ExecutionRegistry admits at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// How often the scheduler polls for pending conversations.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Container runtime binary (`docker`, or a compatible drop-in).
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,

    /// Overall container run timeout, minutes.
    #[serde(default = "default_container_timeout_minutes")]
    pub container_timeout_minutes: u64,

    /// Docker availability probe timeout, seconds.
    #[serde(default = "default_docker_probe_timeout_secs")]
    pub docker_probe_timeout_secs: u64,

    /// `git clone` timeout, seconds.
    #[serde(default = "default_git_clone_timeout_secs")]
    pub git_clone_timeout_secs: u64,

    /// `git commit`/`config`/`status`/`checkout` timeout, seconds.
    #[serde(default = "default_git_op_timeout_secs")]
    pub git_op_timeout_secs: u64,

    /// Quick `git status` timeout, seconds.
    #[serde(default = "default_git_quick_timeout_secs")]
    pub git_quick_timeout_secs: u64,

    /// `git push` timeout, seconds.
    #[serde(default = "default_git_push_timeout_secs")]
    pub git_push_timeout_secs: u64,

    /// Whether to verify TLS certificates on git/https operations.
    #[serde(default = "default_git_ssl_verify")]
    pub git_ssl_verify: bool,

    /// Outbound proxy configuration applied to git subprocesses.
    #[serde(default)]
    pub proxy_enabled: bool,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub https_proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: Option<String>,

    /// PostgreSQL connection URL for the reference repository implementation.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_database_pool_size")]
    pub database_pool_size: u32,

    /// Batch size (lines) and flush interval (ms) for BatchLogSink.
    #[serde(default = "default_log_batch_size")]
    pub log_batch_size: usize,
    #[serde(default = "default_log_flush_interval_millis")]
    pub log_flush_interval_millis: u64,
}

fn default_workspace_base_dir() -> String {
    "/var/lib/xsha/workspaces".into()
}
fn default_session_base_dir() -> String {
    "/var/lib/xsha/sessions".into()
}
fn default_max_concurrency() -> usize {
    5
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_container_runtime() -> String {
    "docker".into()
}
fn default_container_timeout_minutes() -> u64 {
    120
}
fn default_docker_probe_timeout_secs() -> u64 {
    10
}
fn default_git_clone_timeout_secs() -> u64 {
    300
}
fn default_git_op_timeout_secs() -> u64 {
    120
}
fn default_git_quick_timeout_secs() -> u64 {
    30
}
fn default_git_push_timeout_secs() -> u64 {
    600
}
fn default_git_ssl_verify() -> bool {
    true
}
fn default_database_pool_size() -> u32 {
    5
}
fn default_log_batch_size() -> usize {
    50
}
fn default_log_flush_interval_millis() -> u64 {
    1_000
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("XSHA"))
            .build()
            .expect("failed to build config")
            .try_deserialize()
            .expect("failed to deserialize config")
    })
}

impl Settings {
    pub fn container_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.container_timeout_minutes * 60)
    }

    pub fn git_clone_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.git_clone_timeout_secs)
    }
}
