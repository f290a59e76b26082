//! Environment-driven service configuration.

use std::env;
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::api::ApiSettings;
use crate::engine::docker::DockerSettings;
use crate::lifecycle::LifecycleConfig;
use crate::relay::{OutputFilter, RelayConfig};
use crate::util::parse_flag;

pub const DEFAULT_IMAGE: &str = "javierhersan/code-ai";
pub const DEFAULT_API_PORT: u16 = 9090;
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 1800;
pub const DEFAULT_FRAME_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub bind_addr: String,
    pub api_port: u16,
    pub docker_host: Option<String>,
    /// Image used when a provision request names none.
    pub default_image: String,
    pub pull_images: bool,
    pub exec_timeout: Duration,
    pub stop_grace_secs: i64,
    pub shell: String,
    pub session_secret: Option<String>,
    pub session_ttl: Duration,
    pub relay_frame_bytes: usize,
    pub relay_dedup_output: bool,
    /// Allowed CORS origins; empty means any.
    pub cors_origins: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            api_port: DEFAULT_API_PORT,
            docker_host: None,
            default_image: DEFAULT_IMAGE.to_string(),
            pull_images: true,
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            stop_grace_secs: 10,
            shell: "/bin/sh".to_string(),
            session_secret: None,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            relay_frame_bytes: DEFAULT_FRAME_BYTES,
            relay_dedup_output: false,
            cors_origins: Vec::new(),
        }
    }
}

static RUNTIME_CONFIG: OnceCell<RuntimeConfig> = OnceCell::new();

impl RuntimeConfig {
    /// Load configuration from environment variables.
    /// Cached after the first call.
    pub fn load() -> &'static RuntimeConfig {
        RUNTIME_CONFIG.get_or_init(Self::from_env)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or unparsable values fall
    /// back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str| non_empty(key).and_then(|v| v.trim().parse::<u64>().ok());
        let flag = |key: &str| non_empty(key).and_then(|v| parse_flag(&v));

        let cors_origins = non_empty("DEVBOX_CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty() && *o != "*")
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bind_addr: non_empty("DEVBOX_BIND_ADDR").unwrap_or(defaults.bind_addr),
            api_port: non_empty("DEVBOX_API_PORT")
                .and_then(|v| v.trim().parse::<u16>().ok())
                .unwrap_or(defaults.api_port),
            docker_host: non_empty("DOCKER_HOST"),
            default_image: non_empty("DEVBOX_DEFAULT_IMAGE").unwrap_or(defaults.default_image),
            pull_images: flag("DEVBOX_PULL_IMAGES").unwrap_or(defaults.pull_images),
            exec_timeout: parsed("DEVBOX_EXEC_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.exec_timeout),
            stop_grace_secs: parsed("DEVBOX_STOP_GRACE_SECS")
                .map(|secs| secs.min(i64::MAX as u64) as i64)
                .unwrap_or(defaults.stop_grace_secs),
            shell: non_empty("DEVBOX_SHELL").unwrap_or(defaults.shell),
            session_secret: non_empty("DEVBOX_SESSION_SECRET"),
            session_ttl: parsed("DEVBOX_SESSION_TTL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_ttl),
            relay_frame_bytes: parsed("DEVBOX_RELAY_FRAME_BYTES")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.relay_frame_bytes),
            relay_dedup_output: flag("DEVBOX_RELAY_DEDUP_OUTPUT")
                .unwrap_or(defaults.relay_dedup_output),
            cors_origins,
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            pull_images: self.pull_images,
            exec_timeout: self.exec_timeout,
        }
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            max_frame_bytes: self.relay_frame_bytes,
            output_filter: if self.relay_dedup_output {
                OutputFilter::SuppressAdjacentDuplicates
            } else {
                OutputFilter::PassThrough
            },
        }
    }

    pub fn docker(&self) -> DockerSettings {
        DockerSettings {
            shell: self.shell.clone(),
            stop_grace_secs: self.stop_grace_secs,
        }
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            default_image: self.default_image.clone(),
            shell: self.shell.clone(),
            relay: self.relay(),
            cors_origins: self.cors_origins.clone(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.api_port)
    }
}
