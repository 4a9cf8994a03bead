use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [sessions]
//                    buffer_bytes = 1048576
//
//   env var:         HUB_SESSIONS__BUFFER_BYTES=1048576   (double underscore = nesting)

/// What attaching to a non-live session does.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachPolicy {
    /// Start the stored command again before attaching.
    #[default]
    EnsureRunning,
    /// Attach to the scrollback and exit info only.
    ReadOnly,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub sessions: SessionFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Identity tokens (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// Session tunables (lives under `[sessions]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_buffer_bytes")]
    pub buffer_bytes: usize,
    #[serde(default = "default_idle_after_ms")]
    pub idle_after_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,
    #[serde(default)]
    pub attach_policy: AttachPolicy,
    #[serde(default = "default_command")]
    pub default_command: String,
    #[serde(default)]
    pub default_cwd: Option<String>,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: default_buffer_bytes(),
            idle_after_ms: default_idle_after_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            client_queue_capacity: default_client_queue_capacity(),
            attach_policy: AttachPolicy::default(),
            default_command: default_command(),
            default_cwd: None,
            default_cols: default_cols(),
            default_rows: default_rows(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7878
}
fn default_buffer_bytes() -> usize {
    256 * 1024
}
fn default_idle_after_ms() -> u64 {
    3000
}
fn default_stop_grace_ms() -> u64 {
    5000
}
fn default_client_queue_capacity() -> usize {
    256
}
fn default_command() -> String {
    "claude".to_string()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}

/// Build a figment that layers: defaults → config.toml → HUB_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `HUB_AUTH__ENABLED=true`  →  `auth.enabled = true`
///   `HUB_SESSIONS__STOP_GRACE_MS=2000`  →  `sessions.stop_grace_ms = 2000`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("HUB_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Identity configuration (runtime view).
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub enabled: bool,
    pub tokens: Vec<String>,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Result<Self> {
        if fc.enabled && fc.tokens.iter().all(|t| t.trim().is_empty()) {
            bail!("auth.enabled is set but auth.tokens is empty");
        }
        Ok(Self {
            enabled: fc.enabled,
            tokens: fc
                .tokens
                .iter()
                .filter(|t| !t.trim().is_empty())
                .cloned()
                .collect(),
        })
    }
}

/// Session behavior shared by the registry and every session actor.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Scrollback kept per session in bytes
    pub buffer_bytes: usize,
    /// Quiet period after which a running session reports idle
    pub idle_after: Duration,
    /// How long a graceful stop waits before killing outright
    pub stop_grace: Duration,
    /// Outbound events buffered per attached client; a full queue evicts it
    pub client_queue_capacity: usize,
    pub attach_policy: AttachPolicy,
    pub default_command: String,
    pub default_cwd: String,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl SessionConfig {
    pub fn from_file(fc: &SessionFileConfig) -> Result<Self> {
        if fc.client_queue_capacity == 0 {
            bail!("sessions.client_queue_capacity must be greater than zero");
        }
        if fc.idle_after_ms == 0 {
            bail!("sessions.idle_after_ms must be greater than zero");
        }
        if fc.stop_grace_ms == 0 {
            bail!("sessions.stop_grace_ms must be greater than zero");
        }
        if fc.buffer_bytes == 0 {
            bail!("sessions.buffer_bytes must be greater than zero");
        }
        if fc.default_cols == 0 || fc.default_rows == 0 {
            bail!("sessions.default_cols and sessions.default_rows must be greater than zero");
        }
        if fc.default_command.trim().is_empty() {
            bail!("sessions.default_command must not be empty");
        }

        let default_cwd = match fc.default_cwd.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(dir) => dir.to_string(),
            None => std::env::current_dir()
                .context("Failed to determine current directory")?
                .to_string_lossy()
                .to_string(),
        };

        Ok(Self {
            buffer_bytes: fc.buffer_bytes,
            idle_after: Duration::from_millis(fc.idle_after_ms),
            stop_grace: Duration::from_millis(fc.stop_grace_ms),
            client_queue_capacity: fc.client_queue_capacity,
            attach_policy: fc.attach_policy,
            default_command: fc.default_command.clone(),
            default_cwd,
            default_cols: fc.default_cols,
            default_rows: fc.default_rows,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            buffer_bytes: 1024,
            idle_after: Duration::from_secs(3600),
            stop_grace: Duration::from_secs(5),
            client_queue_capacity: 64,
            attach_policy: AttachPolicy::EnsureRunning,
            default_command: "agent".to_string(),
            default_cwd: "/tmp".to_string(),
            default_cols: 80,
            default_rows: 24,
        }
    }
}

// =============================================================================
// Directory layout (derived from --data-dir / --config)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
}

impl HubConfig {
    pub fn new(custom_dir: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".agent-hub"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let config_path = config_path.unwrap_or_else(|| data_dir.join("config.toml"));

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            config_path,
        })
    }

    pub fn load(&self) -> Result<FileConfig> {
        load_config(&self.config_path)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", self.config_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_session_file_config_defaults() {
        let d = SessionFileConfig::default();
        assert_eq!(d.buffer_bytes, 256 * 1024);
        assert_eq!(d.idle_after_ms, 3000);
        assert_eq!(d.stop_grace_ms, 5000);
        assert_eq!(d.client_queue_capacity, 256);
        assert_eq!(d.attach_policy, AttachPolicy::EnsureRunning);
        assert_eq!(d.default_command, "claude");
        assert!(d.default_cwd.is_none());
    }

    #[test]
    fn test_server_file_config_defaults() {
        let d = ServerFileConfig::default();
        assert_eq!(d.host, "127.0.0.1");
        assert_eq!(d.port, 7878);
    }

    // ── SessionConfig::from_file ────────────────────────────────────────

    #[test]
    fn test_session_config_from_file() {
        let fc = SessionFileConfig {
            idle_after_ms: 250,
            stop_grace_ms: 1500,
            default_cwd: Some("/srv".into()),
            ..Default::default()
        };
        let sc = SessionConfig::from_file(&fc).unwrap();
        assert_eq!(sc.idle_after, Duration::from_millis(250));
        assert_eq!(sc.stop_grace, Duration::from_millis(1500));
        assert_eq!(sc.default_cwd, "/srv");
    }

    #[test]
    fn test_session_config_defaults_cwd_to_process_cwd() {
        let sc = SessionConfig::from_file(&SessionFileConfig::default()).unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(sc.default_cwd, cwd.to_string_lossy());
    }

    #[test]
    fn test_session_config_rejects_zero_capacities() {
        for fc in [
            SessionFileConfig {
                client_queue_capacity: 0,
                ..Default::default()
            },
            SessionFileConfig {
                buffer_bytes: 0,
                ..Default::default()
            },
            SessionFileConfig {
                default_cols: 0,
                ..Default::default()
            },
        ] {
            assert!(SessionConfig::from_file(&fc).is_err());
        }
    }

    #[test]
    fn test_session_config_rejects_zero_durations() {
        let err = SessionConfig::from_file(&SessionFileConfig {
            idle_after_ms: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("idle_after_ms"));

        let err = SessionConfig::from_file(&SessionFileConfig {
            stop_grace_ms: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("stop_grace_ms"));
    }

    #[test]
    fn test_zero_grace_in_toml_is_rejected_at_startup() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[sessions]\nstop_grace_ms = 0\n").unwrap();
        let fc: FileConfig = load_config(&path).extract().unwrap();
        assert_eq!(fc.sessions.stop_grace_ms, 0);
        assert!(SessionConfig::from_file(&fc.sessions).is_err());
    }

    // ── AuthConfig::from_file ───────────────────────────────────────────

    #[test]
    fn test_auth_enabled_requires_tokens() {
        let fc = AuthFileConfig {
            enabled: true,
            tokens: vec!["  ".into()],
        };
        assert!(AuthConfig::from_file(&fc).is_err());

        let fc = AuthFileConfig {
            enabled: true,
            tokens: vec!["secret".into(), "".into()],
        };
        let ac = AuthConfig::from_file(&fc).unwrap();
        assert_eq!(ac.tokens, vec!["secret".to_string()]);
    }

    // ── HubConfig / load_config ─────────────────────────────────────────

    #[test]
    fn test_hub_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("hub");
        let config = HubConfig::new(Some(dir.clone()), None).unwrap();
        assert!(dir.exists());
        assert_eq!(config.config_path, dir.join("config.toml"));
    }

    #[test]
    fn test_load_config_defaults_without_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(&tmp.path().join("config.toml"))
            .extract()
            .unwrap();
        assert!(!fc.auth.enabled);
        assert_eq!(fc.server.port, 7878);
        assert_eq!(fc.sessions.default_cols, 80);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9100\n\n[auth]\nenabled = true\ntokens = [\"t1\"]\n\n\
             [sessions]\nbuffer_bytes = 4096\nattach_policy = \"read_only\"\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(&path).extract().unwrap();
        assert_eq!(fc.server.port, 9100);
        assert!(fc.auth.enabled);
        assert_eq!(fc.auth.tokens, vec!["t1".to_string()]);
        assert_eq!(fc.sessions.buffer_bytes, 4096);
        assert_eq!(fc.sessions.attach_policy, AttachPolicy::ReadOnly);
        assert_eq!(fc.sessions.stop_grace_ms, 5000);
    }

    #[test]
    fn test_hub_config_load_reports_bad_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("custom.toml");
        std::fs::write(&path, "[sessions]\nbuffer_bytes = \"lots\"\n").unwrap();
        let config = HubConfig::new(Some(tmp.path().to_path_buf()), Some(path)).unwrap();
        assert!(config.load().is_err());
    }
}
