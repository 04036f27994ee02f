//! Supervisor configuration loading.
//!
//! TOML is the sole config source.  Default config path:
//! `/etc/kahi/kahid.toml`.
//!
//! # Required fields
//! - A `[supervisor]` block
//! - At least one of `[server.unix]` (with `path`) or `[server.tcp]`
//!   (with `bind`)
//!
//! Program `command`, `args`, and `env` values support `${NAME}`
//! environment expansion.  `[[webhook]]` destinations are checked
//! against the URL policy at load time so a bad destination never
//! reaches a running daemon.

use kahi_events::EventType;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/kahi/kahid.toml";

const DEFAULT_SOCKET_MODE: u32 = 0o600;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct KahiConfig {
    pub supervisor: SupervisorConfig,
    pub server: ServerConfig,
    #[serde(rename = "program")]
    pub programs: BTreeMap<String, ProgramConfig>,
    #[serde(rename = "eventlistener")]
    pub event_listeners: BTreeMap<String, EventListenerConfig>,
    #[serde(rename = "webhook")]
    pub webhooks: Vec<WebhookConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub unix: Option<UnixServerConfig>,
    pub tcp: Option<TcpServerConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnixServerConfig {
    pub path: PathBuf,
    /// Filesystem permission bits applied to the bound socket.
    pub mode: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TcpServerConfig {
    pub bind: String,
    pub username: Option<String>,
    /// bcrypt hash (`$2` prefix) or, for test setups only, a plaintext
    /// password.
    #[serde(serialize_with = "redact")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Group name; defaults to the program name.
    pub group: Option<String>,
    pub autostart: bool,
    /// Whether the child gets a writable stdin pipe.
    pub stdin: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventListenerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub events: Vec<EventType>,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookConfig {
    pub url: String,
    pub events: Vec<EventType>,
    pub allow_insecure: bool,
}

impl KahiConfig {
    /// The effective configuration as JSON with secrets redacted, for
    /// `GET /api/v1/config`.
    pub fn to_sanitized_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

fn redact<S: Serializer>(password: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match password {
        Some(_) => serializer.serialize_some("<redacted>"),
        None => serializer.serialize_none(),
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    supervisor: Option<RawSupervisorConfig>,
    server: Option<RawServerConfig>,
    program: Option<BTreeMap<String, RawProgramConfig>>,
    eventlistener: Option<BTreeMap<String, RawEventListenerConfig>>,
    webhook: Option<Vec<RawWebhookConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawSupervisorConfig {
    log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    unix: Option<RawUnixServerConfig>,
    tcp: Option<RawTcpServerConfig>,
}

#[derive(Debug, Deserialize)]
struct RawUnixServerConfig {
    path: Option<PathBuf>,
    mode: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawTcpServerConfig {
    bind: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProgramConfig {
    command: Option<String>,
    args: Option<Vec<String>>,
    env: Option<BTreeMap<String, String>>,
    cwd: Option<PathBuf>,
    group: Option<String>,
    autostart: Option<bool>,
    stdin: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawEventListenerConfig {
    command: Option<String>,
    args: Option<Vec<String>>,
    events: Option<Vec<String>>,
    pool_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawWebhookConfig {
    url: Option<String>,
    events: Option<Vec<String>>,
    allow_insecure: Option<bool>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error("webhook url '{url}': {reason}")]
    Webhook { url: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    #[error("unclosed ${{}} in {0}")]
    Unclosed(String),
    #[error("undefined environment variable: {0}")]
    Undefined(String),
}

// ---------------------------------------------------------------------------
// Environment expansion
// ---------------------------------------------------------------------------

/// Expand `${NAME}` references against the process environment.
pub fn expand_env(input: &str) -> Result<String, ExpandError> {
    expand_with(input, |name| std::env::var(name).ok())
}

/// Expansion against an arbitrary lookup, for callers and tests that
/// should not depend on the global environment.
pub fn expand_with(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ExpandError> {
    let mut expanded = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            return Err(ExpandError::Unclosed(input.to_owned()));
        };
        let name = &tail[..end];
        match lookup(name) {
            Some(value) => expanded.push_str(&value),
            None => return Err(ExpandError::Undefined(name.to_owned())),
        }
        rest = &tail[end + 1..];
    }
    expanded.push_str(rest);
    Ok(expanded)
}

// ---------------------------------------------------------------------------
// Webhook URL policy
// ---------------------------------------------------------------------------

/// Plain HTTP is allowed only toward the local host (or with an explicit
/// `allow_insecure` opt-in); everything else must be HTTPS.
pub fn validate_webhook_url(raw: &str, allow_insecure: bool) -> Result<(), ConfigError> {
    let webhook_error = |reason: &str| ConfigError::Webhook {
        url: raw.to_owned(),
        reason: reason.to_owned(),
    };
    let parsed = Url::parse(raw).map_err(|e| webhook_error(&e.to_string()))?;
    let Some(host) = parsed.host_str() else {
        return Err(webhook_error("missing host"));
    };
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let local = matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]");
            if local || allow_insecure {
                Ok(())
            } else {
                Err(webhook_error(
                    "plain HTTP is only allowed for localhost destinations",
                ))
            }
        }
        other => Err(webhook_error(&format!("unsupported scheme '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load supervisor config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<KahiConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_config_from_str(&toml_str)
}

/// Load supervisor config from the default path.
pub fn load_config() -> Result<KahiConfig, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

/// Load supervisor config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<KahiConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // [supervisor] is required even though every field in it defaults.
    let raw_supervisor = raw
        .supervisor
        .ok_or_else(|| ConfigError::MissingField("supervisor".to_owned()))?;
    let supervisor = SupervisorConfig {
        log_level: raw_supervisor.log_level.unwrap_or_else(|| "info".to_owned()),
    };

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let unix = match raw_server.unix {
        Some(u) => Some(UnixServerConfig {
            path: u
                .path
                .ok_or_else(|| ConfigError::MissingField("server.unix.path".to_owned()))?,
            mode: u.mode.unwrap_or(DEFAULT_SOCKET_MODE),
        }),
        None => None,
    };
    let tcp = match raw_server.tcp {
        Some(t) => {
            let bind = t
                .bind
                .ok_or_else(|| ConfigError::MissingField("server.tcp.bind".to_owned()))?;
            if t.username.is_some() && t.password.is_none() {
                return Err(ConfigError::MissingField("server.tcp.password".to_owned()));
            }
            Some(TcpServerConfig {
                bind,
                username: t.username,
                password: t.password,
            })
        }
        None => None,
    };
    if unix.is_none() && tcp.is_none() {
        return Err(ConfigError::InvalidValue(
            "at least one of [server.unix] or [server.tcp] is required".to_owned(),
        ));
    }
    let server = ServerConfig { unix, tcp };

    let mut programs = BTreeMap::new();
    for (name, p) in raw.program.unwrap_or_default() {
        let command = p
            .command
            .ok_or_else(|| ConfigError::MissingField(format!("program.{name}.command")))?;
        let mut args = Vec::new();
        for arg in p.args.unwrap_or_default() {
            args.push(expand_env(&arg)?);
        }
        let mut env = BTreeMap::new();
        for (key, value) in p.env.unwrap_or_default() {
            env.insert(key, expand_env(&value)?);
        }
        programs.insert(
            name,
            ProgramConfig {
                command: expand_env(&command)?,
                args,
                env,
                cwd: p.cwd,
                group: p.group,
                autostart: p.autostart.unwrap_or(true),
                stdin: p.stdin.unwrap_or(false),
            },
        );
    }

    let mut event_listeners = BTreeMap::new();
    for (name, l) in raw.eventlistener.unwrap_or_default() {
        let command = l
            .command
            .ok_or_else(|| ConfigError::MissingField(format!("eventlistener.{name}.command")))?;
        let raw_events = l
            .events
            .ok_or_else(|| ConfigError::MissingField(format!("eventlistener.{name}.events")))?;
        if raw_events.is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "eventlistener.{name}.events must not be empty"
            )));
        }
        event_listeners.insert(
            name,
            EventListenerConfig {
                command: expand_env(&command)?,
                args: l.args.unwrap_or_default(),
                events: parse_event_types(&raw_events)?,
                pool_size: l.pool_size.unwrap_or(1).max(1),
            },
        );
    }

    let mut webhooks = Vec::new();
    for (index, w) in raw.webhook.unwrap_or_default().into_iter().enumerate() {
        let url = w
            .url
            .ok_or_else(|| ConfigError::MissingField(format!("webhook[{index}].url")))?;
        let allow_insecure = w.allow_insecure.unwrap_or(false);
        validate_webhook_url(&url, allow_insecure)?;
        webhooks.push(WebhookConfig {
            url,
            events: parse_event_types(&w.events.unwrap_or_default())?,
            allow_insecure,
        });
    }

    Ok(KahiConfig {
        supervisor,
        server,
        programs,
        event_listeners,
        webhooks,
    })
}

fn parse_event_types(tags: &[String]) -> Result<Vec<EventType>, ConfigError> {
    tags.iter()
        .map(|tag| {
            tag.parse::<EventType>()
                .map_err(|e| ConfigError::InvalidValue(e.to_string()))
        })
        .collect()
}
