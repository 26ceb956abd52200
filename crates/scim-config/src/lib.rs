use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    #[serde(default)]
    pub service: Service,
    pub store: Store,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub dialogs: Dialogs,
    #[serde(default)]
    pub transport: Transport,
    pub decision_log: DecisionLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// To-user that marks a MESSAGE as a control message for this service.
    #[serde(default = "default_control_user")]
    pub control_user: String,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            control_user: default_control_user(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default)]
    pub snapshot_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default = "default_reject_status")]
    pub reject_status: u16,
    #[serde(default = "default_reject_reason")]
    pub reject_reason: String,
    #[serde(default = "default_reserved_hosts")]
    pub reserved_hosts: Vec<String>,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            reject_status: default_reject_status(),
            reject_reason: default_reject_reason(),
            reserved_hosts: default_reserved_hosts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialogs {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for Dialogs {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transport {
    #[serde(default)]
    pub egress_url: Option<String>,
    #[serde(default = "default_transport_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            egress_url: None,
            timeout_ms: default_transport_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLog {
    pub jsonl_path: String,
}

fn default_control_user() -> String {
    "scim".to_string()
}

fn default_reject_status() -> u16 {
    403
}

fn default_reject_reason() -> String {
    "Forbidden".to_string()
}

fn default_reserved_hosts() -> Vec<String> {
    vec!["anonymous.invalid".to_string()]
}

fn default_idle_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    60 * 1000
}

fn default_transport_timeout_ms() -> u64 {
    2_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    let blank = |v: &Option<String>| v.as_ref().map(|s| s.trim().is_empty()).unwrap_or(true);
    match cfg.store.kind.as_str() {
        "memory" => {
            if cfg.store.sqlite_path.is_some() || cfg.store.snapshot_dir.is_some() {
                return Err(ConfigError::UnsupportedConfig(
                    "store.sqlite_path and store.snapshot_dir are not supported when store.type=memory"
                        .to_string(),
                ));
            }
        }
        "file" => {
            if blank(&cfg.store.snapshot_dir) {
                return Err(ConfigError::UnsupportedConfig(
                    "store.snapshot_dir is required when store.type=file".to_string(),
                ));
            }
        }
        "sqlite" => {
            if blank(&cfg.store.sqlite_path) {
                return Err(ConfigError::UnsupportedConfig(
                    "store.sqlite_path is required when store.type=sqlite".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "store.type={other} is not implemented; supported: memory, file, sqlite"
            )));
        }
    }
    if !(400..=699).contains(&cfg.routing.reject_status) {
        return Err(ConfigError::UnsupportedConfig(
            "routing.reject_status must be a failure status (400-699)".to_string(),
        ));
    }
    if cfg.service.control_user.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "service.control_user must not be empty".to_string(),
        ));
    }
    if cfg.dialogs.idle_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "dialogs.idle_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.dialogs.sweep_interval_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "dialogs.sweep_interval_ms must be >= 1".to_string(),
        ));
    }
    if cfg.transport.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "transport.timeout_ms must be >= 1".to_string(),
        ));
    }
    Ok(())
}
