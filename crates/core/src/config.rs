//! Layered runtime configuration.
//!
//! Values resolve in order: built-in defaults, the TOML file, `TOLLGATE_*`
//! environment variables, then programmatic [`ConfigOverrides`]. File keys
//! and environment variables go through the same [`SETTINGS`] table, so a
//! setting parses the same way wherever it comes from.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::request::RejectionPolicy;
use crate::progression::ProgressionConfig;

const DEFAULT_CONFIG_FILES: [&str; 2] = ["tollgate.toml", "config/tollgate.toml"];
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub rejection_policy: RejectionPolicy,
    pub system_actor: String,
    pub sweep_batch_size: u32,
}

impl WorkflowConfig {
    pub fn progression(&self) -> ProgressionConfig {
        ProgressionConfig {
            rejection_policy: self.rejection_policy,
            system_actor: self.system_actor.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [Self::Compact, Self::Pretty, Self::Json]
            .into_iter()
            .find(|format| value.trim().eq_ignore_ascii_case(format.as_str()))
            .ok_or_else(|| "expected compact|pretty|json".to_string())
    }
}

/// Programmatic overrides; they beat every other layer.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub port: Option<u16>,
    pub rejection_policy: Option<RejectionPolicy>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("invalid value for `{key}` in `{path}`: {reason}")]
    InvalidFileValue { path: PathBuf, key: &'static str, reason: String },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// One tunable key: where it comes from and how it lands in [`AppConfig`].
pub struct Setting {
    /// Dotted `section.field` path used in the TOML file.
    pub key: &'static str,
    /// Environment variables checked in order; the first non-empty one wins.
    pub env_vars: &'static [&'static str],
    assign: fn(&mut AppConfig, &str) -> Result<(), String>,
    render: fn(&AppConfig) -> String,
}

impl Setting {
    pub fn current_value(&self, config: &AppConfig) -> String {
        (self.render)(config)
    }
}

pub const SETTINGS: &[Setting] = &[
    Setting {
        key: "database.url",
        env_vars: &["TOLLGATE_DATABASE_URL"],
        assign: |config, raw| {
            config.database.url = raw.to_string();
            Ok(())
        },
        render: |config| config.database.url.clone(),
    },
    Setting {
        key: "database.max_connections",
        env_vars: &["TOLLGATE_DATABASE_MAX_CONNECTIONS"],
        assign: |config, raw| parse_into(raw, &mut config.database.max_connections),
        render: |config| config.database.max_connections.to_string(),
    },
    Setting {
        key: "database.timeout_secs",
        env_vars: &["TOLLGATE_DATABASE_TIMEOUT_SECS"],
        assign: |config, raw| parse_into(raw, &mut config.database.timeout_secs),
        render: |config| config.database.timeout_secs.to_string(),
    },
    Setting {
        key: "server.bind_address",
        env_vars: &["TOLLGATE_SERVER_BIND_ADDRESS"],
        assign: |config, raw| {
            config.server.bind_address = raw.to_string();
            Ok(())
        },
        render: |config| config.server.bind_address.clone(),
    },
    Setting {
        key: "server.port",
        env_vars: &["TOLLGATE_SERVER_PORT"],
        assign: |config, raw| parse_into(raw, &mut config.server.port),
        render: |config| config.server.port.to_string(),
    },
    Setting {
        key: "server.graceful_shutdown_secs",
        env_vars: &["TOLLGATE_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        assign: |config, raw| parse_into(raw, &mut config.server.graceful_shutdown_secs),
        render: |config| config.server.graceful_shutdown_secs.to_string(),
    },
    Setting {
        key: "logging.level",
        env_vars: &["TOLLGATE_LOGGING_LEVEL", "TOLLGATE_LOG_LEVEL"],
        assign: |config, raw| {
            config.logging.level = raw.to_string();
            Ok(())
        },
        render: |config| config.logging.level.clone(),
    },
    Setting {
        key: "logging.format",
        env_vars: &["TOLLGATE_LOGGING_FORMAT", "TOLLGATE_LOG_FORMAT"],
        assign: |config, raw| parse_into(raw, &mut config.logging.format),
        render: |config| config.logging.format.as_str().to_string(),
    },
    Setting {
        key: "workflow.rejection_policy",
        env_vars: &["TOLLGATE_WORKFLOW_REJECTION_POLICY"],
        assign: |config, raw| {
            config.workflow.rejection_policy = RejectionPolicy::parse(raw)
                .ok_or_else(|| "expected veto|quorum".to_string())?;
            Ok(())
        },
        render: |config| config.workflow.rejection_policy.as_str().to_string(),
    },
    Setting {
        key: "workflow.system_actor",
        env_vars: &["TOLLGATE_WORKFLOW_SYSTEM_ACTOR"],
        assign: |config, raw| {
            config.workflow.system_actor = raw.to_string();
            Ok(())
        },
        render: |config| config.workflow.system_actor.clone(),
    },
    Setting {
        key: "workflow.sweep_batch_size",
        env_vars: &["TOLLGATE_WORKFLOW_SWEEP_BATCH_SIZE"],
        assign: |config, raw| parse_into(raw, &mut config.workflow.sweep_batch_size),
        render: |config| config.workflow.sweep_batch_size.to_string(),
    },
];

fn parse_into<T>(raw: &str, slot: &mut T) -> Result<(), String>
where
    T: FromStr,
    T::Err: ToString,
{
    *slot = raw.trim().parse::<T>().map_err(|error| error.to_string())?;
    Ok(())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://tollgate.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            workflow: WorkflowConfig {
                rejection_policy: RejectionPolicy::Veto,
                system_actor: "system".to_string(),
                sweep_batch_size: 500,
            },
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        match find_config_file(options.config_path.as_deref()) {
            Some(path) => config.merge_file(&path)?,
            None if options.require_file => {
                let expected = options
                    .config_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILES[0]));
                return Err(ConfigError::MissingConfigFile(expected));
            }
            None => {}
        }

        config.merge_env()?;
        config.merge_overrides(options.overrides);
        config.validate()?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
        let document = toml::from_str::<toml::Table>(&expand_env_refs(&raw)?)
            .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })?;

        for setting in SETTINGS {
            let Some(value) = lookup(&document, setting.key) else {
                continue;
            };
            let invalid = |reason: String| ConfigError::InvalidFileValue {
                path: path.to_path_buf(),
                key: setting.key,
                reason,
            };
            let text = scalar_text(value).ok_or_else(|| invalid("expected a scalar".to_string()))?;
            (setting.assign)(self, &text).map_err(invalid)?;
        }
        Ok(())
    }

    fn merge_env(&mut self) -> Result<(), ConfigError> {
        for setting in SETTINGS {
            let found = setting.env_vars.iter().find_map(|var| {
                let value = env::var(var).ok().filter(|value| !value.trim().is_empty())?;
                Some((*var, value))
            });
            if let Some((var, value)) = found {
                (setting.assign)(self, &value).map_err(|_| ConfigError::InvalidEnvOverride {
                    key: var.to_string(),
                    value,
                })?;
            }
        }
        Ok(())
    }

    fn merge_overrides(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides { database_url, log_level, port, rejection_policy } = overrides;
        if let Some(url) = database_url {
            self.database.url = url;
        }
        if let Some(level) = log_level {
            self.logging.level = level;
        }
        self.server.port = port.unwrap_or(self.server.port);
        self.workflow.rejection_policy = rejection_policy.unwrap_or(self.workflow.rejection_policy);
    }

    /// Reports every problem at once, separated by `; `.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.database.url.trim();
        let level = self.logging.level.trim().to_ascii_lowercase();
        let rules = [
            (
                url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:",
                "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)",
            ),
            (
                self.database.max_connections > 0,
                "database.max_connections must be greater than zero",
            ),
            (
                (1..=300).contains(&self.database.timeout_secs),
                "database.timeout_secs must be in range 1..=300",
            ),
            (self.server.port > 0, "server.port must be greater than zero"),
            (
                self.server.graceful_shutdown_secs > 0,
                "server.graceful_shutdown_secs must be greater than zero",
            ),
            (
                LOG_LEVELS.contains(&level.as_str()),
                "logging.level must be one of trace|debug|info|warn|error",
            ),
            (
                !self.workflow.system_actor.trim().is_empty(),
                "workflow.system_actor must not be empty",
            ),
            (
                self.workflow.sweep_batch_size > 0,
                "workflow.sweep_batch_size must be greater than zero",
            ),
        ];

        let problems: Vec<&str> =
            rules.iter().filter(|(ok, _)| !ok).map(|(_, problem)| *problem).collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems.join("; ")))
        }
    }
}

/// The explicit path when it exists, otherwise the first default file found.
fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => path.exists().then(|| path.to_path_buf()),
        None => DEFAULT_CONFIG_FILES.into_iter().map(PathBuf::from).find(|path| path.exists()),
    }
}

fn lookup<'a>(document: &'a toml::Table, key: &str) -> Option<&'a toml::Value> {
    let (section, field) = key.split_once('.')?;
    document.get(section)?.get(field)
}

fn scalar_text(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(text) => Some(text.clone()),
        toml::Value::Integer(number) => Some(number.to_string()),
        toml::Value::Float(number) => Some(number.to_string()),
        toml::Value::Boolean(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Replaces every `${VAR}` with the variable's value.
fn expand_env_refs(raw: &str) -> Result<String, ConfigError> {
    let mut expanded = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or(ConfigError::UnterminatedInterpolation)?;
        let var = &after[..end];
        let value = env::var(var)
            .map_err(|_| ConfigError::MissingEnvInterpolation { var: var.to_string() })?;
        expanded.push_str(&value);
        rest = &after[end + 1..];
    }

    expanded.push_str(rest);
    Ok(expanded)
}
