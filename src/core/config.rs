//! Engine configuration.
//!
//! Loaded from a TOML file (or string). Unknown keys are ignored with a
//! collected warning; invalid values fail validation naming the offending
//! path, so callers can surface `sync.export_debounce` rather than a parse
//! position.

use crate::core::error::ElementalError;
use crate::core::schemas;
use serde_json::json;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// How strictly actor identities are checked by outer surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityMode {
    #[default]
    Soft,
    Strict,
}

impl IdentityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Strict => "strict",
        }
    }
}

impl fmt::Display for IdentityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityMode {
    type Err = ElementalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "soft" => Ok(Self::Soft),
            "strict" => Ok(Self::Strict),
            other => Err(ElementalError::validation(format!(
                "identity.mode must be \"soft\" or \"strict\", got {other:?}"
            ))
            .with_detail("path", json!("identity.mode"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub auto_export: bool,
    pub elements_file: String,
    pub dependencies_file: String,
    pub export_debounce_ms: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_export: false,
            elements_file: "elements.jsonl".to_string(),
            dependencies_file: "dependencies.jsonl".to_string(),
            export_debounce_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlaybooksConfig {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database: String,
    pub actor: Option<String>,
    pub sync: SyncConfig,
    pub playbooks: PlaybooksConfig,
    pub identity: IdentityMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: format!("{}/{}", schemas::DB_DIR_NAME, schemas::DB_FILE_NAME),
            actor: None,
            sync: SyncConfig::default(),
            playbooks: PlaybooksConfig::default(),
            identity: IdentityMode::default(),
        }
    }
}

/// A parsed configuration plus any unknown-key warnings.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub warnings: Vec<String>,
}

pub fn load(path: &Path) -> Result<LoadedConfig, ElementalError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        ElementalError::validation(format!(
            "cannot read config file {}: {err}",
            path.display()
        ))
        .with_cause(err)
    })?;
    load_from_str(&raw)
}

pub fn load_from_str(raw: &str) -> Result<LoadedConfig, ElementalError> {
    let table: toml::Table = raw.parse().map_err(|err: toml::de::Error| {
        ElementalError::validation(format!("malformed config: {err}")).with_cause(err)
    })?;

    let mut config = Config::default();
    let mut warnings = Vec::new();

    for (key, value) in &table {
        match key.as_str() {
            "database" => config.database = expect_string(value, "database")?,
            "actor" => config.actor = Some(expect_string(value, "actor")?),
            "sync" => parse_sync(value, &mut config.sync, &mut warnings)?,
            "playbooks" => parse_playbooks(value, &mut config.playbooks, &mut warnings)?,
            "identity" => parse_identity(value, &mut config.identity, &mut warnings)?,
            other => warnings.push(format!("ignoring unknown config key: {other}")),
        }
    }

    Ok(LoadedConfig { config, warnings })
}

fn expect_string(value: &toml::Value, path: &str) -> Result<String, ElementalError> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ElementalError::validation(format!("{path} must be a string"))
                .with_detail("path", json!(path))
        })
}

fn expect_table<'a>(
    value: &'a toml::Value,
    path: &str,
) -> Result<&'a toml::Table, ElementalError> {
    value.as_table().ok_or_else(|| {
        ElementalError::validation(format!("{path} must be a table"))
            .with_detail("path", json!(path))
    })
}

fn parse_sync(
    value: &toml::Value,
    sync: &mut SyncConfig,
    warnings: &mut Vec<String>,
) -> Result<(), ElementalError> {
    for (key, value) in expect_table(value, "sync")? {
        match key.as_str() {
            "auto_export" => {
                sync.auto_export = value.as_bool().ok_or_else(|| {
                    ElementalError::validation("sync.auto_export must be a boolean")
                        .with_detail("path", json!("sync.auto_export"))
                })?;
            }
            "elements_file" => sync.elements_file = expect_string(value, "sync.elements_file")?,
            "dependencies_file" => {
                sync.dependencies_file = expect_string(value, "sync.dependencies_file")?;
            }
            "export_debounce" => {
                let debounce = value.as_integer().ok_or_else(|| {
                    ElementalError::validation("sync.export_debounce must be an integer")
                        .with_detail("path", json!("sync.export_debounce"))
                })?;
                if debounce < 0 {
                    return Err(ElementalError::validation(
                        "sync.export_debounce must not be negative",
                    )
                    .with_detail("path", json!("sync.export_debounce")));
                }
                sync.export_debounce_ms = debounce;
            }
            other => warnings.push(format!("ignoring unknown config key: sync.{other}")),
        }
    }
    Ok(())
}

fn parse_playbooks(
    value: &toml::Value,
    playbooks: &mut PlaybooksConfig,
    warnings: &mut Vec<String>,
) -> Result<(), ElementalError> {
    for (key, value) in expect_table(value, "playbooks")? {
        match key.as_str() {
            "paths" => {
                let entries = value.as_array().ok_or_else(|| {
                    ElementalError::validation("playbooks.paths must be an array of strings")
                        .with_detail("path", json!("playbooks.paths"))
                })?;
                let mut paths = Vec::with_capacity(entries.len());
                for entry in entries {
                    paths.push(expect_string(entry, "playbooks.paths")?);
                }
                playbooks.paths = paths;
            }
            other => warnings.push(format!("ignoring unknown config key: playbooks.{other}")),
        }
    }
    Ok(())
}

fn parse_identity(
    value: &toml::Value,
    identity: &mut IdentityMode,
    warnings: &mut Vec<String>,
) -> Result<(), ElementalError> {
    for (key, value) in expect_table(value, "identity")? {
        match key.as_str() {
            "mode" => *identity = expect_string(value, "identity.mode")?.parse()?,
            other => warnings.push(format!("ignoring unknown config key: identity.{other}")),
        }
    }
    Ok(())
}
