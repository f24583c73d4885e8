// Configuration resolution for the Whisper server
//
// Layered sources, lowest precedence first: built-in defaults, a config.json
// discovered beside the executable, an explicit --config file, environment
// variables under the WHISPER_ prefix, then command-line flags. Later sources
// override earlier ones key-by-key; the merged flat map is bound once into an
// EffectiveConfig and never mutated afterwards.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use crate::config::{Device, EffectiveConfig};
use crate::file_utils::exe_dir;
use crate::model_manager;

/// File name auto-discovered beside the executable
const CONFIG_FILE_NAME: &str = "config.json";

/// Environment variable prefix
const ENV_PREFIX: &str = "WHISPER_";

/// The closed set of canonical configuration keys
const CANONICAL_KEYS: &[&str] = &[
    "Server:Host",
    "Server:Port",
    "Server:TimeoutSeconds",
    "Server:MaxConcurrentRequests",
    "Server:QueueWaitSeconds",
    "Whisper:ModelName",
    "Whisper:Language",
    "Whisper:Device",
    "Whisper:SampleRate",
    "Whisper:MaxFileSizeMb",
    "Logging:Level",
    "Logging:FilePath",
    "Logging:MaxBytes",
];

/// Section lookup for config files written flat (no sections). Keys are the
/// PascalCase rewrite of the file key.
const FLAT_KEY_SECTIONS: &[(&str, &str)] = &[
    ("Host", "Server:Host"),
    ("Port", "Server:Port"),
    ("Timeout", "Server:TimeoutSeconds"),
    ("TimeoutSeconds", "Server:TimeoutSeconds"),
    ("MaxConcurrent", "Server:MaxConcurrentRequests"),
    ("MaxConcurrentRequests", "Server:MaxConcurrentRequests"),
    ("QueueWaitSeconds", "Server:QueueWaitSeconds"),
    ("Model", "Whisper:ModelName"),
    ("ModelName", "Whisper:ModelName"),
    ("Language", "Whisper:Language"),
    ("Device", "Whisper:Device"),
    ("SampleRate", "Whisper:SampleRate"),
    ("MaxFileSizeMb", "Whisper:MaxFileSizeMb"),
    ("LogLevel", "Logging:Level"),
    ("LogFilePath", "Logging:FilePath"),
    ("LogMaxBytes", "Logging:MaxBytes"),
];

/// Command-line overrides, the highest-precedence source
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub timeout: Option<u64>,
    pub config: Option<PathBuf>,
}

/// Errors raised during configuration resolution
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    FileParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("config file not found: {0}")]
    FileMissing(PathBuf),
    #[error("invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("unknown model id: {0}")]
    UnknownModel(String),
}

/// Resolve the effective configuration from all layered sources.
pub fn resolve(cli: &CliOverrides) -> Result<EffectiveConfig, ConfigError> {
    let mut map: HashMap<String, String> = HashMap::new();

    // Auto-discovered config file beside the executable (optional)
    let auto_path = exe_dir().join(CONFIG_FILE_NAME);
    if auto_path.is_file() {
        merge_file(&mut map, &auto_path)?;
    } else {
        debug!("no config file at {}", auto_path.display());
    }

    // Explicit config file (must exist when given)
    if let Some(path) = &cli.config {
        if !path.is_file() {
            return Err(ConfigError::FileMissing(path.clone()));
        }
        merge_file(&mut map, path)?;
    }

    merge_env(&mut map);
    merge_cli(&mut map, cli);

    bind(&map)
}

/// Merge a JSON config file into the flat key map.
fn merge_file(map: &mut HashMap<String, String>, path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| ConfigError::FileParse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut pairs = Vec::new();
    flatten_json(None, &value, &mut pairs);

    for (key, text) in pairs {
        match canonicalize(&key) {
            Some(canonical) => {
                debug!("config file {}: {} = {}", path.display(), canonical, text);
                map.insert(canonical.to_string(), text);
            }
            None => debug!("ignoring unknown config key: {}", key),
        }
    }

    debug!("configuration loaded from {}", path.display());
    Ok(())
}

/// Flatten a JSON document into `Section:Key` pairs. Keys are rewritten from
/// snake_case to PascalCase before canonical matching, so both
/// `{"model_name": "base"}` and `{"Whisper": {"ModelName": "base"}}` bind to
/// the same canonical key.
pub(crate) fn flatten_json(prefix: Option<&str>, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(table) => {
            for (raw_key, child) in table {
                let rewritten = snake_to_pascal(raw_key);
                let path = match prefix {
                    Some(section) => format!("{}:{}", section, rewritten),
                    None => rewritten,
                };
                match child {
                    Value::Object(_) => flatten_json(Some(&path), child, out),
                    Value::String(s) => out.push((path, s.clone())),
                    Value::Number(n) => out.push((path, n.to_string())),
                    Value::Bool(b) => out.push((path, b.to_string())),
                    Value::Null => {}
                    Value::Array(_) => {
                        warn!("skipping unsupported array value for key: {}", path);
                    }
                }
            }
        }
        _ => warn!("config file root must be a JSON object"),
    }
}

/// Merge WHISPER_-prefixed environment variables. The variable name is the
/// canonical key path upper-cased with `:` replaced by `__`
/// (e.g. WHISPER_SERVER__PORT).
fn merge_env(map: &mut HashMap<String, String>) {
    for (name, value) in env::vars() {
        let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path = rest.replace("__", ":");
        match canonicalize(&path) {
            Some(canonical) => {
                debug!("env override: {} = {}", canonical, value);
                map.insert(canonical.to_string(), value);
            }
            None => debug!("ignoring unknown environment variable: {}", name),
        }
    }
}

fn merge_cli(map: &mut HashMap<String, String>, cli: &CliOverrides) {
    if let Some(host) = &cli.host {
        map.insert("Server:Host".to_string(), host.clone());
    }
    if let Some(port) = cli.port {
        map.insert("Server:Port".to_string(), port.to_string());
    }
    if let Some(timeout) = cli.timeout {
        map.insert("Server:TimeoutSeconds".to_string(), timeout.to_string());
    }
    if let Some(model) = &cli.model {
        map.insert("Whisper:ModelName".to_string(), model.clone());
    }
    if let Some(language) = &cli.language {
        map.insert("Whisper:Language".to_string(), language.clone());
    }
}

/// Match a key path against the canonical set, case-insensitively. Flat keys
/// without a section are routed through the flat-key table.
fn canonicalize(key: &str) -> Option<&'static str> {
    if key.contains(':') {
        return CANONICAL_KEYS
            .iter()
            .find(|canonical| canonical.eq_ignore_ascii_case(key))
            .copied();
    }
    FLAT_KEY_SECTIONS
        .iter()
        .find(|(flat, _)| flat.eq_ignore_ascii_case(key))
        .map(|(_, canonical)| *canonical)
}

/// Rewrite snake_case to PascalCase; keys already PascalCase pass through.
fn snake_to_pascal(key: &str) -> String {
    if !key.contains('_') {
        let mut chars = key.chars();
        return match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => String::new(),
        };
    }
    key.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Bind the merged flat map into the typed configuration, validating each
/// value. Binding is the only place strings become typed fields.
fn bind(map: &HashMap<String, String>) -> Result<EffectiveConfig, ConfigError> {
    let mut config = EffectiveConfig::default();

    for (key, value) in map {
        match key.as_str() {
            "Server:Host" => config.server.host = value.clone(),
            "Server:Port" => config.server.port = parse_number(key, value)?,
            "Server:TimeoutSeconds" => {
                config.server.timeout_seconds = parse_positive(key, value)?;
            }
            "Server:MaxConcurrentRequests" => {
                config.server.max_concurrent_requests = parse_positive(key, value)? as usize;
            }
            "Server:QueueWaitSeconds" => {
                config.server.queue_wait_seconds = parse_number(key, value)?;
            }
            "Whisper:ModelName" => {
                config.whisper.model_name = model_manager::normalize_model_id(value)
                    .ok_or_else(|| ConfigError::UnknownModel(value.clone()))?
                    .to_string();
            }
            "Whisper:Language" => config.whisper.language = value.clone(),
            "Whisper:Device" => {
                config.whisper.device =
                    Device::parse(value).ok_or_else(|| ConfigError::InvalidValue {
                        key: key.clone(),
                        value: value.clone(),
                        reason: "expected auto, cpu or gpu".to_string(),
                    })?;
            }
            "Whisper:SampleRate" => config.whisper.sample_rate = parse_positive(key, value)? as u32,
            "Whisper:MaxFileSizeMb" => {
                config.whisper.max_file_size_mb = parse_positive(key, value)?;
            }
            "Logging:Level" => config.logging.level = value.clone(),
            "Logging:FilePath" => config.logging.file_path = value.clone(),
            "Logging:MaxBytes" => config.logging.max_bytes = parse_positive(key, value)?,
            other => debug!("ignoring unknown config key: {}", other),
        }
    }

    Ok(config)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: "not a valid number".to_string(),
    })
}

fn parse_positive(key: &str, value: &str) -> Result<u64, ConfigError> {
    let parsed: u64 = parse_number(key, value)?;
    if parsed == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_pairs(pairs: &[(&str, &str)]) -> Result<EffectiveConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        bind(&map)
    }

    #[test]
    fn empty_map_binds_to_defaults() {
        let config = bind_pairs(&[]).unwrap();
        assert_eq!(config, EffectiveConfig::default());
    }

    #[test]
    fn defaults_round_trip_without_drift() {
        // defaults -> serialize -> flatten -> bind must reproduce defaults
        let json = serde_json::to_value(EffectiveConfig::default()).unwrap();
        let mut pairs = Vec::new();
        flatten_json(None, &json, &mut pairs);

        let mut map = HashMap::new();
        for (key, value) in pairs {
            let canonical = canonicalize(&key).expect("serialized key must be canonical");
            map.insert(canonical.to_string(), value);
        }

        let config = bind(&map).unwrap();
        assert_eq!(config, EffectiveConfig::default());
    }

    #[test]
    fn snake_case_file_keys_are_rewritten() {
        let json: Value = serde_json::from_str(
            r#"{"model_name": "tiny", "timeout_seconds": 42, "max_file_size_mb": 7}"#,
        )
        .unwrap();
        let mut pairs = Vec::new();
        flatten_json(None, &json, &mut pairs);

        let mut map = HashMap::new();
        for (key, value) in pairs {
            map.insert(canonicalize(&key).unwrap().to_string(), value);
        }

        let config = bind(&map).unwrap();
        assert_eq!(config.whisper.model_name, "whisper-tiny");
        assert_eq!(config.server.timeout_seconds, 42);
        assert_eq!(config.whisper.max_file_size_mb, 7);
    }

    #[test]
    fn sectioned_file_keys_bind() {
        let json: Value =
            serde_json::from_str(r#"{"Server": {"port": 9001}, "Whisper": {"language": "fr"}}"#)
                .unwrap();
        let mut pairs = Vec::new();
        flatten_json(None, &json, &mut pairs);

        let mut map = HashMap::new();
        for (key, value) in pairs {
            map.insert(canonicalize(&key).unwrap().to_string(), value);
        }

        let config = bind(&map).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.whisper.language, "fr");
    }

    #[test]
    fn env_style_paths_canonicalize() {
        assert_eq!(canonicalize("SERVER:PORT"), Some("Server:Port"));
        assert_eq!(canonicalize("WHISPER:MODELNAME"), Some("Whisper:ModelName"));
        assert_eq!(canonicalize("SERVER:NOPE"), None);
    }

    #[test]
    fn cli_overrides_win_over_map_values() {
        let mut map = HashMap::new();
        map.insert("Server:Port".to_string(), "9000".to_string());

        let cli = CliOverrides {
            port: Some(9100),
            model: Some("base.en".to_string()),
            ..CliOverrides::default()
        };
        merge_cli(&mut map, &cli);

        let config = bind(&map).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.whisper.model_name, "whisper-base.en");
    }

    #[test]
    fn unknown_model_in_config_is_rejected() {
        let err = bind_pairs(&[("Whisper:ModelName", "whisper-xxl")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModel(_)));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = bind_pairs(&[("Server:TimeoutSeconds", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
