// Whisper server configuration
//
// This module contains the typed effective configuration for the server.
// It centralizes all configuration parameters and their default values;
// the layered resolution itself lives in config_loader.

use serde::{Deserialize, Serialize};

/// Default values for configuration
pub mod defaults {
    // Bind address for the HTTP server
    pub const HOST: &str = "0.0.0.0";

    // HTTP port
    pub const PORT: u16 = 8000;

    // Per-request budget for normalize + transcribe, in seconds
    pub const TIMEOUT_SECONDS: u64 = 300;

    // Simultaneous transcriptions allowed in flight
    pub const MAX_CONCURRENT_REQUESTS: usize = 2;

    // How long a request may wait for an admission slot, in seconds
    pub const QUEUE_WAIT_SECONDS: u64 = 10;

    // Default Whisper model
    pub const MODEL_NAME: &str = "whisper-base";

    // Default transcription language ("auto" = detect)
    pub const LANGUAGE: &str = "auto";

    // Sample rate fed to the engine
    pub const SAMPLE_RATE: u32 = 16000;

    // Maximum accepted payload size in megabytes
    pub const MAX_FILE_SIZE_MB: u64 = 100;

    // Log level
    pub const LOG_LEVEL: &str = "info";

    // Log file path, relative to the working directory unless absolute
    pub const LOG_FILE_PATH: &str = "logs/whisper-server.log";

    // Rotate the log file once it reaches this size
    pub const LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
}

/// Inference device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Auto,
    Cpu,
    Gpu,
}

impl Device {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Some(Device::Auto),
            "cpu" => Some(Device::Cpu),
            "gpu" | "cuda" => Some(Device::Gpu),
            _ => None,
        }
    }

    /// Whether the engine should be asked to use the GPU
    pub fn use_gpu(self) -> bool {
        matches!(self, Device::Auto | Device::Gpu)
    }
}

/// HTTP server section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Per-request timeout in seconds (normalize + transcribe)
    pub timeout_seconds: u64,
    /// Maximum simultaneous transcriptions
    pub max_concurrent_requests: usize,
    /// Maximum seconds a request may wait for an admission slot
    pub queue_wait_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            timeout_seconds: defaults::TIMEOUT_SECONDS,
            max_concurrent_requests: defaults::MAX_CONCURRENT_REQUESTS,
            queue_wait_seconds: defaults::QUEUE_WAIT_SECONDS,
        }
    }
}

/// Whisper engine section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct WhisperConfig {
    /// Normalized model id (e.g. "whisper-base")
    pub model_name: String,
    /// Transcription language, "auto" to detect
    pub language: String,
    /// Inference device
    pub device: Device,
    /// Sample rate fed to the engine
    pub sample_rate: u32,
    /// Maximum accepted payload size in megabytes
    pub max_file_size_mb: u64,
}

impl WhisperConfig {
    /// Size cap in bytes
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model_name: defaults::MODEL_NAME.to_string(),
            language: defaults::LANGUAGE.to_string(),
            device: Device::Auto,
            sample_rate: defaults::SAMPLE_RATE,
            max_file_size_mb: defaults::MAX_FILE_SIZE_MB,
        }
    }
}

/// Logging section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct LoggingConfig {
    /// Log level filter (error, warn, info, debug, trace)
    pub level: String,
    /// Log file path
    pub file_path: String,
    /// Rotation threshold in bytes
    pub max_bytes: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            file_path: defaults::LOG_FILE_PATH.to_string(),
            max_bytes: defaults::LOG_MAX_BYTES,
        }
    }
}

/// The effective configuration, immutable after resolution.
///
/// Serialized with PascalCase sections so the config echo endpoint mirrors
/// the appsettings shape clients already parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct EffectiveConfig {
    pub server: ServerConfig,
    pub whisper: WhisperConfig,
    pub logging: LoggingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EffectiveConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.whisper.model_name, "whisper-base");
        assert_eq!(config.whisper.sample_rate, 16000);
        assert_eq!(config.whisper.max_file_size_mb, 100);
        assert_eq!(config.server.queue_wait_seconds, 10);
    }

    #[test]
    fn config_echo_uses_pascal_case_sections() {
        let json = serde_json::to_value(EffectiveConfig::default()).unwrap();
        assert_eq!(json["Whisper"]["ModelName"], "whisper-base");
        assert_eq!(json["Server"]["Port"], 8000);
        assert_eq!(json["Logging"]["Level"], "info");
    }

    #[test]
    fn device_parse_accepts_known_values_case_insensitively() {
        assert_eq!(Device::parse("CPU"), Some(Device::Cpu));
        assert_eq!(Device::parse("cuda"), Some(Device::Gpu));
        assert_eq!(Device::parse("auto"), Some(Device::Auto));
        assert_eq!(Device::parse("tpu"), None);
    }

    #[test]
    fn size_cap_is_in_bytes() {
        let whisper = WhisperConfig {
            max_file_size_mb: 2,
            ..WhisperConfig::default()
        };
        assert_eq!(whisper.max_file_size_bytes(), 2 * 1024 * 1024);
    }
}
