use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Local capture device selected by index (requires the `camera` feature).
    Device,
    /// `multipart/x-mixed-replace` JPEG stream served over HTTP.
    Mjpeg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_source")]
    pub source: SourceKind,
    #[serde(default)]
    pub device_index: i32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Stream URL, required when `source = "mjpeg"`.
    #[serde(default)]
    pub url: Option<String>,
    /// Show the live feed in a window (only with the `camera` feature).
    #[serde(default = "default_preview")]
    pub preview: bool,
    /// Silence tolerated on an MJPEG stream before it is reconnected.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
    /// How long shutdown waits for in-flight analysis/speech after the
    /// camera has been released.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// Image detail tier requested from the vision service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    Low,
    High,
    Auto,
}

impl DetailLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailLevel::Low => "low",
            DetailLevel::High => "high",
            DetailLevel::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_vision_model")]
    pub model: String,
    /// Name of the environment variable holding the service credential.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_detail")]
    pub detail: DetailLevel,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeechEngineKind {
    /// The `edge-tts` command line tool.
    EdgeTts,
    /// OpenAI `audio/speech` endpoint, sharing the analysis credential.
    Openai,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeechConfig {
    #[serde(default = "default_speech_engine")]
    pub engine: SpeechEngineKind,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_synth_program")]
    pub synth_program: String,
    #[serde(default = "default_player_program")]
    pub player_program: String,
    #[serde(default = "default_player_args")]
    pub player_args: Vec<String>,
    /// Directory for transient audio files. Defaults to the system temp dir.
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
    /// Speaking rate assumed when synthesis or playback fails and the player
    /// falls back to waiting instead.
    #[serde(default = "default_fallback_chars_per_sec")]
    pub fallback_chars_per_sec: f64,
    #[serde(default = "default_openai_tts_model")]
    pub openai_model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            device_index: 0,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            url: None,
            preview: default_preview(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_dimension: default_max_dimension(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_vision_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            detail: default_detail(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            engine: default_speech_engine(),
            voice: default_voice(),
            synth_program: default_synth_program(),
            player_program: default_player_program(),
            player_args: default_player_args(),
            artifact_dir: None,
            fallback_chars_per_sec: default_fallback_chars_per_sec(),
            openai_model: default_openai_tts_model(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.schedule.interval_secs > 0.0) {
            return Err(ConfigError::Invalid(
                "schedule.interval_secs must be positive".into(),
            ));
        }
        if self.schedule.shutdown_grace_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "schedule.shutdown_grace_secs must not be negative".into(),
            ));
        }
        if !(self.camera.fps > 0.0) {
            return Err(ConfigError::Invalid("camera.fps must be positive".into()));
        }
        if !(self.camera.read_timeout_secs > 0.0) {
            return Err(ConfigError::Invalid(
                "camera.read_timeout_secs must be positive".into(),
            ));
        }
        if self.camera.source == SourceKind::Mjpeg && self.camera.url.is_none() {
            return Err(ConfigError::Invalid(
                "camera.url is required when camera.source = \"mjpeg\"".into(),
            ));
        }
        if self.encoder.max_dimension == 0 {
            return Err(ConfigError::Invalid(
                "encoder.max_dimension must be at least 1".into(),
            ));
        }
        if !(1..=100).contains(&self.encoder.jpeg_quality) {
            return Err(ConfigError::Invalid(
                "encoder.jpeg_quality must be within 1..=100".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.analysis.temperature) {
            return Err(ConfigError::Invalid(
                "analysis.temperature must be within 0.0..=2.0".into(),
            ));
        }
        if !(self.speech.fallback_chars_per_sec > 0.0) {
            return Err(ConfigError::Invalid(
                "speech.fallback_chars_per_sec must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_secs)
    }
}

impl CameraConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout_secs)
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

impl AnalysisConfig {
    /// Read the service credential from the configured environment variable.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ConfigError::MissingCredential(self.api_key_env.clone())),
        }
    }
}

impl SpeechConfig {
    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("environment variable {0} is not set")]
    MissingCredential(String),
}

// Default value functions
fn default_source() -> SourceKind {
    SourceKind::Device
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> f64 {
    30.0
}
fn default_read_timeout_secs() -> f64 {
    10.0
}

fn default_preview() -> bool {
    true
}
fn default_interval_secs() -> f64 {
    3.0
}
fn default_shutdown_grace_secs() -> f64 {
    2.0
}
fn default_max_dimension() -> u32 {
    512
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_endpoint() -> String {
    "https://api.openai.com/v1".into()
}
fn default_vision_model() -> String {
    "gpt-4o-mini".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_max_tokens() -> u32 {
    150
}
fn default_temperature() -> f32 {
    0.5
}
fn default_detail() -> DetailLevel {
    DetailLevel::Low
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_speech_engine() -> SpeechEngineKind {
    SpeechEngineKind::EdgeTts
}
fn default_voice() -> String {
    "en-US-JennyNeural".into()
}
fn default_synth_program() -> String {
    "edge-tts".into()
}
fn default_player_program() -> String {
    if cfg!(target_os = "macos") {
        "afplay".into()
    } else {
        "ffplay".into()
    }
}
fn default_player_args() -> Vec<String> {
    if cfg!(target_os = "macos") {
        Vec::new()
    } else {
        ["-nodisp", "-autoexit", "-loglevel", "quiet"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}
fn default_fallback_chars_per_sec() -> f64 {
    30.0
}
fn default_openai_tts_model() -> String {
    "tts-1".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.schedule.interval_secs, 3.0);
        assert_eq!(config.encoder.max_dimension, 512);
        assert_eq!(config.encoder.jpeg_quality, 85);
        assert_eq!(config.analysis.max_tokens, 150);
        assert_eq!(config.analysis.detail, DetailLevel::Low);
        assert_eq!(config.speech.engine, SpeechEngineKind::EdgeTts);
        assert_eq!(config.camera.source, SourceKind::Device);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: Config = toml::from_str(
            r#"
            [camera]
            source = "mjpeg"
            url = "http://camera.local:8080/stream"
            fps = 15.0

            [speech]
            engine = "openai"
            voice = "alloy"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.camera.source, SourceKind::Mjpeg);
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.camera.read_timeout(), Duration::from_secs(10));
        assert_eq!(config.speech.engine, SpeechEngineKind::Openai);
        assert_eq!(config.speech.fallback_chars_per_sec, 30.0);
    }

    #[test]
    fn rejects_non_positive_interval() {
        let config: Config = toml::from_str("[schedule]\ninterval_secs = 0.0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn mjpeg_requires_url() {
        let config: Config = toml::from_str("[camera]\nsource = \"mjpeg\"").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_credential_is_reported_by_name() {
        let analysis = AnalysisConfig {
            api_key_env: "SIGHTLINE_TEST_UNSET_KEY".into(),
            ..AnalysisConfig::default()
        };
        match analysis.api_key() {
            Err(ConfigError::MissingCredential(var)) => {
                assert_eq!(var, "SIGHTLINE_TEST_UNSET_KEY")
            }
            other => panic!("expected missing credential, got {other:?}"),
        }
    }

    #[test]
    fn frame_period_follows_fps() {
        let camera = CameraConfig {
            fps: 10.0,
            ..CameraConfig::default()
        };
        assert_eq!(camera.frame_period(), Duration::from_millis(100));
    }
}
