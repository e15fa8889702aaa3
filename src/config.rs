use crate::paths::AppPaths;
use crate::{Result, StreamerError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_INGEST_BASE_URL: &str = "rtmp://a.rtmp.youtube.com/live2";

/// How `JobController::stop` behaves when no live process is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKill {
    Disabled,
    /// Signal only encoder PIDs this controller launched and never reaped.
    SpawnedPids,
    /// Signal every process whose name matches the encoder binary.
    SystemWide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Explicit encoder binary; `None` resolves through `AppPaths::ffmpeg_cmd`.
    pub program: Option<String>,
    pub preset: String,
    pub video_bitrate_kbps: u32,
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
    pub keyframe_interval: u32,
    pub audio_bitrate_kbps: u32,
    pub vertical_width: u32,
    pub vertical_height: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            program: None,
            preset: "veryfast".to_string(),
            video_bitrate_kbps: 2500,
            maxrate_kbps: 2500,
            bufsize_kbps: 5000,
            keyframe_interval: 60,
            audio_bitrate_kbps: 128,
            vertical_width: 720,
            vertical_height: 1280,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub ingest_base_url: String,
    pub encoder: EncoderSettings,
    pub download_timeout_secs: u64,
    pub log_window: usize,
    pub log_capacity: usize,
    pub video_retention_secs: u64,
    pub job_log_retention_secs: u64,
    /// Grace period before a stopped encoder is force-killed; `None` never escalates.
    pub stop_grace_secs: Option<u64>,
    pub fallback_kill: FallbackKill,
    pub redact_stream_key: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            ingest_base_url: DEFAULT_INGEST_BASE_URL.to_string(),
            encoder: EncoderSettings::default(),
            download_timeout_secs: 60,
            log_window: 25,
            log_capacity: 2000,
            video_retention_secs: 24 * 60 * 60,
            job_log_retention_secs: 30 * 24 * 60 * 60,
            stop_grace_secs: Some(10),
            fallback_kill: FallbackKill::SpawnedPids,
            redact_stream_key: true,
        }
    }
}

impl StreamerConfig {
    pub fn encoder_program(&self, paths: &AppPaths) -> PathBuf {
        match self.encoder.program.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => paths.ffmpeg_cmd(),
        }
    }
}

pub fn load_config(paths: &AppPaths) -> Result<StreamerConfig> {
    let path = paths.config_path();
    if !path.exists() {
        return Ok(StreamerConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: StreamerConfig = serde_json::from_slice(&bytes).map_err(|e| {
        StreamerError::Validation(format!(
            "failed to parse config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_config(paths: &AppPaths, config: &StreamerConfig) -> Result<()> {
    let path = paths.config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
