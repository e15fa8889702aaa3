use crate::config::EncoderSettings;
use crate::{Result, StreamerError};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Secret identifying the destination broadcast. `Debug` never shows the value.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StreamerError::Validation("stream key is empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `****` followed by the last four characters (nothing for short keys).
    pub fn masked(&self) -> String {
        let count = self.0.chars().count();
        if count <= 4 {
            return "****".to_string();
        }
        let tail: String = self.0.chars().skip(count - 4).collect();
        format!("****{tail}")
    }
}

impl std::fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamKey({})", self.masked())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Standard,
    /// Portrait output for Shorts.
    Vertical,
}

pub fn ingest_url(base_url: &str, key: &StreamKey) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), key.expose())
}

/// Fully assembled encoder command line for one streaming job.
#[derive(Debug, Clone)]
pub struct EncoderInvocation {
    program: PathBuf,
    args: Vec<OsString>,
    key: StreamKey,
}

impl EncoderInvocation {
    pub fn for_stream(
        program: PathBuf,
        settings: &EncoderSettings,
        ingest_base_url: &str,
        video_path: &Path,
        key: &StreamKey,
        mode: OutputMode,
    ) -> Self {
        let mut args: Vec<OsString> = Vec::new();
        extend(&mut args, &["-re", "-stream_loop", "-1", "-i"]);
        args.push(video_path.as_os_str().to_os_string());

        extend(&mut args, &["-c:v", "libx264", "-preset", settings.preset.as_str()]);
        extend(&mut args, &["-b:v", format!("{}k", settings.video_bitrate_kbps).as_str()]);
        extend(&mut args, &["-maxrate", format!("{}k", settings.maxrate_kbps).as_str()]);
        extend(&mut args, &["-bufsize", format!("{}k", settings.bufsize_kbps).as_str()]);
        let gop = settings.keyframe_interval.to_string();
        extend(&mut args, &["-g", gop.as_str(), "-keyint_min", gop.as_str()]);
        extend(
            &mut args,
            &["-c:a", "aac", "-b:a", format!("{}k", settings.audio_bitrate_kbps).as_str()],
        );
        extend(&mut args, &["-f", "flv"]);
        if mode == OutputMode::Vertical {
            let scale = format!("scale={}:{}", settings.vertical_width, settings.vertical_height);
            extend(&mut args, &["-vf", scale.as_str()]);
        }
        args.push(OsString::from(ingest_url(ingest_base_url, key)));

        Self {
            program,
            args,
            key: key.clone(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn command(&self) -> Command {
        let mut cmd = crate::cmd::command(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Space-joined command line including the stream key.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn redacted_command_line(&self) -> String {
        self.command_line()
            .replace(self.key.expose(), &self.key.masked())
    }
}

/// Binary name used when matching processes by name.
pub fn process_name(program: &Path) -> String {
    program
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "ffmpeg".to_string())
}

fn extend(args: &mut Vec<OsString>, values: &[&str]) {
    args.extend(values.iter().map(OsString::from));
}
