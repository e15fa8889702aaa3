use crate::config::StreamerConfig;
use crate::paths::AppPaths;
use crate::{Result, StreamerError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EncoderStatus {
    Available { version: Option<String> },
    /// The binary launched but `-version` exited unsuccessfully.
    Errored { code: Option<i32> },
    NotFound,
    LaunchFailed { message: String },
}

impl EncoderStatus {
    pub fn is_invocable(&self) -> bool {
        matches!(self, Self::Available { .. } | Self::Errored { .. })
    }
}

pub fn probe_status(program: &Path) -> EncoderStatus {
    let output = crate::cmd::command(program)
        .arg("-version")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout);
            let version = text
                .lines()
                .next()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string);
            EncoderStatus::Available { version }
        }
        Ok(output) => EncoderStatus::Errored {
            code: output.status.code(),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => EncoderStatus::NotFound,
        Err(e) => EncoderStatus::LaunchFailed {
            message: e.to_string(),
        },
    }
}

/// True iff the encoder binary could be launched. Must gate every job start.
pub fn probe(program: &Path) -> bool {
    let status = probe_status(program);
    tracing::debug!(program = %program.display(), ?status, "encoder probe");
    status.is_invocable()
}

pub fn require_encoder(paths: &AppPaths, config: &StreamerConfig) -> Result<PathBuf> {
    let program = config.encoder_program(paths);
    if probe(&program) {
        Ok(program)
    } else {
        Err(StreamerError::BinaryNotFound {
            program: program.to_string_lossy().to_string(),
        })
    }
}

/// Downloads a static ffmpeg build into `tools/ffmpeg`.
pub fn install_encoder(paths: &AppPaths) -> Result<EncoderStatus> {
    paths.ensure_dirs()?;

    let destination = paths.ffmpeg_dir();
    let download_url = ffmpeg_sidecar::download::ffmpeg_download_url()
        .map_err(|e| StreamerError::InstallFailed(e.to_string()))?;
    tracing::info!(url = download_url, "downloading ffmpeg package");
    let archive_path =
        ffmpeg_sidecar::download::download_ffmpeg_package(download_url, &destination)
            .map_err(|e| StreamerError::InstallFailed(e.to_string()))?;
    ffmpeg_sidecar::download::unpack_ffmpeg(&archive_path, &destination)
        .map_err(|e| StreamerError::InstallFailed(e.to_string()))?;

    Ok(probe_status(&paths.ffmpeg_bin_path()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let program = dir.path().join("no-such-encoder");
        assert_eq!(probe_status(&program), EncoderStatus::NotFound);
        assert!(!probe(&program));
    }

    #[test]
    fn require_encoder_reports_binary_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let mut config = StreamerConfig::default();
        config.encoder.program = Some(dir.path().join("missing").to_string_lossy().to_string());
        assert!(matches!(
            require_encoder(&paths, &config),
            Err(StreamerError::BinaryNotFound { .. })
        ));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[test]
    fn version_line_is_captured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let program = write_script(dir.path(), "fake-ffmpeg", "echo 'ffmpeg version 7.0 test'");
        assert_eq!(
            probe_status(&program),
            EncoderStatus::Available {
                version: Some("ffmpeg version 7.0 test".to_string())
            }
        );
        assert!(probe(&program));
    }

    #[cfg(unix)]
    #[test]
    fn failing_binary_is_still_invocable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let program = write_script(dir.path(), "broken-ffmpeg", "exit 3");
        assert_eq!(probe_status(&program), EncoderStatus::Errored { code: Some(3) });
        assert!(probe(&program));
    }
}
