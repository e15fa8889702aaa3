use std::path::PathBuf;

pub const BASE_DIR_ENV_VAR: &str = "RESTREAM_BASE_DIR";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Resolves the base dir from `RESTREAM_BASE_DIR`, falling back to the
    /// current working directory.
    pub fn from_env() -> std::io::Result<Self> {
        if let Ok(v) = std::env::var(BASE_DIR_ENV_VAR) {
            let t = v.trim();
            if !t.is_empty() {
                return Ok(Self::new(PathBuf::from(t)));
            }
        }
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("streamer.json")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.base_dir.join("uploaded_videos")
    }

    pub fn video_path(&self, file_name: &str) -> PathBuf {
        self.videos_dir().join(file_name)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn job_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("jobs")
    }

    pub fn job_log_path(&self, job_id: &str) -> PathBuf {
        self.job_logs_dir().join(format!("{job_id}.jsonl"))
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        let mut path = self.ffmpeg_dir().join("ffmpeg");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    /// Bundled binary when installed, otherwise whatever `ffmpeg` resolves to on PATH.
    pub fn ffmpeg_cmd(&self) -> PathBuf {
        let path = self.ffmpeg_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("ffmpeg")
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.videos_dir())?;
        std::fs::create_dir_all(self.job_logs_dir())?;
        std::fs::create_dir_all(self.ffmpeg_dir())?;
        Ok(())
    }
}
