use crate::config::StreamerConfig;
use crate::paths::AppPaths;
use crate::{acquire, Result, StreamerError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const VIDEO_EXTENSIONS: [&str; 2] = ["mp4", "flv"];
const DEFAULT_DOWNLOAD_NAME: &str = "download.mp4";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalVideoFile {
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub videos_removed: usize,
    pub job_logs_removed: usize,
}

pub fn has_video_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// Streamable files in the managed directory, sorted by name.
pub fn list_local_videos(paths: &AppPaths) -> Result<Vec<LocalVideoFile>> {
    let dir = paths.videos_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let meta = match entry.metadata() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !has_video_extension(&file_name) {
            continue;
        }
        out.push(LocalVideoFile {
            file_name,
            path: entry.path(),
            size_bytes: meta.len(),
        });
    }
    out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(out)
}

/// Resolves a previously acquired file by name.
pub fn find_local_video(paths: &AppPaths, file_name: &str) -> Result<PathBuf> {
    let name = sanitize_file_name(file_name)?;
    let path = paths.video_path(&name);
    if !path.is_file() {
        return Err(StreamerError::Validation(format!(
            "no local video named {name}"
        )));
    }
    Ok(path)
}

/// Destination for an upload; only the final path component of the client name is kept.
pub fn upload_destination(paths: &AppPaths, original_name: &str) -> Result<PathBuf> {
    let name = sanitize_file_name(original_name)?;
    Ok(paths.video_path(&name))
}

/// Destination for a URL download, named after the URL's basename.
pub fn url_destination(paths: &AppPaths, url: &str) -> PathBuf {
    paths.video_path(&file_name_for_url(url))
}

pub fn file_name_for_url(url: &str) -> String {
    let mut name = match acquire::drive_file_id(url) {
        Some(id) => id,
        None => {
            let without_query = url.split(['?', '#']).next().unwrap_or(url);
            without_query
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string()
        }
    };
    name.retain(|c| !matches!(c, '\\' | ':' | '*' | '"' | '<' | '>' | '|'));
    if name.is_empty() || name.contains("://") || name == "." || name == ".." {
        return DEFAULT_DOWNLOAD_NAME.to_string();
    }
    if !has_video_extension(&name) {
        name.push_str(".mp4");
    }
    name
}

fn sanitize_file_name(raw: &str) -> Result<String> {
    let name = Path::new(raw.trim())
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.is_empty() {
        return Err(StreamerError::Validation("file name is empty".to_string()));
    }
    Ok(name)
}

/// Deletes regular files in `dir` whose mtime is older than `max_age`. Returns the count.
pub fn sweep_stale_files(dir: &Path, max_age: Duration) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let meta = match entry.metadata() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if modified < cutoff && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Session start housekeeping: make sure the layout exists and drop stale media and job logs.
pub fn sweep_session(paths: &AppPaths, config: &StreamerConfig) -> Result<SweepSummary> {
    paths.ensure_dirs()?;
    let summary = SweepSummary {
        videos_removed: sweep_stale_files(
            &paths.videos_dir(),
            Duration::from_secs(config.video_retention_secs),
        )?,
        job_logs_removed: sweep_stale_files(
            &paths.job_logs_dir(),
            Duration::from_secs(config.job_log_retention_secs),
        )?,
    };
    if summary.videos_removed > 0 || summary.job_logs_removed > 0 {
        tracing::info!(
            videos = summary.videos_removed,
            job_logs = summary.job_logs_removed,
            "removed stale files"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    fn age_file(path: &Path, secs: u64) {
        let t = SystemTime::now() - Duration::from_secs(secs);
        filetime::set_file_mtime(path, FileTime::from_system_time(t)).expect("set mtime");
    }

    #[test]
    fn lists_only_video_files_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("dirs");
        std::fs::write(paths.video_path("b.flv"), b"bb").expect("write");
        std::fs::write(paths.video_path("a.mp4"), b"a").expect("write");
        std::fs::write(paths.video_path("notes.txt"), b"x").expect("write");
        std::fs::create_dir_all(paths.video_path("nested.mp4")).expect("mkdir");

        let videos = list_local_videos(&paths).expect("list");
        let names: Vec<&str> = videos.iter().map(|v| v.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.mp4", "b.flv"]);
        assert_eq!(videos[1].size_bytes, 2);
    }

    #[test]
    fn url_names_get_default_extension() {
        assert_eq!(file_name_for_url("https://cdn.example.com/v/clip.mp4?sig=1"), "clip.mp4");
        assert_eq!(file_name_for_url("https://cdn.example.com/v/clip.flv"), "clip.flv");
        assert_eq!(file_name_for_url("https://cdn.example.com/v/clip"), "clip.mp4");
        assert_eq!(file_name_for_url("https://cdn.example.com/"), "cdn.example.com.mp4");
        assert_eq!(
            file_name_for_url("https://drive.google.com/file/d/ABC123/view?usp=sharing"),
            "ABC123.mp4"
        );
    }

    #[test]
    fn upload_destination_strips_directories() {
        let paths = AppPaths::new(PathBuf::from("/data"));
        let dest = upload_destination(&paths, "../../etc/evil.mp4").expect("dest");
        assert_eq!(dest, paths.video_path("evil.mp4"));
        assert!(matches!(
            upload_destination(&paths, "  "),
            Err(StreamerError::Validation(_))
        ));
    }

    #[test]
    fn find_local_video_requires_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("dirs");
        std::fs::write(paths.video_path("a.mp4"), b"a").expect("write");
        assert_eq!(find_local_video(&paths, "a.mp4").expect("find"), paths.video_path("a.mp4"));
        assert!(find_local_video(&paths, "b.mp4").is_err());
    }

    #[test]
    fn sweep_removes_only_stale_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("dirs");

        let old = paths.video_path("old.mp4");
        let fresh = paths.video_path("fresh.mp4");
        let old_log = paths.job_log_path("old-job");
        std::fs::write(&old, b"o").expect("write");
        std::fs::write(&fresh, b"f").expect("write");
        std::fs::write(&old_log, b"{}").expect("write");
        age_file(&old, 2 * 86_400);
        age_file(&old_log, 31 * 86_400);

        let summary = sweep_session(&paths, &StreamerConfig::default()).expect("sweep");
        assert_eq!(
            summary,
            SweepSummary {
                videos_removed: 1,
                job_logs_removed: 1
            }
        );
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(!old_log.exists());
    }
}
