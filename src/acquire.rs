use crate::log_sink::LogSink;
use crate::{Result, StreamerError};
use regex::Regex;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use url::Url;

pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Upload progress is scaled against this size; it is not a limit.
pub const UPLOAD_PROGRESS_REFERENCE_BYTES: u64 = 512 * 1024 * 1024;

/// Socket reads handed from the body reader thread to the writer.
const BODY_READ_SIZE: usize = 64 * 1024;
const BODY_PIECES_IN_FLIGHT: usize = 64;

const DRIVE_HOST: &str = "drive.google.com";
const DEFAULT_HTTP_USER_AGENT: &str = concat!("restream_engine/", env!("CARGO_PKG_VERSION"));

static DRIVE_PATH_ID_RE: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "bytes", rename_all = "snake_case")]
pub enum ProgressScale {
    /// Total size is known (e.g. from `Content-Length`).
    Exact(u64),
    /// Total is unknown; fraction is relative to a display ceiling.
    Reference(u64),
    Indeterminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AcquisitionProgress {
    pub bytes_transferred: u64,
    pub scale: ProgressScale,
}

impl AcquisitionProgress {
    pub fn expected_total(&self) -> Option<u64> {
        match self.scale {
            ProgressScale::Exact(total) => Some(total),
            _ => None,
        }
    }

    /// Completed fraction in `[0, 1]`, or `None` when only activity can be reported.
    pub fn fraction(&self) -> Option<f64> {
        let denominator = match self.scale {
            ProgressScale::Exact(v) | ProgressScale::Reference(v) => v,
            ProgressScale::Indeterminate => return None,
        };
        if denominator == 0 {
            return Some(1.0);
        }
        Some((self.bytes_transferred as f64 / denominator as f64).min(1.0))
    }

    pub fn describe(&self) -> String {
        let done = self.bytes_transferred as f64 / (1024.0 * 1024.0);
        match self.scale {
            ProgressScale::Exact(total) => {
                format!("{done:.1} MB / {:.1} MB", total as f64 / (1024.0 * 1024.0))
            }
            _ => format!("{done:.1} MB"),
        }
    }
}

/// Persists an upload stream chunk by chunk. The file is truncated first, so
/// repeating the call with the same input produces the same file.
pub fn save_upload<R: Read>(
    reader: &mut R,
    dest: &Path,
    on_progress: &mut dyn FnMut(AcquisitionProgress),
) -> Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = File::create(dest)?;
    let mut buf = vec![0_u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let read = read_chunk(reader, &mut buf)?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])?;
        total += read as u64;
        on_progress(AcquisitionProgress {
            bytes_transferred: total,
            scale: ProgressScale::Reference(UPLOAD_PROGRESS_REFERENCE_BYTES),
        });
    }
    file.flush()?;

    tracing::info!(path = %dest.display(), bytes = total, "upload saved");
    Ok(dest.to_path_buf())
}

/// Fetches `url` into `dest`, logging progress milestones to `log`.
///
/// Returns `false` after logging the cause on any transport, status or write
/// failure. A partial file may remain at `dest` in that case.
pub fn download_from_url(
    url: &str,
    dest: &Path,
    log: &LogSink,
    timeout: Duration,
    on_progress: &mut dyn FnMut(AcquisitionProgress),
) -> bool {
    log.append(format!("Downloading video from: {url}"));
    match download_to(url, dest, timeout, on_progress) {
        Ok(bytes) => {
            tracing::info!(url = %redact_url_for_log(url), bytes, "download finished");
            log.append("Download complete!");
            true
        }
        Err(e) => {
            tracing::warn!(url = %redact_url_for_log(url), "download failed: {e}");
            log.append(format!("Failed to download video: {e}"));
            false
        }
    }
}

/// `Result` form of [`download_from_url`]; returns the number of bytes written.
pub fn download_to(
    url: &str,
    dest: &Path,
    timeout: Duration,
    on_progress: &mut dyn FnMut(AcquisitionProgress),
) -> Result<u64> {
    let request_url = normalize_drive_url(url.trim())?;
    let redacted = redact_url_for_log(&request_url);

    let agent = build_http_agent(timeout);
    let response = agent
        .get(&request_url)
        .call()
        .map_err(|e| StreamerError::Transport(format!("request failed for {redacted}: {e}")))?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Err(StreamerError::Transport(format!(
            "http {status} for {redacted}"
        )));
    }

    let content_length = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let scale = match content_length {
        Some(len) => ProgressScale::Exact(len),
        None => ProgressScale::Indeterminate,
    };

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(dest)?;
    let read_timeout = timeout.max(Duration::from_secs(1));
    let pieces = spawn_body_reader(response.into_body().into_reader())?;
    let mut pending: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
    let mut downloaded: u64 = 0;

    loop {
        match pieces.recv_timeout(read_timeout) {
            Ok(Ok(piece)) => pending.extend_from_slice(&piece),
            Ok(Err(e)) => {
                return Err(StreamerError::Transport(format!(
                    "failed reading response body for {redacted}: {e}"
                )))
            }
            Err(RecvTimeoutError::Timeout) => {
                return Err(StreamerError::Transport(format!(
                    "no data from {redacted} for {}s after {} bytes",
                    read_timeout.as_secs(),
                    downloaded + pending.len() as u64
                )))
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        while pending.len() >= CHUNK_SIZE {
            file.write_all(&pending[..CHUNK_SIZE])?;
            pending.drain(..CHUNK_SIZE);
            downloaded += CHUNK_SIZE as u64;
            on_progress(AcquisitionProgress {
                bytes_transferred: downloaded,
                scale,
            });
        }
    }
    if !pending.is_empty() || downloaded == 0 {
        file.write_all(&pending)?;
        downloaded += pending.len() as u64;
        on_progress(AcquisitionProgress {
            bytes_transferred: downloaded,
            scale,
        });
    }
    file.flush()?;

    if let Some(len) = content_length {
        if downloaded < len {
            return Err(StreamerError::Transport(format!(
                "response for {redacted} ended after {downloaded} of {len} bytes"
            )));
        }
    }

    Ok(downloaded)
}

/// Rewrites Drive share links to their direct-download form; other URLs pass through.
pub fn normalize_drive_url(url: &str) -> Result<String> {
    if !url.contains(DRIVE_HOST) {
        return Ok(url.to_string());
    }
    let id = drive_file_id(url).ok_or_else(|| {
        StreamerError::Transport(format!("could not find a file id in Drive link {url}"))
    })?;
    Ok(format!("https://{DRIVE_HOST}/uc?export=download&id={id}"))
}

/// File identifier from a Drive link, taken from an `id=` query parameter or a `/d/<id>/` segment.
pub fn drive_file_id(url: &str) -> Option<String> {
    if !url.contains(DRIVE_HOST) {
        return None;
    }

    let parsed = Url::parse(url).or_else(|_| Url::parse(&format!("https://{url}")));
    if let Ok(parsed) = parsed {
        let from_query = parsed
            .query_pairs()
            .find(|(k, v)| k == "id" && !v.is_empty())
            .map(|(_, v)| v.into_owned());
        if from_query.is_some() {
            return from_query;
        }
    }

    let re = DRIVE_PATH_ID_RE.get_or_init(|| Regex::new(r"/d/([^/?#&]+)").unwrap());
    re.captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Reads the body on its own thread so each read can be bounded by `recv_timeout`.
/// A stalled reader is abandoned; it exits once the connection closes.
fn spawn_body_reader<R: Read + Send + 'static>(
    mut body: R,
) -> std::io::Result<Receiver<std::io::Result<Vec<u8>>>> {
    let (tx, rx) = mpsc::sync_channel(BODY_PIECES_IN_FLIGHT);
    thread::Builder::new()
        .name("restream-download".to_string())
        .spawn(move || {
            let mut buf = vec![0_u8; BODY_READ_SIZE];
            loop {
                match body.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

fn build_http_agent(timeout: Duration) -> ureq::Agent {
    let timeout = timeout.max(Duration::from_secs(1));
    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_connect(Some(timeout))
        .timeout_recv_response(Some(timeout))
        .user_agent(DEFAULT_HTTP_USER_AGENT);
    config.build().into()
}

/// Fills `buf` as far as the reader allows; returns less than `buf.len()` only at end of stream.
fn read_chunk<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn redact_url_for_log(value: &str) -> String {
    match Url::parse(value) {
        Ok(url) => format!(
            "{}://{}/...",
            url.scheme(),
            url.host_str().unwrap_or("unknown-host")
        ),
        Err(_) => "[invalid-url]".to_string(),
    }
}
