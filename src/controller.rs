use crate::config::{FallbackKill, StreamerConfig};
use crate::encoder::{EncoderInvocation, OutputMode, StreamKey};
use crate::log_sink::{now_ms, LogSink};
use crate::paths::AppPaths;
use crate::supervisor::{Launch, StreamJobSupervisor};
use crate::{Result, StreamerError};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Child;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const STOPPED_BY_USER_LOG_LINE: &str = "Streaming stopped by user.";
pub const NO_ACTIVE_PROCESS_LOG_LINE: &str = "No active encoder process.";

const WAIT_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// The last job's process has exited and its handle is cleared; a new start is allowed.
    Terminated,
}

impl JobState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Signaled,
    NoActiveProcess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub video_path: PathBuf,
    pub mode: OutputMode,
    pub started_at_ms: i64,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub exit_code: Option<i32>,
    pub stopped_by_user: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub video_path: PathBuf,
    pub stream_key: String,
    pub mode: OutputMode,
}

#[derive(Debug)]
pub(crate) struct JobSlot {
    pub(crate) state: JobState,
    pub(crate) job: Option<JobInfo>,
    pub(crate) process: Option<Child>,
    pub(crate) worker: Option<JoinHandle<()>>,
    /// Encoder PIDs launched here whose exit was never collected.
    pub(crate) unreaped_pids: Vec<u32>,
    pub(crate) stop_requested: bool,
    pub(crate) last_outcome: Option<JobOutcome>,
}

impl JobSlot {
    /// Drops a PID whose exit status has been collected; the OS may reuse it.
    pub(crate) fn forget_pid(&mut self, pid: u32) {
        self.unreaped_pids.retain(|p| *p != pid);
    }
}

#[derive(Debug)]
pub(crate) struct SharedJob {
    slot: Mutex<JobSlot>,
}

impl SharedJob {
    fn new() -> Self {
        Self {
            slot: Mutex::new(JobSlot {
                state: JobState::Idle,
                job: None,
                process: None,
                worker: None,
                unreaped_pids: Vec::new(),
                stop_requested: false,
                last_outcome: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, JobSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of the single streaming job. `start` and `stop` are the only mutation points.
///
/// Callers must check `tools::probe` before starting jobs.
#[derive(Debug)]
pub struct JobController {
    paths: AppPaths,
    config: StreamerConfig,
    log: LogSink,
    shared: Arc<SharedJob>,
}

impl JobController {
    pub fn new(paths: AppPaths, config: StreamerConfig, log: LogSink) -> Self {
        Self {
            paths,
            config,
            log,
            shared: Arc::new(SharedJob::new()),
        }
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    pub fn state(&self) -> JobState {
        self.shared.lock().state
    }

    pub fn current_job(&self) -> Option<JobInfo> {
        let slot = self.shared.lock();
        if slot.state.is_active() {
            slot.job.clone()
        } else {
            None
        }
    }

    /// PID of the tracked encoder process, if one is held.
    pub fn active_pid(&self) -> Option<u32> {
        self.shared.lock().process.as_ref().map(Child::id)
    }

    pub fn last_outcome(&self) -> Option<JobOutcome> {
        self.shared.lock().last_outcome.clone()
    }

    /// Launches the encoder on a worker thread and returns once its handle is
    /// tracked. Rejects the request while another job is active.
    pub fn start(&self, request: StartRequest) -> Result<JobInfo> {
        if request.video_path.as_os_str().is_empty() {
            return Err(StreamerError::Validation("no video selected".to_string()));
        }
        let key = StreamKey::new(request.stream_key)?;

        let job = JobInfo {
            id: Uuid::new_v4().to_string(),
            video_path: request.video_path,
            mode: request.mode,
            started_at_ms: now_ms(),
            pid: None,
        };

        {
            let mut slot = self.shared.lock();
            if slot.state.is_active() {
                let job_id = slot.job.as_ref().map(|j| j.id.clone()).unwrap_or_default();
                return Err(StreamerError::JobAlreadyActive { job_id });
            }
            slot.state = JobState::Starting;
            slot.job = Some(job.clone());
            slot.stop_requested = false;
            slot.worker = None;
        }

        let invocation = EncoderInvocation::for_stream(
            self.config.encoder_program(&self.paths),
            &self.config.encoder,
            &self.config.ingest_base_url,
            &job.video_path,
            &key,
            job.mode,
        );
        self.log.set_mirror(Some(self.paths.job_log_path(&job.id)));
        tracing::info!(job_id = %job.id, video = %job.video_path.display(), mode = ?job.mode, "starting stream job");

        let supervisor = StreamJobSupervisor::new(
            self.shared.clone(),
            self.log.clone(),
            invocation,
            job.id.clone(),
            self.config.redact_stream_key,
        );
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("restream-supervisor".to_string())
            .spawn(move || supervisor.run(tx));
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                let mut slot = self.shared.lock();
                slot.state = JobState::Idle;
                slot.job = None;
                self.log.set_mirror(None);
                return Err(StreamerError::Process(format!(
                    "failed to spawn supervisor thread: {e}"
                )));
            }
        };
        self.shared.lock().worker = Some(worker);

        match rx.recv() {
            Ok(Launch::Published { pid }) => Ok(JobInfo {
                pid: Some(pid),
                ..job
            }),
            Ok(Launch::Failed(e)) => Err(e),
            Err(_) => Err(StreamerError::Process(
                "supervisor exited before launching the encoder".to_string(),
            )),
        }
    }

    /// Requests graceful termination of the tracked encoder.
    ///
    /// Without a live handle this falls back to `config.fallback_kill` and
    /// reports `NoActiveProcess`.
    pub fn stop(&self) -> StopOutcome {
        let signaled = {
            let mut slot = self.shared.lock();
            let job_id = slot.job.as_ref().map(|j| j.id.clone()).unwrap_or_default();
            let mut reaped = None;
            let target = match slot.process.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(None) => Some(child.id()),
                    Ok(Some(_)) => {
                        reaped = Some(child.id());
                        None
                    }
                    Err(_) => None,
                },
                None => None,
            };
            if let Some(pid) = reaped {
                slot.forget_pid(pid);
            }
            match target {
                Some(pid) => match crate::cmd::terminate_pid(pid) {
                    Ok(()) => {
                        slot.state = JobState::Stopping;
                        slot.stop_requested = true;
                        Some((job_id, pid))
                    }
                    Err(e) => {
                        tracing::warn!(pid, "failed to signal encoder: {e}");
                        None
                    }
                },
                None => None,
            }
        };

        match signaled {
            Some((job_id, pid)) => {
                tracing::info!(%job_id, pid, "stop requested by user");
                self.log.append(STOPPED_BY_USER_LOG_LINE);
                if let Some(secs) = self.config.stop_grace_secs {
                    self.schedule_escalation(job_id, Duration::from_secs(secs));
                }
                StopOutcome::Signaled
            }
            None => {
                self.fallback_kill();
                tracing::warn!("stop requested with no active encoder process");
                self.log.append(NO_ACTIVE_PROCESS_LOG_LINE);
                StopOutcome::NoActiveProcess
            }
        }
    }

    /// Polls until no job is active. Returns `false` on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if !self.state().is_active() {
                return true;
            }
            if started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(WAIT_POLL_INTERVAL_MS));
        }
    }

    fn schedule_escalation(&self, job_id: String, grace: Duration) {
        let shared = self.shared.clone();
        let log = self.log.clone();
        let spawned = thread::Builder::new()
            .name("restream-stop-escalation".to_string())
            .spawn(move || {
                thread::sleep(grace);
                let mut slot = shared.lock();
                if slot.job.as_ref().map(|j| j.id.as_str()) != Some(job_id.as_str()) {
                    return;
                }
                let Some(child) = slot.process.as_mut() else {
                    return;
                };
                if let Ok(None) = child.try_wait() {
                    let pid = child.id();
                    if child.kill().is_ok() {
                        drop(slot);
                        tracing::warn!(%job_id, pid, "encoder ignored stop request; killed");
                        log.append(format!(
                            "Encoder did not exit within {}s; forced kill.",
                            grace.as_secs()
                        ));
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("failed to schedule stop escalation: {e}");
        }
    }

    fn fallback_kill(&self) {
        match self.config.fallback_kill {
            FallbackKill::Disabled => {}
            FallbackKill::SpawnedPids => {
                let pids = self.shared.lock().unreaped_pids.clone();
                for pid in pids {
                    match crate::cmd::terminate_pid(pid) {
                        Ok(()) => tracing::warn!(pid, "signaled orphaned encoder process"),
                        Err(e) => tracing::debug!(pid, "orphaned encoder not signaled: {e}"),
                    }
                }
            }
            FallbackKill::SystemWide => {
                let name = crate::encoder::process_name(&self.config.encoder_program(&self.paths));
                match crate::cmd::terminate_by_name(&name) {
                    Ok(matched) => tracing::warn!(name = %name, matched, "system-wide encoder termination"),
                    Err(e) => tracing::warn!(name = %name, "system-wide encoder termination failed: {e}"),
                }
            }
        }
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        let mut slot = self.shared.lock();
        let running = match slot.process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)).then(|| child.id()),
            None => None,
        };
        if let Some(pid) = running {
            let _ = crate::cmd::terminate_pid(pid);
            slot.stop_requested = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(dir: &std::path::Path) -> JobController {
        let paths = AppPaths::new(dir.to_path_buf());
        let mut config = StreamerConfig::default();
        config.encoder.program = Some(dir.join("missing-encoder").to_string_lossy().to_string());
        config.fallback_kill = FallbackKill::Disabled;
        JobController::new(paths, config, LogSink::new(100))
    }

    #[test]
    fn empty_stream_key_is_rejected_without_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let c = controller(dir.path());
        let err = c
            .start(StartRequest {
                video_path: PathBuf::from("a.mp4"),
                stream_key: "  ".to_string(),
                mode: OutputMode::Standard,
            })
            .expect_err("must fail");
        assert!(matches!(err, StreamerError::Validation(_)));
        assert_eq!(c.state(), JobState::Idle);
        assert!(c.shared.lock().worker.is_none());
        assert_eq!(c.log().appended(), 0);
    }

    #[test]
    fn empty_video_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let c = controller(dir.path());
        let err = c
            .start(StartRequest {
                video_path: PathBuf::new(),
                stream_key: "K1".to_string(),
                mode: OutputMode::Standard,
            })
            .expect_err("must fail");
        assert!(matches!(err, StreamerError::Validation(_)));
        assert_eq!(c.state(), JobState::Idle);
    }

    #[test]
    fn stop_without_job_reports_no_active_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let c = controller(dir.path());
        assert_eq!(c.stop(), StopOutcome::NoActiveProcess);
        assert_eq!(
            c.log().recent(1).lines().next(),
            Some(NO_ACTIVE_PROCESS_LOG_LINE)
        );
    }

    #[test]
    fn missing_encoder_fails_start_and_logs_terminal_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let c = controller(dir.path());
        let err = c
            .start(StartRequest {
                video_path: PathBuf::from("a.mp4"),
                stream_key: "K1".to_string(),
                mode: OutputMode::Standard,
            })
            .expect_err("must fail");
        assert!(matches!(err, StreamerError::BinaryNotFound { .. }));
        assert_eq!(c.state(), JobState::Terminated);
        assert_eq!(c.active_pid(), None);

        let lines: Vec<String> = c.log().recent(10).lines().map(str::to_string).collect();
        assert!(lines[0].starts_with("Running encoder:"));
        assert!(lines[0].ends_with("/live2/****"));
        assert_eq!(
            lines.iter().filter(|l| *l == crate::supervisor::TERMINAL_LOG_LINE).count(),
            1
        );
        let outcome = c.last_outcome().expect("outcome");
        assert!(outcome.error.is_some());
        assert!(!outcome.stopped_by_user);
    }

    #[cfg(unix)]
    fn with_fallback(dir: &std::path::Path, fallback: FallbackKill) -> JobController {
        let paths = AppPaths::new(dir.to_path_buf());
        let mut config = StreamerConfig::default();
        config.encoder.program = Some(dir.join("missing-encoder").to_string_lossy().to_string());
        config.fallback_kill = fallback;
        JobController::new(paths, config, LogSink::new(100))
    }

    #[cfg(unix)]
    fn wait_for_exit(child: &mut Child) -> Option<std::process::ExitStatus> {
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(10) {
            if let Ok(Some(status)) = child.try_wait() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }

    #[cfg(unix)]
    #[test]
    fn stop_forgets_a_pid_it_reaps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let c = with_fallback(dir.path(), FallbackKill::SpawnedPids);
        let child = crate::cmd::command("true").spawn().expect("spawn true");
        let pid = child.id();
        // Exited but not yet collected by anyone.
        thread::sleep(Duration::from_millis(300));
        {
            let mut slot = c.shared.lock();
            slot.state = JobState::Running;
            slot.process = Some(child);
            slot.unreaped_pids.push(pid);
        }

        assert_eq!(c.stop(), StopOutcome::NoActiveProcess);
        assert!(c.shared.lock().unreaped_pids.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn spawned_pids_fallback_signals_only_tracked_pids() {
        use std::os::unix::process::ExitStatusExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let c = with_fallback(dir.path(), FallbackKill::SpawnedPids);
        let mut orphan = crate::cmd::command("sleep").arg("30").spawn().expect("spawn orphan");
        let mut bystander = crate::cmd::command("sleep").arg("30").spawn().expect("spawn bystander");
        c.shared.lock().unreaped_pids.push(orphan.id());

        assert_eq!(c.stop(), StopOutcome::NoActiveProcess);

        let status = wait_for_exit(&mut orphan).expect("orphan exits");
        assert_eq!(status.signal(), Some(15));
        assert!(matches!(bystander.try_wait(), Ok(None)));
        bystander.kill().expect("kill bystander");
        let _ = bystander.wait();
    }

    #[cfg(unix)]
    #[test]
    fn disabled_fallback_signals_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let c = with_fallback(dir.path(), FallbackKill::Disabled);
        let mut orphan = crate::cmd::command("sleep").arg("30").spawn().expect("spawn orphan");
        c.shared.lock().unreaped_pids.push(orphan.id());

        assert_eq!(c.stop(), StopOutcome::NoActiveProcess);
        thread::sleep(Duration::from_millis(200));
        assert!(matches!(orphan.try_wait(), Ok(None)));
        orphan.kill().expect("kill orphan");
        let _ = orphan.wait();
    }

    #[cfg(unix)]
    #[test]
    fn system_wide_fallback_matches_encoder_name() {
        use std::os::unix::fs::PermissionsExt;

        if crate::cmd::command("pkill").arg("-V").output().is_err() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        // Short enough to fit the kernel's 15-byte process name.
        let name = format!("rsw{}", &Uuid::new_v4().simple().to_string()[..8]);
        let script = dir.path().join(&name);
        std::fs::write(&script, "#!/bin/sh\ntrap 'exit 0' TERM\nwhile true; do sleep 0.1; done\n")
            .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let paths = AppPaths::new(dir.path().to_path_buf());
        let mut config = StreamerConfig::default();
        config.encoder.program = Some(script.to_string_lossy().to_string());
        config.fallback_kill = FallbackKill::SystemWide;
        let c = JobController::new(paths, config, LogSink::new(100));

        // A concurrent fork may briefly hold the new script open for writing.
        let mut spawned = crate::cmd::command(&script).spawn();
        for _ in 0..5 {
            match &spawned {
                Err(e) if e.raw_os_error() == Some(26) => {
                    thread::sleep(Duration::from_millis(50));
                    spawned = crate::cmd::command(&script).spawn();
                }
                _ => break,
            }
        }
        let mut stray = spawned.expect("spawn stray encoder");
        thread::sleep(Duration::from_millis(200));
        assert_eq!(c.stop(), StopOutcome::NoActiveProcess);

        let status = wait_for_exit(&mut stray).expect("stray encoder exits");
        assert_eq!(status.code(), Some(0));
    }

    #[test]
    fn terminated_state_is_not_active() {
        assert!(!JobState::Terminated.is_active());
        assert!(!JobState::Idle.is_active());
        assert!(JobState::Stopping.is_active());
    }
}
