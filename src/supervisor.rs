use crate::controller::{JobOutcome, JobState, SharedJob};
use crate::encoder::EncoderInvocation;
use crate::log_sink::LogSink;
use crate::{Result, StreamerError};
use std::io::{BufRead, BufReader, Read};
use std::process::{ExitStatus, Stdio};
use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const TERMINAL_LOG_LINE: &str = "Streaming ended or stopped.";

/// Lines buffered between the pipe readers and the log sink.
const LINE_BUFFER: usize = 256;
const REAP_POLL_INTERVAL_MS: u64 = 200;

/// Reported back to `JobController::start` once the encoder is launched (or not).
#[derive(Debug)]
pub(crate) enum Launch {
    Published { pid: u32 },
    Failed(StreamerError),
}

/// Runs one encoder process to completion on its own worker thread.
///
/// The child is spawned and published into the shared slot under the same lock,
/// before any output is read, so a stop issued after start returns always finds it.
pub struct StreamJobSupervisor {
    shared: Arc<SharedJob>,
    log: LogSink,
    invocation: EncoderInvocation,
    job_id: String,
    redact_key: bool,
}

impl StreamJobSupervisor {
    pub(crate) fn new(
        shared: Arc<SharedJob>,
        log: LogSink,
        invocation: EncoderInvocation,
        job_id: String,
        redact_key: bool,
    ) -> Self {
        Self {
            shared,
            log,
            invocation,
            job_id,
            redact_key,
        }
    }

    pub(crate) fn run(self, launched: Sender<Launch>) {
        let shown = if self.redact_key {
            self.invocation.redacted_command_line()
        } else {
            self.invocation.command_line()
        };
        self.log.append(format!("Running encoder: {shown}"));

        let (pid, pipes) = match self.launch() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(job_id = %self.job_id, "encoder launch failed: {e}");
                self.log.append(format!("Error: {e}"));
                self.log.append(TERMINAL_LOG_LINE);
                self.finish(None, Some(e.to_string()));
                let _ = launched.send(Launch::Failed(e));
                return;
            }
        };
        tracing::info!(job_id = %self.job_id, pid, "encoder started");
        let _ = launched.send(Launch::Published { pid });

        self.forward_output(pipes);

        let (exit_code, error) = match self.reap() {
            Ok(status) => {
                tracing::info!(job_id = %self.job_id, %status, "encoder exited");
                self.log.append(format!("Encoder exited ({status})"));
                (status.code(), None)
            }
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, "encoder wait failed: {e}");
                self.log.append(format!("Error: {e}"));
                (None, Some(e.to_string()))
            }
        };
        self.log.append(TERMINAL_LOG_LINE);
        self.finish(exit_code, error);
    }

    fn launch(&self) -> Result<(u32, Pipes)> {
        let mut cmd = self.invocation.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut slot = self.shared.lock();
        let mut child = cmd
            .spawn()
            .map_err(|e| crate::cmd::launch_error(self.invocation.program(), e))?;
        let pipes = Pipes {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };
        let pid = child.id();

        slot.process = Some(child);
        slot.unreaped_pids.push(pid);
        slot.state = JobState::Running;
        if let Some(job) = slot.job.as_mut() {
            job.pid = Some(pid);
        }
        Ok((pid, pipes))
    }

    /// Blocks until both pipes close, forwarding each line to the log as it arrives.
    fn forward_output(&self, pipes: Pipes) {
        let (tx, rx) = mpsc::sync_channel::<String>(LINE_BUFFER);
        let mut readers = Vec::new();
        if let Some(stdout) = pipes.stdout {
            let tx = tx.clone();
            readers.push(thread::spawn(move || forward_lines(stdout, tx)));
        }
        if let Some(stderr) = pipes.stderr {
            let tx = tx.clone();
            readers.push(thread::spawn(move || forward_lines(stderr, tx)));
        }
        drop(tx);

        for line in rx {
            self.log.append(line);
        }
        for reader in readers {
            let _ = reader.join();
        }
    }

    fn reap(&self) -> Result<ExitStatus> {
        loop {
            {
                let mut slot = self.shared.lock();
                let owned = slot.job.as_ref().map(|j| j.id.as_str()) == Some(self.job_id.as_str());
                let child = match slot.process.as_mut() {
                    Some(child) if owned => child,
                    _ => {
                        return Err(StreamerError::Process(
                            "encoder handle is no longer tracked".to_string(),
                        ))
                    }
                };
                let pid = child.id();
                match child.try_wait() {
                    Ok(Some(status)) => {
                        slot.forget_pid(pid);
                        return Ok(status);
                    }
                    Ok(None) => {}
                    Err(e) => return Err(StreamerError::Process(format!("wait failed: {e}"))),
                }
            }
            thread::sleep(Duration::from_millis(REAP_POLL_INTERVAL_MS));
        }
    }

    fn finish(&self, exit_code: Option<i32>, error: Option<String>) {
        let mut slot = self.shared.lock();
        if slot.job.as_ref().map(|j| j.id.as_str()) != Some(self.job_id.as_str()) {
            return;
        }
        if let Some(mut child) = slot.process.take() {
            if matches!(child.try_wait(), Ok(Some(_))) {
                slot.forget_pid(child.id());
            }
        }
        slot.last_outcome = Some(JobOutcome {
            job_id: self.job_id.clone(),
            exit_code,
            stopped_by_user: slot.stop_requested,
            error,
        });
        slot.state = JobState::Terminated;
        self.log.set_mirror(None);
    }
}

struct Pipes {
    stdout: Option<std::process::ChildStdout>,
    stderr: Option<std::process::ChildStderr>,
}

fn forward_lines<R: Read>(reader: R, tx: SyncSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut splitter = LineSplitter::default();
    loop {
        let (lines, len) = match reader.fill_buf() {
            Ok([]) => break,
            Ok(buf) => (splitter.push(buf), buf.len()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        reader.consume(len);
        for line in lines {
            if tx.send(line).is_err() {
                return;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        let _ = tx.send(line);
    }
}

/// Splits a byte stream on `\n` and `\r`; encoders redraw progress with bare carriage returns.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                if let Some(line) = self.take_line() {
                    out.push(line);
                }
            } else {
                self.pending.push(b);
            }
        }
        out
    }

    fn finish(mut self) -> Option<String> {
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_handles_carriage_returns_and_partial_chunks() {
        let mut s = LineSplitter::default();
        assert_eq!(s.push(b"ffmpeg version 7\nframe=  1\rfra"), vec!["ffmpeg version 7", "frame=  1"]);
        assert_eq!(s.push(b"me=  2\r\n\r\n"), vec!["frame=  2"]);
        assert_eq!(s.push(b"  tail  "), Vec::<String>::new());
        assert_eq!(s.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn splitter_drops_blank_lines_and_tolerates_invalid_utf8() {
        let mut s = LineSplitter::default();
        assert_eq!(s.push(b"\n\n   \n"), Vec::<String>::new());
        let lines = s.push(b"bad \xff byte\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("bad "));
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn forward_lines_sends_every_line() {
        let (tx, rx) = mpsc::sync_channel(4);
        let input: &[u8] = b"one\ntwo\rthree";
        let handle = thread::spawn(move || forward_lines(input, tx));
        let got: Vec<String> = rx.iter().collect();
        handle.join().expect("join");
        assert_eq!(got, vec!["one", "two", "three"]);
    }
}
