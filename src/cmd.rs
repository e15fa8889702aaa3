use crate::StreamerError;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Stdio};

/// Command for a background tool: no console window, no inherited stdin.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null());
    configure_for_background(&mut cmd);
    cmd
}

/// Maps a spawn failure onto the error taxonomy; a missing binary is fatal
/// for streaming, anything else is a process error.
pub fn launch_error(program: &Path, err: std::io::Error) -> StreamerError {
    match err.kind() {
        std::io::ErrorKind::NotFound => StreamerError::BinaryNotFound {
            program: program.to_string_lossy().to_string(),
        },
        _ => StreamerError::Process(format!(
            "failed to launch {}: {err}",
            program.to_string_lossy()
        )),
    }
}

/// Asks a process to exit (SIGTERM on unix). Does not wait or escalate.
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)?;
    Ok(())
}

#[cfg(windows)]
pub fn terminate_pid(pid: u32) -> std::io::Result<()> {
    let status = command("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}

/// Best-effort termination of every process named `name`, including ones
/// this process never launched.
pub fn terminate_by_name(name: &str) -> std::io::Result<bool> {
    let mut cmd = if cfg!(windows) {
        let mut c = command("taskkill");
        c.args(["/IM", &format!("{name}.exe"), "/T"]);
        c
    } else {
        let mut c = command("pkill");
        c.args(["-TERM", "-x", name]);
        c
    };
    let status = cmd.stdout(Stdio::null()).stderr(Stdio::null()).status()?;
    Ok(status.success())
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}
