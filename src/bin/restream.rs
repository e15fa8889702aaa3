use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::{ArgGroup, Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use restream_engine::acquire::{self, AcquisitionProgress};
use restream_engine::config::{self, StreamerConfig};
use restream_engine::controller::{JobController, StartRequest, StopOutcome};
use restream_engine::encoder::OutputMode;
use restream_engine::log_sink::LogSink;
use restream_engine::paths::{AppPaths, BASE_DIR_ENV_VAR};
use restream_engine::{library, tools};

const POLL_INTERVAL_MS: u64 = 200;
/// Extra time allowed after the stop grace period before giving up on a clean exit.
const EXIT_SLACK_SECS: u64 = 5;

#[derive(Parser)]
#[command(name = "restream")]
#[command(about = "Loop a local or downloaded video to a live ingest endpoint")]
#[command(version)]
struct Cli {
    /// Directory holding config/, uploaded_videos/, logs/ and tools/.
    #[arg(long, global = true, env = BASE_DIR_ENV_VAR)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether the encoder can be launched
    Check,
    /// Download a static ffmpeg build into tools/ffmpeg
    Setup,
    /// List videos in the local library
    List,
    /// Delete stale videos and job logs
    Sweep,
    /// Stream a video until Enter is pressed or the encoder exits
    Stream(StreamArgs),
}

#[derive(Args)]
#[command(group(ArgGroup::new("source").required(true).args(["file", "url", "video"])))]
struct StreamArgs {
    /// Copy a local file into the library and stream it
    #[arg(long)]
    file: Option<PathBuf>,

    /// Download a video (Drive share links accepted) and stream it
    #[arg(long)]
    url: Option<String>,

    /// Stream a file already in the library
    #[arg(long)]
    video: Option<String>,

    #[arg(long, env = "RESTREAM_STREAM_KEY", hide_env_values = true)]
    key: String,

    /// Portrait output for Shorts
    #[arg(long)]
    shorts: bool,
}

fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = match cli.base_dir {
        Some(dir) => AppPaths::new(dir),
        None => AppPaths::from_env().map_err(|e| e.to_string())?,
    };
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    let config = config::load_config(&paths).map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Check => check(&paths, &config),
        Commands::Setup => setup(&paths),
        Commands::List => list(&paths),
        Commands::Sweep => sweep(&paths, &config),
        Commands::Stream(args) => stream(paths, config, args),
    }
}

fn check(paths: &AppPaths, config: &StreamerConfig) -> Result<(), String> {
    let program = config.encoder_program(paths);
    let status = tools::probe_status(&program);
    println!("Encoder: {}", program.to_string_lossy());
    println!(
        "Status: {}",
        serde_json::to_string(&status).map_err(|e| e.to_string())?
    );
    if status.is_invocable() {
        Ok(())
    } else {
        Err("encoder is not available (run `restream setup`)".to_string())
    }
}

fn setup(paths: &AppPaths) -> Result<(), String> {
    println!("Installing ffmpeg into {}", paths.ffmpeg_dir().to_string_lossy());
    let status = tools::install_encoder(paths).map_err(|e| e.to_string())?;
    println!(
        "Status: {}",
        serde_json::to_string(&status).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn list(paths: &AppPaths) -> Result<(), String> {
    let videos = library::list_local_videos(paths).map_err(|e| e.to_string())?;
    if videos.is_empty() {
        println!("No videos in {}", paths.videos_dir().to_string_lossy());
    }
    for video in videos {
        println!(
            "{}\t{:.1} MB",
            video.file_name,
            video.size_bytes as f64 / (1024.0 * 1024.0)
        );
    }
    Ok(())
}

fn sweep(paths: &AppPaths, config: &StreamerConfig) -> Result<(), String> {
    let summary = library::sweep_session(paths, config).map_err(|e| e.to_string())?;
    println!(
        "Removed {} video(s) and {} job log(s)",
        summary.videos_removed, summary.job_logs_removed
    );
    Ok(())
}

fn stream(paths: AppPaths, config: StreamerConfig, args: StreamArgs) -> Result<(), String> {
    // Streaming stays disabled until the encoder is known to launch.
    tools::require_encoder(&paths, &config).map_err(|e| e.to_string())?;
    if let Err(e) = library::sweep_session(&paths, &config) {
        tracing::warn!("session sweep failed: {e}");
    }

    let log = LogSink::new(config.log_capacity);
    let video_path = acquire_video(&paths, &config, &log, &args)?;
    let mode = if args.shorts {
        OutputMode::Vertical
    } else {
        OutputMode::Standard
    };

    let window = config.log_window;
    let wait_limit =
        Duration::from_secs(config.stop_grace_secs.unwrap_or(0) + EXIT_SLACK_SECS);
    let controller = JobController::new(paths, config, log);
    let mut printed = print_new_lines(&controller, window, None);
    let job = controller
        .start(StartRequest {
            video_path,
            stream_key: args.key,
            mode,
        })
        .map_err(|e| {
            print_new_lines(&controller, window, printed);
            e.to_string()
        })?;
    println!(
        "Streaming {} (job {}, pid {}). Press Enter to stop.",
        job.video_path.to_string_lossy(),
        job.id,
        job.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
    );

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        if enter_pressed(&mut std::io::stdin().lock()) {
            let _ = stop_tx.send(());
        }
    });

    let mut stop_sent = false;
    while controller.state().is_active() {
        printed = print_new_lines(&controller, window, printed);
        if !stop_sent && stop_rx.try_recv().is_ok() {
            stop_sent = true;
            if controller.stop() == StopOutcome::Signaled && !controller.wait_until_idle(wait_limit) {
                tracing::warn!("encoder still running after stop");
            }
        }
        thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
    }
    print_new_lines(&controller, window, printed);

    match controller.last_outcome() {
        Some(outcome) => {
            println!(
                "Job {} ended (exit code {}, stopped by user: {})",
                outcome.job_id,
                outcome
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                outcome.stopped_by_user
            );
            match outcome.error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        None => Ok(()),
    }
}

fn acquire_video(
    paths: &AppPaths,
    config: &StreamerConfig,
    log: &LogSink,
    args: &StreamArgs,
) -> Result<PathBuf, String> {
    let mut report = |p: AcquisitionProgress| {
        eprint!("\r{}", p.describe());
    };

    if let Some(file) = &args.file {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| format!("not a file: {}", file.to_string_lossy()))?;
        let dest = library::upload_destination(paths, &name).map_err(|e| e.to_string())?;
        let mut reader = std::fs::File::open(file).map_err(|e| e.to_string())?;
        let saved = acquire::save_upload(&mut reader, &dest, &mut report)
            .map_err(|e| e.to_string())?;
        eprintln!();
        return Ok(saved);
    }

    if let Some(url) = &args.url {
        let dest = library::url_destination(paths, url);
        let timeout = Duration::from_secs(config.download_timeout_secs);
        let ok = acquire::download_from_url(url, &dest, log, timeout, &mut report);
        eprintln!();
        return if ok {
            Ok(dest)
        } else {
            Err("download failed".to_string())
        };
    }

    match &args.video {
        Some(name) => library::find_local_video(paths, name).map_err(|e| e.to_string()),
        None => Err("no video selected".to_string()),
    }
}

/// True once a line arrives. EOF (e.g. stdin from /dev/null) is not a stop request.
fn enter_pressed<R: BufRead>(input: &mut R) -> bool {
    let mut line = String::new();
    matches!(input.read_line(&mut line), Ok(n) if n > 0)
}

/// Prints entries newer than `after` from the display window; returns the last printed sequence.
fn print_new_lines(controller: &JobController, window: usize, after: Option<u64>) -> Option<u64> {
    let mut last = after;
    for entry in &controller.log().recent(window) {
        if after.is_some_and(|seq| entry.seq <= seq) {
            continue;
        }
        println!("{}", entry.text);
        last = Some(entry.seq);
    }
    last
}
