use clap::Parser;
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glitch_harness::prelude::*;

use git_version::git_version;
const GIT_VERSION: &str = git_version!(args = ["--always", "--dirty"], fallback = "unknown");

/// Command line parameter structure
///
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device model under test
    #[arg(value_enum)]
    device: DeviceType,

    /// Task to run after the device is ready. Without a task the device is
    /// only rebooted and configured
    #[arg(short, long, value_enum)]
    task: Option<TaskKind>,

    /// ADB serial of the device. Defaults to the serial of the device table
    #[arg(short, long)]
    serial: Option<String>,

    /// JSON5 device description replacing the built-in table
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory receiving the result logs
    #[arg(long, default_value = "log")]
    log_dir: PathBuf,

    /// Working directory of the session
    #[arg(long, default_value = "session")]
    session_dir: PathBuf,

    /// Resume the sweep from the LAST values of the task profile
    #[arg(short, long, default_value_t = false)]
    resume: bool,
}

fn create_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path).map_err(|e| format!("Cannot create directory {}: {}", path.display(), e))
}

/// Load the device description and apply the command line overrides
fn load_config(args: &Args) -> Result<DeviceConfig, String> {
    let mut cfg = match &args.config {
        Some(path) => {
            let cfg = DeviceConfig::from_file(path)?;
            if cfg.device_type != args.device {
                return Err(format!(
                    "Config file {} describes {}, not {}",
                    path.display(),
                    cfg.device_type,
                    args.device
                ));
            }
            cfg
        }
        None => DeviceConfig::builtin(args.device),
    };
    if let Some(serial) = &args.serial {
        cfg = cfg.with_serial(serial);
    }
    if let (true, Some(kind)) = (args.resume, args.task) {
        let profile = match kind {
            TaskKind::PdelayProfiling => &mut cfg.profiles.pdelay_profile,
            TaskKind::GlitchProfiling => &mut cfg.profiles.glitch_profile,
            TaskKind::RsaAuth => &mut cfg.profiles.glitch_rsa,
            TaskKind::GlitchExpt => &mut cfg.profiles.glitch_expt,
        };
        if let Some(profile) = profile {
            profile.resume = true;
        }
    }
    Ok(cfg)
}

/// Glitch harness driving clock and voltage fault injection on Android
/// devices over ADB
///
fn main() -> Result<(), String> {
    // Get parameter from command line
    let args = Args::parse();
    env_logger::init(); // Switch on with: RUST_LOG=info cargo run

    let banner = format!("--- Glitch harness: {GIT_VERSION} ---\n");
    println!("{}", banner.as_str().bold());

    create_dir(&args.log_dir)?;
    create_dir(&args.session_dir)?;

    let cfg = load_config(&args)?;
    println!("Device: {} ({})", cfg.device_type, cfg.device_id);

    // Resolve the task before touching the device
    let mut task = match args.task {
        Some(kind) => Some(create_task(kind, &cfg, &args.log_dir)?),
        None => None,
    };

    let transport = AdbTransport::new(&cfg);
    transport.verify_tools()?;

    let mut engine = Engine::new(cfg, Arc::new(transport), Arc::new(SystemClock));
    engine.reboot_until_ready()?;

    match task.as_mut() {
        Some(task) => {
            println!("\nRun task {}:", task.kind());
            task.run(&mut engine)?;
            let done = format!("Task {} completed", task.kind());
            println!("{}", done.as_str().bold());
        }
        None => println!("No task selected, device is ready."),
    }
    Ok(())
}
