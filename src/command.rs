use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, error, warn};
use std::process::{Command, Stdio};
use std::thread::{sleep, spawn};
use std::time::Duration;

/// Output fragments which indicate that the ADB link failed rather than the command
pub const TRANSIENT_MARKERS: [&str; 3] = [
    "error: device not found",
    "daemon not running",
    "error: protocol fault (no status)",
];

/// Number of attempts for a remote command hitting a transport error
pub const MAX_TRANSPORT_TRIES: usize = 10;

/// Delay between two attempts after a transport error
pub const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default wall-clock limit of a bounded command
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal or timed out
    pub status: Option<i32>,
    /// Combined stdout and stderr
    pub output: String,
    /// Command did not finish before its deadline
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn new(status: Option<i32>, output: &str) -> Self {
        Self {
            status,
            output: output.to_string(),
            timed_out: false,
        }
    }

    /// Result reported for a command that hit its deadline
    pub fn timed_out() -> Self {
        Self {
            status: None,
            output: String::new(),
            timed_out: true,
        }
    }

    /// Finished in time with exit code 0
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }
}

/// Check command output for one of the transport error markers
pub fn is_transient(output: &str) -> bool {
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| output.contains(marker))
}

/// Execute a program and capture exit code plus combined stdout/stderr.
pub fn exec_status_output(program: &str, args: &[String]) -> std::io::Result<(Option<i32>, String)> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok((output.status.code(), text))
}

/// Repeat `attempt` while its output carries a transport error marker.
///
/// # Arguments
///
/// * `description` - Command line used in log messages.
/// * `delay` - Pause between two attempts.
/// * `attempt` - Executes the command once.
///
/// # Returns
///
/// * `Ok(CommandOutput)` - First output without a transport error marker (trimmed).
/// * `Err(String)` - The command could not be spawned, or all
///   `MAX_TRANSPORT_TRIES` attempts failed. The device is presumed offline.
pub fn retry_transient<F>(description: &str, delay: Duration, mut attempt: F) -> Result<CommandOutput, String>
where
    F: FnMut() -> std::io::Result<(Option<i32>, String)>,
{
    for n_tries in 1..=MAX_TRANSPORT_TRIES {
        let (status, output) = attempt()
            .map_err(|e| format!("Failed to execute <{}>: {}", description, e))?;
        if !is_transient(&output) {
            return Ok(CommandOutput::new(status, output.trim()));
        }
        warn!(
            "Transport error (try {}/{}) <{}>: {}",
            n_tries,
            MAX_TRANSPORT_TRIES,
            description,
            output.trim()
        );
        if n_tries < MAX_TRANSPORT_TRIES {
            sleep(delay);
        }
    }
    error!("Phone likely offline: <{}>", description);
    Err(format!(
        "Device unreachable after {} attempts: <{}>",
        MAX_TRANSPORT_TRIES, description
    ))
}

/// Kill every process whose command line matches `pname`.
///
/// The remote-shell wrapper may already be gone while the command it started
/// is still stuck, so processes are matched by name and not by PID.
///
/// # Returns
///
/// * `usize` - Number of killed processes as reported by `pkill -c`.
pub fn force_kill_by_name(pname: &str) -> usize {
    let args = ["-c", "-9", "-f", pname].map(String::from);
    match exec_status_output("pkill", &args) {
        Ok((_, output)) => match output.trim().parse::<usize>() {
            Ok(0) => {
                warn!("force_kill: did not kill process <{}>", pname);
                0
            }
            Ok(count) => {
                if count > 1 {
                    warn!("force_kill: killed more than 1 instance of <{}>: {}", pname, count);
                }
                count
            }
            Err(_) => {
                error!("force_kill: unexpected pkill output: {:?}", output.trim());
                0
            }
        },
        Err(e) => {
            error!("force_kill: cannot run pkill for <{}>: {}", pname, e);
            0
        }
    }
}

/// Run `job` on a worker thread and wait at most `timeout` for it.
///
/// On timeout all processes matching `kill_name` are force-killed and a
/// timed-out `CommandOutput` is returned. The worker is left to finish on
/// its own once its process is gone.
fn run_bounded<F>(
    kill_name: &str,
    description: &str,
    timeout: Duration,
    quiet: bool,
    job: F,
) -> Result<CommandOutput, String>
where
    F: FnOnce() -> Result<CommandOutput, String> + Send + 'static,
{
    let (sender, receiver) = bounded(1);
    spawn(move || {
        // Receiver is gone after a timeout
        let _ = sender.send(job());
    });

    match receiver.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            force_kill_by_name(kill_name);
            if !quiet {
                error!("Command has timed out! Force-killing <{}>", kill_name);
                error!("     ({})", description);
            }
            Ok(CommandOutput::timed_out())
        }
        Err(RecvTimeoutError::Disconnected) => Err(format!(
            "Worker of <{}> terminated without result",
            description
        )),
    }
}

/// Local OS-level command with a wall-clock limit
#[derive(Debug, Clone)]
pub struct LocalCommand {
    argv: Vec<String>,
    timeout: Duration,
}

impl LocalCommand {
    /// Create a command from a whitespace separated command line
    pub fn new(command_line: &str) -> Self {
        Self::from_argv(command_line.split_whitespace().map(String::from).collect())
    }

    pub fn from_argv(argv: Vec<String>) -> Self {
        Self {
            argv,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program name, used to force-kill the command on timeout
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    /// Execute the command.
    ///
    /// # Returns
    ///
    /// * `Ok(CommandOutput)` - Exit status and output, or `timed_out` set when
    ///   the deadline was hit.
    /// * `Err(String)` - The command line is empty or the program cannot be spawned.
    pub fn run(&self) -> Result<CommandOutput, String> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| "Empty command line".to_string())?;
        let description = self.argv.join(" ");
        debug!("exec: {}", description);

        let job_program = program.clone();
        let job_args = args.to_vec();
        let job_description = description.clone();
        run_bounded(program, &description, self.timeout, false, move || {
            exec_status_output(&job_program, &job_args)
                .map(|(status, output)| CommandOutput::new(status, output.trim()))
                .map_err(|e| format!("Failed to execute <{}>: {}", job_description, e))
        })
    }
}

/// Arguments of `<adb> -s <id> shell su -c "<command>"`
pub fn shell_argv(device_id: &str, command: &str) -> Vec<String> {
    vec![
        "-s".to_string(),
        device_id.to_string(),
        "shell".to_string(),
        "su".to_string(),
        "-c".to_string(),
        format!("\"{}\"", command),
    ]
}

/// Command executed on the device through the remote shell
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    adb_program: String,
    device_id: String,
    command: String,
    timeout: Duration,
    quiet: bool,
}

impl RemoteCommand {
    pub fn new(adb_program: &str, device_id: &str, command: &str) -> Self {
        Self {
            adb_program: adb_program.to_string(),
            device_id: device_id.to_string(),
            command: command.to_string(),
            timeout: DEFAULT_TIMEOUT,
            quiet: false,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Suppress the timeout report, for commands expected to run into their deadline
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn description(&self) -> String {
        format!("{} {}", self.adb_program, shell_argv(&self.device_id, &self.command).join(" "))
    }

    /// Execute once without deadline, retrying on transport errors.
    ///
    /// # Returns
    ///
    /// * `Ok(CommandOutput)` - Exit status and trimmed output.
    /// * `Err(String)` - The device did not answer after `MAX_TRANSPORT_TRIES` attempts.
    pub fn run_once(&self) -> Result<CommandOutput, String> {
        let description = self.description();
        debug!("adb: {}", description);
        let args = shell_argv(&self.device_id, &self.command);
        retry_transient(&description, TRANSPORT_RETRY_DELAY, || {
            exec_status_output(&self.adb_program, &args)
        })
    }

    /// Execute with the configured deadline.
    ///
    /// On timeout all processes named like the ADB program are killed and the
    /// returned output has `timed_out` set.
    ///
    /// # Returns
    ///
    /// * `Ok(CommandOutput)` - Outcome of the command.
    /// * `Err(String)` - The device did not answer after `MAX_TRANSPORT_TRIES` attempts.
    pub fn run(&self) -> Result<CommandOutput, String> {
        let description = self.description();
        let job = self.clone();
        run_bounded(
            &self.adb_program,
            &description,
            self.timeout,
            self.quiet,
            move || job.run_once(),
        )
    }
}
