use crate::command::{force_kill_by_name, shell_argv, CommandOutput, LocalCommand, RemoteCommand};
use crate::config::DeviceConfig;
use log::debug;
use std::env;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

/// Access to one device through its remote shell.
///
/// The engine and the kernel-log monitor only talk to the device through this
/// trait, so tests can substitute a scripted device.
pub trait Transport: Send + Sync {
    /// Serial of the device
    fn device_id(&self) -> &str;

    /// Run `<adb> -s <id> <args>` on the host with a deadline
    fn host(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput, String>;

    /// Run `<adb> devices` on the host with a deadline. Addresses the ADB
    /// server, not one device.
    fn list_devices(&self, timeout: Duration) -> Result<CommandOutput, String>;

    /// Run a shell command on the device with a deadline.
    /// `quiet` suppresses the timeout report.
    fn shell(&self, command: &str, timeout: Duration, quiet: bool) -> Result<CommandOutput, String>;

    /// Run a shell command on the device without deadline
    fn shell_once(&self, command: &str) -> Result<CommandOutput, String>;

    /// Start a long running shell command through the stream program and
    /// return its stdout as a line reader
    fn open_stream(&self, command: &str) -> Result<Box<dyn BufRead + Send>, String>;

    /// Kill all instances of the stream program
    fn kill_stream(&self) -> usize;
}

/// Transport over the `adb` command line client.
///
/// General commands and the kernel-log stream use two differently named
/// copies of the client, so the stream can be killed by name without
/// disturbing the other commands.
#[derive(Debug, Clone)]
pub struct AdbTransport {
    device_id: String,
    adb_program: String,
    kmsg_program: String,
}

impl AdbTransport {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            adb_program: config.adb_program.clone(),
            kmsg_program: config.kmsg_program.clone(),
        }
    }

    /// Check that both ADB client copies can be found
    pub fn verify_tools(&self) -> Result<(), String> {
        for program in [&self.adb_program, &self.kmsg_program] {
            match find_in_path(program) {
                Some(path) => debug!("Found {} at {}", program, path.display()),
                None => {
                    return Err(format!(
                        "{} not found in PATH (copy of the adb client expected)",
                        program
                    ))
                }
            }
        }
        Ok(())
    }
}

impl Transport for AdbTransport {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn host(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput, String> {
        let mut argv = vec![
            self.adb_program.clone(),
            "-s".to_string(),
            self.device_id.clone(),
        ];
        argv.extend(args.iter().map(|arg| arg.to_string()));
        LocalCommand::from_argv(argv).timeout(timeout).run()
    }

    fn list_devices(&self, timeout: Duration) -> Result<CommandOutput, String> {
        LocalCommand::from_argv(vec![self.adb_program.clone(), "devices".to_string()])
            .timeout(timeout)
            .run()
    }

    fn shell(&self, command: &str, timeout: Duration, quiet: bool) -> Result<CommandOutput, String> {
        RemoteCommand::new(&self.adb_program, &self.device_id, command)
            .timeout(timeout)
            .quiet(quiet)
            .run()
    }

    fn shell_once(&self, command: &str) -> Result<CommandOutput, String> {
        RemoteCommand::new(&self.adb_program, &self.device_id, command).run_once()
    }

    fn open_stream(&self, command: &str) -> Result<Box<dyn BufRead + Send>, String> {
        let mut child = Command::new(&self.kmsg_program)
            .args(shell_argv(&self.device_id, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("Failed to start {}: {}", self.kmsg_program, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| format!("No stdout on {}", self.kmsg_program))?;

        Ok(Box::new(ChildStream {
            reader: BufReader::new(stdout),
            child,
        }))
    }

    fn kill_stream(&self) -> usize {
        force_kill_by_name(&self.kmsg_program)
    }
}

/// Stdout of a streaming child process. The child is reaped on drop.
struct ChildStream {
    reader: BufReader<ChildStdout>,
    child: Child,
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for ChildStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Locate an executable the way the shell would
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        return path.is_file().then(|| path.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
