//! Kernel log monitor.
//!
//! Streams the device's kernel ring buffer filtered by module name and
//! decodes the glitch module's line protocol into iteration results while a
//! glitch is running. Termination of the stream is the primary device-crash
//! signal.

pub mod decoder;
pub mod result;

pub use decoder::{Decoder, DecoderState, ProtocolViolation};
pub use result::{IterationResult, ProfileStats, Verdict};

use crate::config::TaskKind;
use crate::transport::Transport;
use crossbeam_channel::{bounded, Receiver};
use log::{error, info, warn};
use std::io::BufRead;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

/// Time granted to the reader thread to drain the stream after the kill
const STOP_GRACE: Duration = Duration::from_secs(2);

struct MonitorState {
    decoder: Decoder,
    results: Vec<IterationResult>,
    terminated: bool,
    violation: Option<ProtocolViolation>,
    niter: usize,
    /// The owner took its snapshot. A reader still running must not decode.
    detached: bool,
}

impl MonitorState {
    fn save(&mut self, res: IterationResult) {
        self.niter += 1;
        info!("[-]   ({:02}) {}", self.niter, res);
        self.results.push(res);
    }

    fn finalize_pending(&mut self) {
        if let Some(res) = self.decoder.finish() {
            self.save(res);
        }
    }
}

/// Snapshot taken when the monitor is stopped
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    /// Finalized iterations in stream order
    pub results: Vec<IterationResult>,
    /// First grammar violation, after which decoding stopped
    pub violation: Option<ProtocolViolation>,
}

/// One monitoring session bound to a glitch module and a task
pub struct KmsgMonitor {
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<MonitorState>>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    stopped: bool,
}

fn lock(state: &Mutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decode lines until end of stream or the first violation
fn read_stream(stream: Box<dyn BufRead + Send>, state: &Mutex<MonitorState>) {
    info!("[+] KPROC: Monitoring /proc/kmsg for glitches");
    for line in stream.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("KPROC: read error: {}", e);
                break;
            }
        };
        let mut guard = lock(state);
        if guard.detached {
            break;
        }
        match guard.decoder.feed(&line) {
            Ok(Some(res)) => guard.save(res),
            Ok(None) => {}
            Err(violation) => {
                error!("KPROC: {}", violation);
                guard.finalize_pending();
                guard.violation = Some(violation);
                guard.terminated = true;
                return;
            }
        }
    }

    let mut guard = lock(state);
    if !guard.detached {
        guard.finalize_pending();
    }
    guard.terminated = true;
    info!("[-]   KPROC: Terminating.");
}

impl KmsgMonitor {
    /// Remote command streaming the kernel log lines of a module
    pub fn command(modname: &str) -> String {
        format!("taskset 1 /system/bin/cat /proc/kmsg | grep {}", modname)
    }

    /// Open the stream and start the reader thread.
    ///
    /// # Arguments
    ///
    /// * `transport` - Device access.
    /// * `modname` - Kernel module whose lines are decoded.
    /// * `task` - Task context attached to every decoded result.
    pub fn start(transport: Arc<dyn Transport>, modname: &str, task: TaskKind) -> Result<Self, String> {
        let stream = transport.open_stream(&Self::command(modname))?;
        let state = Arc::new(Mutex::new(MonitorState {
            decoder: Decoder::new(task),
            results: Vec::new(),
            terminated: false,
            violation: None,
            niter: 0,
            detached: false,
        }));

        let (done_sender, done) = bounded(1);
        let thread_state = Arc::clone(&state);
        let handle = spawn(move || {
            read_stream(stream, &thread_state);
            let _ = done_sender.send(());
        });

        Ok(Self {
            transport,
            state,
            done,
            handle: Some(handle),
            stopped: false,
        })
    }

    /// The stream ended or decoding stopped on a violation
    pub fn has_terminated(&self) -> bool {
        lock(&self.state).terminated
    }

    pub fn violation(&self) -> Option<ProtocolViolation> {
        lock(&self.state).violation.clone()
    }

    /// Number of finalized results so far
    pub fn result_count(&self) -> usize {
        lock(&self.state).results.len()
    }

    /// Iterations finalized since start or the last flush
    pub fn iterations(&self) -> usize {
        lock(&self.state).niter
    }

    /// Discard finalized results and the pending iteration, and restart the
    /// iteration numbering
    pub fn flush_results(&self) {
        let mut guard = lock(&self.state);
        guard.results.clear();
        guard.decoder.reset();
        guard.niter = 0;
    }

    /// Kill the stream, finalize the pending iteration and hand out all
    /// results. This is the only point where the result list is stable.
    pub fn stop(mut self) -> MonitorReport {
        self.stopped = true;
        self.transport.kill_stream();

        match self.done.recv_timeout(STOP_GRACE) {
            Ok(()) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
            }
            Err(_) => warn!("KPROC: reader still busy after kill, taking snapshot anyway"),
        }

        let mut guard = lock(&self.state);
        guard.finalize_pending();
        guard.detached = true;
        MonitorReport {
            results: std::mem::take(&mut guard.results),
            violation: guard.violation.take(),
        }
    }
}

impl Drop for KmsgMonitor {
    fn drop(&mut self) {
        if !self.stopped {
            self.transport.kill_stream();
        }
    }
}
