#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};
use glitch_harness::command::CommandOutput;
use glitch_harness::config::{DeviceConfig, DeviceType, EnvCheck};
use glitch_harness::engine::{Clock, Engine};
use glitch_harness::transport::Transport;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ENV_CHECK: &str = "cat /sys/devices/system/cpu/cpu2/online";
pub const SETUP_CMDS: [&str; 2] = ["stop thermal-engine", "echo 0 > /sys/devices/system/cpu/cpu2/online"];
pub const TEMP_SENSOR: &str = "cat /sys/devices/virtual/thermal/thermal_zone0/temp";

/// Scripted answers for commands containing `pattern`. The last queued entry
/// is repeated once the others are used up.
struct Rule {
    pattern: String,
    outputs: VecDeque<CommandOutput>,
    kmsg: VecDeque<Vec<String>>,
}

fn next<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Line reader fed through a channel, at end of stream once the sender is gone
struct ChannelReader {
    lines: Receiver<String>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.lines.recv() {
                Ok(line) => {
                    self.pending = format!("{}\n", line).into_bytes();
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Scripted device.
///
/// Every command is recorded. Unscripted commands succeed with empty output.
/// Rules added later take precedence over earlier ones. Kernel log lines
/// attached to a rule are pushed into the open stream when a matching
/// command runs.
pub struct FakeTransport {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    stream: Mutex<Option<Sender<String>>>,
    streams_opened: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            stream: Mutex::new(None),
            streams_opened: AtomicUsize::new(0),
        }
    }

    /// Device that boots, verifies and sits inside the default temperature band
    pub fn healthy() -> Self {
        let transport = Self::new();
        transport.respond("ps | wc -l", &["500"]);
        transport.respond("pgrep adbd", &["123"]);
        transport.respond("taskset -ap", &["pid 123's current affinity mask: 1"]);
        transport.respond(ENV_CHECK, &["0"]);
        transport.respond(TEMP_SENSOR, &["37000"]);
        transport
    }

    pub fn respond(&self, pattern: &str, outputs: &[&str]) {
        self.respond_with(
            pattern,
            outputs
                .iter()
                .map(|output| CommandOutput::new(Some(0), output))
                .collect(),
        );
    }

    pub fn respond_with(&self, pattern: &str, outputs: Vec<CommandOutput>) {
        self.rules.lock().unwrap().insert(
            0,
            Rule {
                pattern: pattern.to_string(),
                outputs: outputs.into(),
                kmsg: VecDeque::new(),
            },
        );
    }

    /// Queue one batch of kernel log lines for the next command matching
    /// `pattern`
    pub fn emit_on(&self, pattern: &str, lines: &[String]) {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|rule| rule.pattern == pattern) {
            Some(rule) => rule.kmsg.push_back(lines.to_vec()),
            None => rules.insert(
                0,
                Rule {
                    pattern: pattern.to_string(),
                    outputs: VecDeque::new(),
                    kmsg: VecDeque::from([lines.to_vec()]),
                },
            ),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Number of recorded commands containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|command| command.contains(pattern))
            .count()
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    fn answer(&self, command: &str) -> CommandOutput {
        self.commands.lock().unwrap().push(command.to_string());

        let mut rules = self.rules.lock().unwrap();
        let rule = match rules.iter_mut().find(|rule| command.contains(&rule.pattern)) {
            Some(rule) => rule,
            None => return CommandOutput::new(Some(0), ""),
        };
        if let Some(lines) = next(&mut rule.kmsg) {
            if let Some(sender) = self.stream.lock().unwrap().as_ref() {
                for line in lines {
                    sender.send(line).unwrap();
                }
            }
        }
        next(&mut rule.outputs).unwrap_or_else(|| CommandOutput::new(Some(0), ""))
    }
}

impl Transport for FakeTransport {
    fn device_id(&self) -> &str {
        "FAKE01"
    }

    fn host(&self, args: &[&str], _timeout: Duration) -> Result<CommandOutput, String> {
        Ok(self.answer(&format!("host {}", args.join(" "))))
    }

    fn list_devices(&self, _timeout: Duration) -> Result<CommandOutput, String> {
        Ok(self.answer("adb devices"))
    }

    fn shell(&self, command: &str, _timeout: Duration, _quiet: bool) -> Result<CommandOutput, String> {
        Ok(self.answer(command))
    }

    fn shell_once(&self, command: &str) -> Result<CommandOutput, String> {
        Ok(self.answer(command))
    }

    fn open_stream(&self, command: &str) -> Result<Box<dyn BufRead + Send>, String> {
        self.commands.lock().unwrap().push(format!("stream {}", command));
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let (sender, lines) = unbounded();
        *self.stream.lock().unwrap() = Some(sender);
        Ok(Box::new(BufReader::new(ChannelReader {
            lines,
            pending: Vec::new(),
            pos: 0,
        })))
    }

    fn kill_stream(&self) -> usize {
        match self.stream.lock().unwrap().take() {
            Some(_) => 1,
            None => 0,
        }
    }
}

/// Clock recording the requested waits without waiting
#[derive(Default)]
pub struct FakeClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn count(&self, duration: Duration) -> usize {
        self.sleeps().iter().filter(|d| **d == duration).count()
    }
}

impl Clock for FakeClock {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// Nexus 6P table reduced to one environment check and two setup commands
pub fn test_config() -> DeviceConfig {
    let mut cfg = DeviceConfig::builtin(DeviceType::Angler).with_serial("FAKE01");
    cfg.check_init_cmds = vec![EnvCheck::number(ENV_CHECK, 0)];
    cfg.setup_cmds = SETUP_CMDS.iter().map(|s| s.to_string()).collect();
    cfg.prep_module = None;
    cfg.alert_endpoint = None;
    cfg
}

pub fn engine(transport: &Arc<FakeTransport>, clock: &Arc<FakeClock>) -> Engine {
    let transport: Arc<dyn Transport> = transport.clone();
    let clock: Arc<dyn Clock> = clock.clone();
    Engine::new(test_config(), transport, clock)
}

/// Kernel log line as printed by the glitch module
pub fn kmsg(body: &str) -> String {
    format!("<6>[  812.113] clkscrew: {}", body)
}

pub fn kmsg_lines(bodies: &[&str]) -> Vec<String> {
    bodies.iter().map(|body| kmsg(body)).collect()
}
