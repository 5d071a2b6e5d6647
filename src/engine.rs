use crate::command::{CommandOutput, DEFAULT_TIMEOUT};
use crate::config::{parse_output_number, DeviceConfig, TaskKind, DIR_REMOTE_TMP, ERR_INSMOD_FAIL};
use crate::monitor::{KmsgMonitor, ProfileStats};
use crate::result_log::ResultLog;
use crate::transport::Transport;
use colored::Colorize;
use log::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

const REBOOT_TIMEOUT: Duration = Duration::from_secs(10);
const REBOOT_SETTLE: Duration = Duration::from_secs(5);
const REBOOT_FAILURE_PAUSE: Duration = Duration::from_secs(30);
const REBOOT_ALERT_AFTER: usize = 3;
const REBOOT_ABORT_AFTER: usize = 15;
const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(2);
const LIVENESS_MAX_POLLS: usize = 20;
const PREP_MODULE_TRIES: usize = 5;
const PREP_MODULE_DELAY: Duration = Duration::from_secs(5);
const POST_SETUP_SETTLE: Duration = Duration::from_secs(4);

const CHECK_DELAY: Duration = Duration::from_millis(500);
const SETUP_DELAY: Duration = Duration::from_millis(500);
const SETUP_BULK_ROUNDS: usize = 3;
const SETUP_COOLDOWN: Duration = Duration::from_secs(600);
const SETUP_REBOOT_AFTER: usize = 3;
const SETUP_ABORT_AFTER: usize = 5;

const HEAT_RUN_TIMEOUT: Duration = Duration::from_secs(5);
const RAMPUP_CMD_TIMEOUT: Duration = Duration::from_secs(3);
const COOLDOWN_POLL: Duration = Duration::from_secs(5);
/// Range above `min_temp` accepted when the caller overrides the band
const TEMP_BAND_WIDTH: u64 = 1000;

const GLITCH_TIMEOUT: Duration = Duration::from_secs(25);
const WARMUP_SETTLE: Duration = Duration::from_secs(4);
const REAL_ROUND_DELAY: Duration = Duration::from_secs(2);
const CALIBRATION_SETTLE: Duration = Duration::from_secs(2);

/// Source of all waits of the engine and the tasks
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Lifecycle of the device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    Rebooting,
    VerifyingEnv,
    ConfiguringEnv,
    Ready,
}

/// Parameters identifying one glitch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlitchParams {
    /// Glitch magnitude (frequency/voltage setting)
    pub gval: u64,
    /// Glitch duration
    pub gdur: u64,
    /// Delay between trigger and glitch
    pub pdelay: u64,
}

impl fmt::Display for GlitchParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gval=0x{:x}  gdur={}  predelay={}",
            self.gval, self.gdur, self.pdelay
        )
    }
}

/// One request to `Engine::do_glitch_one`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlitchRequest {
    pub task: TaskKind,
    pub modname: String,
    pub params: GlitchParams,
    /// Bring the device into its temperature band first
    pub check_temperature: bool,
    /// Lower bound overriding the configured band, which then becomes
    /// `[min_temp, min_temp + 1000]`
    pub min_temp: Option<u64>,
    /// Run a discarded round with the base glitch value first
    pub warm_up: bool,
}

impl GlitchRequest {
    /// Regular glitch round with warm-up and temperature regulation
    pub fn glitch(task: TaskKind, modname: &str, params: GlitchParams) -> Self {
        Self {
            task,
            modname: modname.to_string(),
            params,
            check_temperature: true,
            min_temp: None,
            warm_up: true,
        }
    }

    /// Profiling round of the pre-delay calibration, without warm-up and
    /// without temperature regulation
    pub fn calibration(modname: &str, params: GlitchParams) -> Self {
        Self {
            task: TaskKind::PdelayProfiling,
            modname: modname.to_string(),
            params,
            check_temperature: false,
            min_temp: None,
            warm_up: false,
        }
    }

    pub fn min_temp(mut self, min_temp: u64) -> Self {
        self.min_temp = Some(min_temp);
        self
    }
}

/// Outcome of one glitch round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlitchOutcome {
    /// Round ran without any hitch and produced results
    pub success: bool,
    /// The workload failed inside the trusted environment
    pub tz_failed: bool,
    /// Number of results written to the log
    pub valid: usize,
    /// Profiling statistics of the round
    pub profiles: Vec<ProfileStats>,
}

/// Insmod command line of the glitch module
pub fn glitch_command(modname: &str, params: &GlitchParams, temperature: u64) -> String {
    format!(
        "taskset 1 /system/bin/insmod {}/{}.ko PARAM_gval=0x{:x} PARAM_gdelay={} PARAM_delaypre={} PARAM_temp={}",
        DIR_REMOTE_TMP, modname, params.gval, params.gdur, params.pdelay, temperature
    )
}

/// Device session: reboot, environment set-up, temperature control and the
/// single glitch round all tasks are built on.
pub struct Engine {
    cfg: DeviceConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    state: SessionState,
}

impl Engine {
    pub fn new(cfg: DeviceConfig, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            transport,
            clock,
            state: SessionState::Unknown,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Wait on the engine's clock
    pub fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration);
    }

    fn shell(&self, command: &str) -> Result<CommandOutput, String> {
        self.transport.shell(command, DEFAULT_TIMEOUT, false)
    }

    fn shell_number(&self, command: &str) -> Result<u64, String> {
        Ok(parse_output_number(&self.shell(command)?.output))
    }

    /// Reboot the device and wait until it is alive.
    ///
    /// A failing reboot command is repeated; the operator is alerted after
    /// more than 3 failures and the run is aborted after more than 15.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The device booted (and loaded its preparatory module).
    /// * `Ok(false)` - The device did not come alive in time.
    /// * `Err(String)` - The device cannot be rebooted.
    pub fn reboot_device(&mut self) -> Result<bool, String> {
        self.state = SessionState::Rebooting;
        info!("[+] Rebooting DEVICE ID: {}", self.cfg.device_id);

        loop {
            self.sleep(LIVENESS_POLL_INTERVAL);

            let mut n_reboot = 0;
            loop {
                n_reboot += 1;
                let output = self.transport.host(&["reboot"], REBOOT_TIMEOUT)?;
                self.sleep(REBOOT_SETTLE);
                if output.success() {
                    break;
                }
                warn!("[-]   adb reboot failed. n={}", n_reboot);
                self.sleep(REBOOT_FAILURE_PAUSE);
                if n_reboot > REBOOT_ALERT_AFTER {
                    self.notify_operator(&format!(
                        "Device {} does not reboot ({} attempts)",
                        self.cfg.device_id, n_reboot
                    ));
                }
                if n_reboot > REBOOT_ABORT_AFTER {
                    return Err(format!(
                        "Device {} failed to reboot {} times",
                        self.cfg.device_id, n_reboot
                    ));
                }
            }

            info!("[+] Polling device to determine if it is live");
            self.sleep(Duration::from_secs(self.cfg.init_time_before_polling));
            let mut nproc = self.shell_number("ps | wc -l")?;
            let mut n_polls = 0;
            while nproc < self.cfg.thres_active_proc && n_polls < LIVENESS_MAX_POLLS {
                self.sleep(LIVENESS_POLL_INTERVAL);
                nproc = self.shell_number("ps | wc -l")?;
                n_polls += 1;
            }
            if nproc < self.cfg.thres_active_proc {
                warn!(
                    "[-]   Polling for reboot timeout. nproc={}, n={}",
                    nproc, n_polls
                );
                return Ok(false);
            }

            match self.cfg.prep_module.clone() {
                Some(module) if !self.load_prep_module(&module)? => {
                    warn!("[-]   Preparatory module {} not loaded, rebooting again", module);
                }
                _ => return Ok(true),
            }
        }
    }

    /// Full reboot followed by environment set-up
    pub fn reboot(&mut self) -> Result<bool, String> {
        if !self.reboot_device()? {
            return Ok(false);
        }
        self.sleep(Duration::from_secs(self.cfg.time_before_init_cmd));
        self.setup_environment()?;
        self.sleep(POST_SETUP_SETTLE);
        Ok(true)
    }

    /// Reboot until the device is alive and configured
    pub fn reboot_until_ready(&mut self) -> Result<(), String> {
        while !self.reboot()? {
            warn!("[-]   Reboot failed. Try again!");
        }
        Ok(())
    }

    fn load_prep_module(&self, module: &str) -> Result<bool, String> {
        if self.is_module_loaded(module)? {
            info!("[-]   Module is already loaded. Skipping...");
            return Ok(true);
        }
        let mut n_tries = 0;
        while n_tries < PREP_MODULE_TRIES && !self.is_module_loaded(module)? {
            info!("[-]   Trying to load module -- n_tries:{}", n_tries);
            self.transport
                .shell_once(&format!("insmod {}/{}.ko", DIR_REMOTE_TMP, module))?;
            self.sleep(PREP_MODULE_DELAY);
            n_tries += 1;
        }
        let loaded = self.is_module_loaded(module)?;
        info!("[-]   Module ({}) loaded: {}", module, loaded);
        Ok(loaded)
    }

    /// Check `lsmod` for a kernel module
    pub fn is_module_loaded(&self, module: &str) -> Result<bool, String> {
        let output = self.transport.shell_once(&format!("lsmod | grep {}", module))?;
        Ok(output.output.contains(module))
    }

    /// PID and CPU mask of the remote shell daemon
    fn adbd_mask(&self) -> Result<(u64, String), String> {
        self.transport.list_devices(DEFAULT_TIMEOUT)?;
        self.sleep(LIVENESS_POLL_INTERVAL);
        let pid = self.shell_number("pgrep adbd")?;
        let output = self.shell(&format!("taskset -ap {}", pid))?;
        let mask = output
            .output
            .split_whitespace()
            .last()
            .unwrap_or_default()
            .to_string();
        Ok((pid, mask))
    }

    /// Pin the remote shell daemon to CPU 0
    fn pin_adbd(&self) -> Result<(), String> {
        let (pid, _) = self.adbd_mask()?;
        self.transport.shell_once(&format!("taskset -ap 1 {}", pid))?;
        Ok(())
    }

    /// Re-pin the remote shell daemon and run the environment checks in order.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Every check matched.
    /// * `Ok(false)` - The daemon is not pinned or a check mismatched.
    pub fn is_env_initialized(&mut self) -> Result<bool, String> {
        self.state = SessionState::VerifyingEnv;
        info!("[+] PROLOGUE: Checking if environment is initialized:");
        self.pin_adbd()?;
        let (_, mask) = self.adbd_mask()?;
        info!("[-]   - ENV: adbd_mask: {}", mask);
        if !mask.contains('1') {
            return Ok(false);
        }

        for (i, check) in self.cfg.check_init_cmds.iter().enumerate() {
            let output = self.shell(&check.command)?;
            self.sleep(CHECK_DELAY);
            info!("[-]   - ENV[{}] ({}): {}", i, check.command, output.output);
            if !check.matches(&output.output) {
                debug!("Expected: {}", check.expected);
                return Ok(false);
            }
        }

        info!("[-]   Environment is initialized.");
        self.state = SessionState::Ready;
        Ok(true)
    }

    /// Run all setup commands. The list is repeated while any command times
    /// out, for at most `SETUP_BULK_ROUNDS` rounds.
    fn replay_setup(&self) -> Result<(), String> {
        for round in 1..=SETUP_BULK_ROUNDS {
            let mut is_error = false;
            for command in &self.cfg.setup_cmds {
                info!("[-]   Bulk execing: {}", command);
                if self.shell(command)?.timed_out {
                    error!("[-]   ERROR: cannot adb_exec: {}", command);
                    is_error = true;
                }
                self.sleep(SETUP_DELAY);
            }
            if !is_error {
                return Ok(());
            }
            error!(
                "[-]  ERROR: cannot execute bulk cmds (round {}/{})",
                round, SETUP_BULK_ROUNDS
            );
        }
        Ok(())
    }

    /// Configure the environment until it verifies.
    ///
    /// After the 3rd failed attempt the device is left to cool down for
    /// 600 s and rebooted. More than 5 failed attempts abort the run.
    pub fn setup_environment(&mut self) -> Result<(), String> {
        if self.is_env_initialized()? {
            return Ok(());
        }

        info!("[+] PROLOGUE: Disabling services and CPUs:");
        let mut tries = 0;
        while !self.is_env_initialized()? {
            self.state = SessionState::ConfiguringEnv;
            info!("[-]   Environment NOT initialized. Configuring...");
            self.replay_setup()?;
            self.sleep(Duration::from_secs(1));
            self.pin_adbd()?;
            self.sleep(Duration::from_secs(1));
            tries += 1;
            if tries == SETUP_REBOOT_AFTER {
                warn!("[-]   Device may be temporarily fried. Sleep for a while.");
                self.sleep(SETUP_COOLDOWN);
                while !self.reboot_device()? {
                    warn!("[-]   Reboot failed. Try again!");
                }
            }
            if tries > SETUP_ABORT_AFTER {
                return Err(format!(
                    "Cannot initialize glitching environment on {} after {} attempts",
                    self.cfg.device_id, tries
                ));
            }
        }
        info!("[-]   PROLOGUE STAGE completed");
        Ok(())
    }

    /// Current temperature in milli-degrees, 0 when the sensor cannot be read
    pub fn temperature(&self) -> Result<u64, String> {
        self.shell_number(&format!("cat {}", self.cfg.cpu_temp_log))
    }

    fn kill_heat_tool(&self) -> Result<(), String> {
        self.transport
            .shell_once(&format!("pkill -9 -f {}", self.cfg.fever_tool))?;
        Ok(())
    }

    fn run_rampup_commands(&self, commands: &[String]) -> Result<(), String> {
        for command in commands {
            self.transport.shell(command, RAMPUP_CMD_TIMEOUT, false)?;
        }
        Ok(())
    }

    /// Heat or cool the device into `[min_temp, max_temp]`.
    ///
    /// Below the band the heat tool runs repeatedly until `min_temp` is
    /// reached. Above the band the device idles until it is below the middle
    /// of the band.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Temperature is acceptable.
    /// * `Ok(false)` - The sensor read 0 while heating.
    pub fn regulate_temperature(&mut self, min_temp: u64, max_temp: u64) -> Result<bool, String> {
        let mut curr_temp = self.temperature()?;

        self.kill_heat_tool()?;
        self.sleep(Duration::from_secs(1));

        let rampup = self.cfg.temperature_rampup.clone().unwrap_or_default();
        if curr_temp < min_temp {
            self.run_rampup_commands(&rampup.pre)?;
            while curr_temp < min_temp {
                self.transport
                    .shell(&self.cfg.fever_tool, HEAT_RUN_TIMEOUT, true)?;
                curr_temp = self.temperature()?;
                info!("[-]       Ramping up temperature: curr_temp={}", curr_temp);
                if curr_temp == 0 {
                    return Ok(false);
                }
            }
            self.run_rampup_commands(&rampup.post)?;
        } else if curr_temp > max_temp {
            let target = max_temp - (max_temp - min_temp) / 2;
            while curr_temp > target {
                self.sleep(COOLDOWN_POLL);
                curr_temp = self.temperature()?;
                info!("[-]       Cooling down temperature: curr_temp={}", curr_temp);
            }
        }

        self.kill_heat_tool()?;
        info!("[-]   Temperature in required range. Continuing.");
        Ok(true)
    }

    fn exec_glitch(
        &self,
        modname: &str,
        params: &GlitchParams,
        temperature: u64,
        quiet: bool,
    ) -> Result<CommandOutput, String> {
        self.transport.shell(
            &glitch_command(modname, params, temperature),
            GLITCH_TIMEOUT,
            quiet,
        )
    }

    /// Perform one glitch round and dump its results.
    ///
    /// The kernel log monitor runs for the whole round. Preconditions are a
    /// live monitor, a verified environment and, if requested, a temperature
    /// within the band. A warm-up round with the base glitch value precedes
    /// the real round; its results are discarded and the real round is
    /// skipped when it times out.
    ///
    /// # Arguments
    ///
    /// * `req` - Module, parameters and options of the round.
    /// * `log` - Result log receiving the decoded results.
    ///
    /// # Returns
    ///
    /// * `Ok(GlitchOutcome)` - `success` is false when a precondition failed,
    ///   the monitor died, the glitch timed out or could not be loaded, the
    ///   log protocol was violated or no valid result was produced.
    /// * `Err(String)` - The device is unreachable or the log cannot be written.
    pub fn do_glitch_one(&mut self, req: &GlitchRequest, log: &ResultLog) -> Result<GlitchOutcome, String> {
        let monitor = KmsgMonitor::start(Arc::clone(&self.transport), &req.modname, req.task)?;

        let mut ready = true;
        if monitor.has_terminated() {
            error!("[+] do_glitch_one: ERROR: cat /proc/kmsg has died.");
            ready = false;
        }
        if !self.is_env_initialized()? {
            error!("[+] do_glitch_one: ERROR: Phone restarted unexpectedly.");
            ready = false;
        }
        if req.check_temperature {
            let (min_temp, max_temp) = match req.min_temp {
                Some(min_temp) => (min_temp, min_temp + TEMP_BAND_WIDTH),
                None => (self.cfg.min_temp, self.cfg.max_temp),
            };
            if !self.regulate_temperature(min_temp, max_temp)? {
                error!("[+] do_glitch_one: ERROR: Cannot read temperature.");
                ready = false;
            }
        }
        if !ready {
            let report = monitor.stop();
            log.append(&req.params, &report.results)?;
            return Ok(GlitchOutcome::default());
        }

        let temperature = if req.check_temperature {
            self.temperature()?
        } else {
            0
        };

        println!(
            "\n{}",
            "[+]---[ New Glitching Params ]--------------------------".bold()
        );
        println!("[-]   {}", req.params);
        println!("[-]   CPU Temperature: {}", temperature);

        let mut last = if req.warm_up {
            info!("[-]   +++ Step [1]: Exercise cache with dummy rounds...");
            let base = GlitchParams {
                gval: self.cfg.freq_base,
                ..req.params
            };
            let warm_up = self.exec_glitch(&req.modname, &base, temperature, true)?;
            self.sleep(WARMUP_SETTLE);
            monitor.flush_results();
            info!("[-]   +++ Step [2]: Begin real glitching...");
            self.sleep(REAL_ROUND_DELAY);
            warm_up
        } else {
            CommandOutput::default()
        };
        if !last.timed_out {
            last = self.exec_glitch(&req.modname, &req.params, temperature, false)?;
        }

        let mut success = true;
        if monitor.has_terminated() {
            error!("[+] do_glitch_one(b): ERROR: cat /proc/kmsg has died.");
            success = false;
        }
        if last.timed_out {
            error!("[+] do_glitch_one: ERROR: Glitching fuzz thread has timed out.");
            success = false;
        }
        if last.output.contains(ERR_INSMOD_FAIL) {
            error!("[+] do_glitch_one: ERROR: Cannot load glitch fuzzing module.");
            success = false;
        }

        let report = monitor.stop();
        if let Some(violation) = &report.violation {
            error!("[+] do_glitch_one: ERROR: kernel log protocol violation: {}", violation);
            success = false;
        }
        if !req.warm_up {
            self.sleep(CALIBRATION_SETTLE);
        }
        let summary = log.append(&req.params, &report.results)?;
        info!(
            "[+] Dumping results: n={} istzfail={}",
            summary.valid, summary.tz_failed
        );

        if success && summary.valid == 0 {
            error!("[+] do_glitch_one: ERROR: No valid results.");
            success = false;
        }

        Ok(GlitchOutcome {
            success,
            tz_failed: summary.tz_failed,
            valid: summary.valid,
            profiles: summary.profiles,
        })
    }

    /// Ring the terminal bell and poke the operator endpoint, if configured
    pub fn notify_operator(&self, message: &str) {
        println!("\x07\x07\x07\x07\x07{}", message.red().bold());
        if let Some(endpoint) = &self.cfg.alert_endpoint {
            if let Err(e) = self.poke_endpoint(endpoint) {
                warn!("Cannot alert operator at {}: {}", endpoint, e);
            }
        }
    }

    fn poke_endpoint(&self, endpoint: &str) -> io::Result<()> {
        let addr = endpoint.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "endpoint resolves to no address")
        })?;
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
        self.sleep(Duration::from_secs(1));
        drop(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glitch_command_line() {
        let params = GlitchParams {
            gval: 0xd0,
            gdur: 5,
            pdelay: 8000,
        };
        assert_eq!(
            glitch_command("clkpeer", &params, 39000),
            "taskset 1 /system/bin/insmod /data/local/tmp/clkpeer.ko PARAM_gval=0xd0 PARAM_gdelay=5 PARAM_delaypre=8000 PARAM_temp=39000"
        );
    }

    #[test]
    fn glitch_params_display() {
        let params = GlitchParams {
            gval: 0xa0,
            gdur: 10,
            pdelay: 83000,
        };
        assert_eq!(params.to_string(), "gval=0xa0  gdur=10  predelay=83000");
    }

    #[test]
    fn request_options() {
        let params = GlitchParams {
            gval: 0x65,
            gdur: 1,
            pdelay: 85000,
        };
        let req = GlitchRequest::calibration("clkscrew", params);
        assert!(!req.warm_up);
        assert!(!req.check_temperature);
        assert_eq!(req.task, TaskKind::PdelayProfiling);

        let glitch = GlitchRequest::glitch(TaskKind::GlitchExpt, "glitchmin", params).min_temp(39000);
        assert!(glitch.warm_up);
        assert_eq!(glitch.min_temp, Some(39000));
    }
}
