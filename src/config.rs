use clap::ValueEnum;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};

/// Writable directory on the device holding the kernel modules and tools
pub const DIR_REMOTE_TMP: &str = "/data/local/tmp";

/// Error string reported by insmod when the glitch module cannot be loaded
pub const ERR_INSMOD_FAIL: &str = "Function not implemented";

/// Default number of valid results collected per tuple by the glitch experiment
const DEFAULT_TARGET_RESULTS: usize = 50;

/// Parse decimal or `0x` prefixed hex strings to u64 values
pub fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|e| format!("Invalid hex number '{}': {}", s, e)),
        None => s
            .parse::<u64>()
            .map_err(|e| format!("Invalid number '{}': {}", s, e)),
    }
}

/// Visitor accepting numbers given either as JSON numbers or as strings
/// (`"85000"`, `"0xa0"`)
struct NumberVisitor;

impl<'de> serde::de::Visitor<'de> for NumberVisitor {
    type Value = u64;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a non-negative number or a decimal/hex string")
    }

    fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<u64, E> {
        Ok(value)
    }

    fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<u64, E> {
        u64::try_from(value).map_err(|_| E::custom(format!("Negative value: {}", value)))
    }

    fn visit_f64<E: serde::de::Error>(self, value: f64) -> Result<u64, E> {
        if value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 {
            Ok(value as u64)
        } else {
            Err(E::custom(format!("Not an unsigned integer: {}", value)))
        }
    }

    fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<u64, E> {
        parse_number(value).map_err(E::custom)
    }
}

/// Custom deserializer for a single hex-or-decimal value
fn deserialize_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(NumberVisitor)
}

/// Custom deserializer for a list of hex-or-decimal values
fn deserialize_numbers<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct NumbersVisitor;

    impl<'de> Visitor<'de> for NumbersVisitor {
        type Value = Vec<u64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an array of numbers (decimal or hex strings, or numbers)")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Vec<u64>, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut values = Vec::new();

            while let Some(value) = seq.next_element::<serde_json::Value>()? {
                match value {
                    serde_json::Value::String(s) => {
                        values.push(parse_number(&s).map_err(de::Error::custom)?);
                    }
                    serde_json::Value::Number(n) => match n.as_u64().or_else(|| {
                        n.as_f64()
                            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                            .map(|f| f as u64)
                    }) {
                        Some(v) => values.push(v),
                        None => {
                            return Err(de::Error::custom(format!(
                                "Invalid number in list: {}",
                                n
                            )))
                        }
                    },
                    _ => return Err(de::Error::custom("List entry must be a string or number")),
                }
            }

            Ok(values)
        }
    }

    deserializer.deserialize_seq(NumbersVisitor)
}

/// Supported device models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Huawei Nexus 6P
    Angler,
    /// Motorola Nexus 6
    Shamu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Angler => write!(f, "angler"),
            DeviceType::Shamu => write!(f, "shamu"),
        }
    }
}

/// Experiments the harness can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TaskKind {
    /// Calibrate the pre-delay by binary search
    #[value(name = "pdelayprof")]
    PdelayProfiling,
    /// Grid sweep against the synthetic benchmark
    #[value(name = "glitchprof")]
    GlitchProfiling,
    /// Grid sweep against the RSA authentication workload
    #[value(name = "rsaauth")]
    RsaAuth,
    /// Glitching rate experiment with a temperature axis
    #[value(name = "glitchexpt")]
    GlitchExpt,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::PdelayProfiling => "pdelayprof",
            TaskKind::GlitchProfiling => "glitchprof",
            TaskKind::RsaAuth => "rsaauth",
            TaskKind::GlitchExpt => "glitchexpt",
        };
        write!(f, "{}", name)
    }
}

/// One numeric sweep dimension
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SweepAxis {
    #[serde(rename = "BASE", alias = "base", deserialize_with = "deserialize_number")]
    pub base: u64,
    #[serde(rename = "END", alias = "end", deserialize_with = "deserialize_number")]
    pub end: u64,
    #[serde(rename = "STEP", alias = "step", deserialize_with = "deserialize_number")]
    pub step: u64,
    #[serde(rename = "LAST", alias = "last", deserialize_with = "deserialize_number")]
    pub last: u64,
    #[serde(
        rename = "OTHER",
        alias = "other",
        default,
        deserialize_with = "deserialize_numbers"
    )]
    pub other: Vec<u64>,
}

impl SweepAxis {
    pub fn new(base: u64, end: u64, step: u64, last: u64) -> Self {
        Self {
            base,
            end,
            step,
            last,
            other: Vec::new(),
        }
    }

    pub fn with_other(mut self, other: Vec<u64>) -> Self {
        self.other = other;
        self
    }

    /// Check `base <= end` and `step > 0`
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.step == 0 {
            return Err(format!("Axis '{}': STEP must be greater than 0", name));
        }
        if self.base > self.end {
            return Err(format!(
                "Axis '{}': BASE (0x{:x}) is above END (0x{:x})",
                name, self.base, self.end
            ));
        }
        Ok(())
    }

    /// Generate the values of this axis.
    ///
    /// Starts at `last` when `resume` is set and at `base` otherwise, steps by
    /// `step` up to and including `end`, then appends the extra `other` points.
    /// Extra points already produced by the stepping are not repeated.
    pub fn range(&self, resume: bool) -> Vec<u64> {
        let start = if resume { self.last } else { self.base };
        let mut values: Vec<u64> = if self.step == 0 || start > self.end {
            Vec::new()
        } else {
            (start..=self.end).step_by(self.step as usize).collect()
        };
        for extra in &self.other {
            if !values.contains(extra) {
                values.push(*extra);
            }
        }
        values
    }
}

/// Per-task sweep definition
#[derive(Debug, Clone, Deserialize)]
pub struct ParameterProfile {
    #[serde(default)]
    pub gval: Option<SweepAxis>,
    #[serde(default)]
    pub gdur: Option<SweepAxis>,
    pub pdelay: SweepAxis,
    #[serde(default)]
    pub temp: Option<SweepAxis>,
    #[serde(default)]
    pub resume: bool,
    #[serde(deserialize_with = "deserialize_number")]
    pub nb_iter: u64,
    #[serde(deserialize_with = "deserialize_number")]
    pub nb_tries: u64,
    pub modname: String,
    /// File name prefix of the result log, e.g. `glitch_prof`
    pub log_prefix: String,
    #[serde(default = "ParameterProfile::default_target_results")]
    pub target_results: usize,
}

fn required<'a>(axis: &'a Option<SweepAxis>, name: &str) -> Result<&'a SweepAxis, String> {
    axis.as_ref()
        .ok_or_else(|| format!("Profile does not define the '{}' axis", name))
}

impl ParameterProfile {
    fn default_target_results() -> usize {
        DEFAULT_TARGET_RESULTS
    }

    pub fn gval_axis(&self) -> Result<&SweepAxis, String> {
        required(&self.gval, "gval")
    }

    pub fn gdur_axis(&self) -> Result<&SweepAxis, String> {
        required(&self.gdur, "gdur")
    }

    pub fn temp_axis(&self) -> Result<&SweepAxis, String> {
        required(&self.temp, "temp")
    }

    /// Result log path: `<log_dir>/<prefix>_<device_id>_<modname>.txt`
    pub fn log_path(&self, log_dir: &Path, device_id: &str) -> PathBuf {
        log_dir.join(format!(
            "{}_{}_{}.txt",
            self.log_prefix, device_id, self.modname
        ))
    }

    pub fn validate(&self) -> Result<(), String> {
        self.pdelay.validate("pdelay")?;
        if let Some(axis) = &self.gval {
            axis.validate("gval")?;
        }
        if let Some(axis) = &self.gdur {
            axis.validate("gdur")?;
        }
        if let Some(axis) = &self.temp {
            axis.validate("temp")?;
        }
        if self.nb_iter == 0 || self.nb_tries == 0 {
            return Err(format!(
                "Profile '{}': nb_iter and nb_tries must be greater than 0",
                self.log_prefix
            ));
        }
        if self.modname.is_empty() {
            return Err(format!("Profile '{}': empty module name", self.log_prefix));
        }
        Ok(())
    }
}

/// Expected output of an environment check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    /// Output parsed as integer; non-numeric output reads as 0
    Number(u64),
    /// Output compared as trimmed text
    Text(String),
}

impl<'de> Deserialize<'de> for Expected {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct ExpectedVisitor;

        impl<'de> Visitor<'de> for ExpectedVisitor {
            type Value = Expected;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an integer or a string")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Expected, E> {
                Ok(Expected::Number(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Expected, E> {
                NumberVisitor.visit_i64(value).map(Expected::Number)
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Expected, E> {
                NumberVisitor.visit_f64(value).map(Expected::Number)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Expected, E> {
                Ok(Expected::Text(value.to_string()))
            }
        }

        deserializer.deserialize_any(ExpectedVisitor)
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Number(n) => write!(f, "{}", n),
            Expected::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One environment verification step
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnvCheck {
    pub command: String,
    pub expected: Expected,
}

impl EnvCheck {
    pub fn number(command: &str, expected: u64) -> Self {
        Self {
            command: command.to_string(),
            expected: Expected::Number(expected),
        }
    }

    pub fn text(command: &str, expected: &str) -> Self {
        Self {
            command: command.to_string(),
            expected: Expected::Text(expected.to_string()),
        }
    }

    /// Compare raw command output against the expectation
    pub fn matches(&self, output: &str) -> bool {
        match &self.expected {
            Expected::Number(n) => parse_output_number(output) == *n,
            Expected::Text(s) => output.trim() == s,
        }
    }
}

/// Interpret shell output as an unsigned integer, 0 when it is not one
pub fn parse_output_number(output: &str) -> u64 {
    let output = output.trim();
    if output.is_empty() || !output.chars().all(|c| c.is_ascii_digit()) {
        return 0;
    }
    output.parse().unwrap_or(0)
}

/// Extra cores brought online only while heating the device up
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RampupCommands {
    #[serde(default)]
    pub pre: Vec<String>,
    #[serde(default)]
    pub post: Vec<String>,
}

/// Parameter profiles of all tasks
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskProfiles {
    #[serde(default)]
    pub pdelay_profile: Option<ParameterProfile>,
    #[serde(default)]
    pub glitch_profile: Option<ParameterProfile>,
    #[serde(default)]
    pub glitch_rsa: Option<ParameterProfile>,
    #[serde(default)]
    pub glitch_expt: Option<ParameterProfile>,
}

/// Static description of one device model
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub device_type: DeviceType,
    pub device_id: String,
    /// ADB binary for general commands
    pub adb_program: String,
    /// Separate ADB binary copy for the kernel log stream, so that it can be
    /// killed by name without touching other commands
    pub kmsg_program: String,
    /// Process count above which the device counts as booted
    pub thres_active_proc: u64,
    /// Seconds to wait after reboot before polling for liveness
    pub init_time_before_polling: u64,
    /// Seconds to wait before replaying the setup commands
    pub time_before_init_cmd: u64,
    pub min_temp: u64,
    pub max_temp: u64,
    /// Heat generating helper on the device
    pub fever_tool: String,
    /// Temperature sensor file
    pub cpu_temp_log: String,
    pub check_init_cmds: Vec<EnvCheck>,
    pub setup_cmds: Vec<String>,
    #[serde(default)]
    pub temperature_rampup: Option<RampupCommands>,
    /// Preparatory kernel module loaded after every boot
    #[serde(default)]
    pub prep_module: Option<String>,
    /// Glitch value of the warm-up round
    #[serde(deserialize_with = "deserialize_number")]
    pub freq_base: u64,
    /// `host:port` poked when the device needs a manual reset
    #[serde(default)]
    pub alert_endpoint: Option<String>,
    #[serde(default)]
    pub profiles: TaskProfiles,
}

impl DeviceConfig {
    /// Load configuration from JSON5 file
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        Self::from_json5(&content)
    }

    /// Parse and validate a JSON5 device description
    pub fn from_json5(content: &str) -> Result<Self, String> {
        let config: DeviceConfig = json5::from_str(content)
            .map_err(|e| format!("Failed to parse JSON5 config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in table of a supported device
    pub fn builtin(device_type: DeviceType) -> Self {
        match device_type {
            DeviceType::Angler => nexus_6p(),
            DeviceType::Shamu => nexus_6(),
        }
    }

    /// Bind the configuration to an ADB serial. The ADB copies are named
    /// after the serial (`<serial>adb`, `<serial>kproc`).
    pub fn with_serial(mut self, serial: &str) -> Self {
        self.device_id = serial.to_string();
        self.adb_program = format!("{}adb", serial);
        self.kmsg_program = format!("{}kproc", serial);
        self
    }

    pub fn profile(&self, task: TaskKind) -> Result<&ParameterProfile, String> {
        let profile = match task {
            TaskKind::PdelayProfiling => &self.profiles.pdelay_profile,
            TaskKind::GlitchProfiling => &self.profiles.glitch_profile,
            TaskKind::RsaAuth => &self.profiles.glitch_rsa,
            TaskKind::GlitchExpt => &self.profiles.glitch_expt,
        };
        profile.as_ref().ok_or_else(|| {
            format!(
                "Task {} is not configured for device {}",
                task, self.device_type
            )
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.adb_program == self.kmsg_program {
            return Err(
                "adb_program and kmsg_program must differ to be killed independently".to_string(),
            );
        }
        if self.min_temp > self.max_temp {
            return Err(format!(
                "min_temp ({}) is above max_temp ({})",
                self.min_temp, self.max_temp
            ));
        }
        for profile in [
            &self.profiles.pdelay_profile,
            &self.profiles.glitch_profile,
            &self.profiles.glitch_rsa,
            &self.profiles.glitch_expt,
        ]
        .into_iter()
        .flatten()
        {
            profile.validate()?;
        }
        Ok(())
    }
}

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn profile(
    axes: [Option<SweepAxis>; 3],
    pdelay: SweepAxis,
    nb_iter: u64,
    nb_tries: u64,
    modname: &str,
    log_prefix: &str,
) -> ParameterProfile {
    let [gval, gdur, temp] = axes;
    ParameterProfile {
        gval,
        gdur,
        pdelay,
        temp,
        resume: false,
        nb_iter,
        nb_tries,
        modname: modname.to_string(),
        log_prefix: log_prefix.to_string(),
        target_results: DEFAULT_TARGET_RESULTS,
    }
}

/// Huawei Nexus 6P
fn nexus_6p() -> DeviceConfig {
    DeviceConfig {
        device_type: DeviceType::Angler,
        device_id: "-".to_string(),
        adb_program: "adb".to_string(),
        kmsg_program: "kproc".to_string(),
        thres_active_proc: 409,
        init_time_before_polling: 32,
        time_before_init_cmd: 10,
        min_temp: 36000,
        max_temp: 38000,
        fever_tool: format!("{}/dofever-v8a", DIR_REMOTE_TMP),
        cpu_temp_log: "/sys/devices/virtual/thermal/thermal_zone0/temp".to_string(),
        check_init_cmds: vec![
            EnvCheck::number("cat /sys/devices/system/cpu/cpu2/online", 0),
            EnvCheck::number("cat /sys/devices/system/cpu/cpu4/online", 1),
            EnvCheck::number("cat /sys/devices/system/cpu/cpu5/online", 0),
            EnvCheck::text(
                "cat /sys/devices/system/cpu/cpu1/cpufreq/scaling_governor",
                "userspace",
            ),
            EnvCheck::text(
                "cat /sys/devices/system/cpu/cpu4/cpufreq/scaling_governor",
                "userspace",
            ),
            EnvCheck::number(
                "cat /sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq",
                1555200,
            ),
            EnvCheck::number(
                "cat /sys/devices/system/cpu/cpu4/cpufreq/scaling_cur_freq",
                960000,
            ),
            EnvCheck::number("cat /sys/module/msm_thermal/core_control/enabled", 0),
        ],
        setup_cmds: strings(&[
            "stop thermal-engine",
            "echo 1 > /sys/kernel/debug/msm_vidc/disable_thermal_mitigation",
            "echo 0 > /sys/module/msm_thermal/vdd_mx/enabled",
            "echo 0 > /sys/module/msm_thermal/core_control/enabled",
            "echo 0 > /d/cpr-regulator/apc0_corner/cpr_enable",
            "echo 0 > /d/cpr-regulator/apc1_corner/cpr_enable",
            "echo 1 > /d/regulator/pmi8994_boostbypass/enable",
            "echo 1 > /sys/devices/system/cpu/cpu0/online",
            "echo 1 > /sys/devices/system/cpu/cpu1/online",
            "echo 0 > /sys/devices/system/cpu/cpu2/online",
            "echo 0 > /sys/devices/system/cpu/cpu3/online",
            "echo 1 > /sys/devices/system/cpu/cpu4/online",
            "echo 0 > /sys/devices/system/cpu/cpu5/online",
            "echo 0 > /sys/devices/system/cpu/cpu6/online",
            "echo 0 > /sys/devices/system/cpu/cpu7/online",
            "echo userspace > /sys/devices/system/cpu/cpu0/cpufreq/scaling_governor",
            "echo userspace > /sys/devices/system/cpu/cpu4/cpufreq/scaling_governor",
            "echo 1555200 > /sys/devices/system/cpu/cpu0/cpufreq/scaling_setspeed",
            "echo 960000 > /sys/devices/system/cpu/cpu4/cpufreq/scaling_setspeed",
            "echo 0 > /proc/sys/kernel/randomize_va_space",
        ]),
        temperature_rampup: Some(RampupCommands {
            pre: strings(&[
                "echo 1 > /sys/devices/system/cpu/cpu2/online",
                "echo 1 > /sys/devices/system/cpu/cpu3/online",
                "echo 1 > /sys/devices/system/cpu/cpu5/online",
                "echo 1 > /sys/devices/system/cpu/cpu6/online",
                "echo 1 > /sys/devices/system/cpu/cpu7/online",
            ]),
            post: strings(&[
                "echo 0 > /sys/devices/system/cpu/cpu2/online",
                "echo 0 > /sys/devices/system/cpu/cpu3/online",
                "echo 0 > /sys/devices/system/cpu/cpu5/online",
                "echo 0 > /sys/devices/system/cpu/cpu6/online",
                "echo 0 > /sys/devices/system/cpu/cpu7/online",
            ]),
        }),
        prep_module: None,
        freq_base: 0x65,
        alert_endpoint: None,
        profiles: TaskProfiles {
            pdelay_profile: Some(profile(
                [None, None, None],
                SweepAxis::new(85000, 88000, 1, 1),
                10,
                5,
                "clkscrew",
                "pdprof",
            )),
            glitch_profile: Some(profile(
                [
                    Some(SweepAxis::new(0xa0, 0xf0, 4, 0x6a)),
                    Some(SweepAxis::new(5, 11, 5, 2)),
                    None,
                ],
                SweepAxis::new(83000, 90000, 500, 1),
                5,
                2,
                "clkscrew",
                "glitch_prof",
            )),
            glitch_rsa: None,
            glitch_expt: None,
        },
    }
}

/// Motorola Nexus 6
fn nexus_6() -> DeviceConfig {
    DeviceConfig {
        device_type: DeviceType::Shamu,
        device_id: "-".to_string(),
        adb_program: "adb".to_string(),
        kmsg_program: "kproc".to_string(),
        thres_active_proc: 250,
        init_time_before_polling: 15,
        time_before_init_cmd: 3,
        min_temp: 37000,
        max_temp: 38000,
        fever_tool: format!("{}/dofever-v7a", DIR_REMOTE_TMP),
        cpu_temp_log: "/sys/devices/virtual/thermal/thermal_zone0/temp".to_string(),
        check_init_cmds: vec![
            EnvCheck::number("cat /sys/devices/system/cpu/cpu3/online", 0),
            EnvCheck::text(
                "cat /sys/devices/system/cpu/cpu2/cpufreq/scaling_governor",
                "userspace",
            ),
            EnvCheck::number(
                "cat /sys/devices/system/cpu/cpu2/cpufreq/scaling_setspeed",
                2649600,
            ),
            EnvCheck::number(
                "cat /sys/devices/system/cpu/cpu0/cpufreq/scaling_setspeed",
                2649600,
            ),
        ],
        setup_cmds: strings(&[
            "stop thermal-engine",
            "stop mpdecision",
            "echo 1 > /sys/devices/system/cpu/cpu1/online",
            "echo 1 > /sys/devices/system/cpu/cpu2/online",
            "echo 0 > /sys/devices/system/cpu/cpu3/online",
            "echo userspace > /sys/devices/system/cpu/cpu0/cpufreq/scaling_governor",
            "echo userspace > /sys/devices/system/cpu/cpu1/cpufreq/scaling_governor",
            "echo userspace > /sys/devices/system/cpu/cpu2/cpufreq/scaling_governor",
            "echo 2649600 > /sys/devices/system/cpu/cpu0/cpufreq/scaling_setspeed",
            "echo 2649600 > /sys/devices/system/cpu/cpu1/cpufreq/scaling_setspeed",
            "echo 2649600 > /sys/devices/system/cpu/cpu2/cpufreq/scaling_setspeed",
            "echo 0 > /proc/sys/kernel/randomize_va_space",
            "sleep 0.5",
            "echo 0x5a > /sys/powerplay/freq_l2",
            "sleep 0.5",
            "echo 0x5a > /sys/powerplay/freq_all",
            "sleep 0.5",
            "echo 1055000 > /sys/powerplay/volt_all",
            "sleep 0.5",
            "echo 0x8a > /sys/powerplay/freq_all",
        ]),
        temperature_rampup: None,
        prep_module: Some("powerplay_glitch_sole".to_string()),
        freq_base: 0x88,
        alert_endpoint: None,
        profiles: TaskProfiles {
            pdelay_profile: Some(profile(
                [None, None, None],
                SweepAxis::new(2000, 12000, 1, 1),
                10,
                5,
                "clkpeer",
                "pdprof",
            )),
            glitch_profile: Some(profile(
                [
                    Some(SweepAxis::new(0xd0, 0xd0, 4, 0xcc)),
                    Some(SweepAxis::new(1, 1, 1, 1)),
                    None,
                ],
                SweepAxis::new(4000, 7000, 200, 1),
                5,
                3,
                "clkpeer",
                "glitch_prof",
            )),
            glitch_rsa: Some(profile(
                [
                    Some(SweepAxis::new(0xd0, 0xd0, 4, 0xcc)),
                    Some(SweepAxis::new(5, 5, 20, 1)),
                    None,
                ],
                SweepAxis::new(8000, 8000, 200, 1),
                20,
                3,
                "clkpeer",
                "glitch_rsaauth",
            )),
            glitch_expt: Some(profile(
                [
                    Some(SweepAxis::new(0xd0, 0xe0, 8, 0xcc)),
                    Some(SweepAxis::new(5, 55, 25, 1).with_other(vec![1])),
                    Some(SweepAxis::new(39000, 39000, 2000, 1)),
                ],
                SweepAxis::new(8000, 8000, 200, 1),
                20,
                3,
                "glitchmin",
                "glitch_expt",
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_range_steps_up_to_end() {
        let axis = SweepAxis::new(83000, 90000, 500, 1);
        let range = axis.range(false);
        assert_eq!(range.first(), Some(&83000));
        assert_eq!(range.last(), Some(&90000));
        assert_eq!(range.len(), 15);
        assert!(range.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn axis_range_stops_at_largest_reachable_value() {
        let axis = SweepAxis::new(5, 11, 5, 2);
        assert_eq!(axis.range(false), vec![5, 10]);
    }

    #[test]
    fn axis_range_resumes_from_last() {
        let axis = SweepAxis::new(0xa0, 0xf0, 4, 0xe8);
        assert_eq!(axis.range(true), vec![0xe8, 0xec, 0xf0]);
        assert_eq!(axis.range(false).first(), Some(&0xa0));
    }

    #[test]
    fn axis_range_appends_other_points_once() {
        let axis = SweepAxis::new(5, 55, 25, 1).with_other(vec![1, 30, 30]);
        assert_eq!(axis.range(false), vec![5, 30, 55, 1]);

        let axis = SweepAxis::new(5, 55, 25, 1).with_other(vec![30]);
        assert_eq!(axis.range(false), vec![5, 30, 55]);
    }

    #[test]
    fn axis_validation() {
        assert!(SweepAxis::new(1, 0, 1, 1).validate("x").is_err());
        assert!(SweepAxis::new(0, 1, 0, 1).validate("x").is_err());
        assert!(SweepAxis::new(7, 7, 1, 1).validate("x").is_ok());
    }

    #[test]
    fn parse_numbers() {
        assert_eq!(parse_number("0xa0"), Ok(0xa0));
        assert_eq!(parse_number(" 85000 "), Ok(85000));
        assert!(parse_number("0xzz").is_err());
        assert!(parse_number("-1").is_err());
    }

    #[test]
    fn output_numbers_default_to_zero() {
        assert_eq!(parse_output_number("1555200\n"), 1555200);
        assert_eq!(parse_output_number("userspace"), 0);
        assert_eq!(parse_output_number(""), 0);
    }

    #[test]
    fn env_check_comparisons() {
        let check = EnvCheck::number("cat /sys/devices/system/cpu/cpu2/online", 0);
        assert!(check.matches("0"));
        assert!(!check.matches("1"));
        let check = EnvCheck::text("cat governor", "userspace");
        assert!(check.matches("userspace\n"));
        assert!(!check.matches("ondemand"));
    }

    #[test]
    fn builtin_configs_are_valid() {
        for device in [DeviceType::Angler, DeviceType::Shamu] {
            let config = DeviceConfig::builtin(device);
            config.validate().unwrap();
            assert!(config.profile(TaskKind::PdelayProfiling).is_ok());
        }
        let angler = DeviceConfig::builtin(DeviceType::Angler);
        assert!(angler.profile(TaskKind::RsaAuth).is_err());
    }

    #[test]
    fn serial_renames_adb_programs() {
        let config = DeviceConfig::builtin(DeviceType::Shamu).with_serial("ZX1G22");
        assert_eq!(config.device_id, "ZX1G22");
        assert_eq!(config.adb_program, "ZX1G22adb");
        assert_eq!(config.kmsg_program, "ZX1G22kproc");
    }

    #[test]
    fn load_json5_config() {
        let content = r#"{
            device_type: "shamu",
            device_id: "ZX1G22",
            adb_program: "ZX1G22adb",
            kmsg_program: "ZX1G22kproc",
            thres_active_proc: 250,
            init_time_before_polling: 15,
            time_before_init_cmd: 3,
            min_temp: 37000,
            max_temp: 38000,
            fever_tool: "/data/local/tmp/dofever-v7a",
            cpu_temp_log: "/sys/devices/virtual/thermal/thermal_zone0/temp",
            check_init_cmds: [
                { command: "cat /sys/devices/system/cpu/cpu3/online", expected: 0 },
                { command: "cat /sys/devices/system/cpu/cpu2/cpufreq/scaling_governor", expected: "userspace" },
            ],
            setup_cmds: ["stop thermal-engine"],
            prep_module: "powerplay_glitch_sole",
            freq_base: "0x88",
            profiles: {
                glitch_expt: {
                    gval: { BASE: "0xd0", END: "0xe0", STEP: "8", LAST: "0xcc" },
                    gdur: { BASE: "5", END: "55", STEP: "25", LAST: "1", OTHER: [1] },
                    pdelay: { BASE: 8000, END: 8000, STEP: 200, LAST: 1 },
                    temp: { BASE: "39000", END: "39000", STEP: "2000", LAST: "1" },
                    nb_iter: "20",
                    nb_tries: 3,
                    modname: "glitchmin",
                    log_prefix: "glitch_expt",
                },
            },
        }"#;
        let config = DeviceConfig::from_json5(content).unwrap();
        assert_eq!(config.device_type, DeviceType::Shamu);
        assert_eq!(config.freq_base, 0x88);
        assert_eq!(config.check_init_cmds[0].expected, Expected::Number(0));
        assert_eq!(
            config.check_init_cmds[1].expected,
            Expected::Text("userspace".to_string())
        );
        let expt = config.profile(TaskKind::GlitchExpt).unwrap();
        assert_eq!(expt.gval_axis().unwrap().range(false), vec![0xd0, 0xd8, 0xe0]);
        assert_eq!(expt.gdur_axis().unwrap().range(false), vec![5, 30, 55, 1]);
        assert_eq!(expt.nb_iter, 20);
        assert_eq!(expt.target_results, 50);
        assert!(config.profile(TaskKind::RsaAuth).is_err());
    }

    #[test]
    fn invalid_axis_is_rejected_at_load() {
        let content = r#"{
            device_type: "angler", device_id: "x", adb_program: "xadb", kmsg_program: "xkproc",
            thres_active_proc: 1, init_time_before_polling: 0, time_before_init_cmd: 0,
            min_temp: 0, max_temp: 1, fever_tool: "f", cpu_temp_log: "t",
            check_init_cmds: [], setup_cmds: [], freq_base: 1,
            profiles: { pdelay_profile: {
                pdelay: { BASE: 10, END: 5, STEP: 1, LAST: 1 },
                nb_iter: 1, nb_tries: 1, modname: "m", log_prefix: "p",
            } },
        }"#;
        assert!(DeviceConfig::from_json5(content).is_err());
    }

    #[test]
    fn log_path_layout() {
        let config = DeviceConfig::builtin(DeviceType::Angler).with_serial("ABC");
        let profile = config.profile(TaskKind::GlitchProfiling).unwrap();
        assert_eq!(
            profile.log_path(Path::new("log"), &config.device_id),
            PathBuf::from("log/glitch_prof_ABC_clkscrew.txt")
        );
    }
}
