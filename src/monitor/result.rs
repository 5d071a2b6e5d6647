use crate::bitflip::{bitflip_report, memcpy_report, FlipReport};
use crate::config::TaskKind;
use std::fmt;

/// Verdict of the slave workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

/// Statistics reported by the profiling build of the glitch module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileStats {
    pub slave_wait_cycles: u64,
    pub slave_timeouts: u64,
    pub glitch_wait_cycles: u64,
    pub glitch_timeouts: u64,
}

impl ProfileStats {
    /// Distance from the ideal (no timeout on either side) used as search
    /// metric by the pre-delay calibration
    pub fn distance(&self) -> f64 {
        let slave = self.slave_timeouts as f64;
        let glitch = self.glitch_timeouts as f64;
        (slave * slave + glitch * glitch).sqrt()
    }
}

impl fmt::Display for ProfileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.slave_wait_cycles, self.slave_timeouts, self.glitch_wait_cycles, self.glitch_timeouts
        )
    }
}

/// Outcome of one glitch iteration as reported in the kernel log.
///
/// Created by an `ITER` line and completed by the following `glitch` and
/// `slave` lines. The task decides how failure details are rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationResult {
    pub task: TaskKind,
    pub gval: u64,
    pub gdur: u64,
    pub pdelay: u64,
    pub temperature: u64,
    /// `None` until a slave verdict line was seen
    pub verdict: Option<Verdict>,
    pub ret_val: u64,
    pub ccnt_s: i64,
    pub insn_s: i64,
    pub ccnt_g: i64,
    pub insn_g: i64,
    pub scratch_s: String,
    pub scratch_g: String,
    /// Workload failed inside the trusted environment
    pub tz_failed: bool,
    pub fail_rnd: String,
    pub fail_mod: Vec<String>,
    pub fail_ct: Vec<String>,
    pub fail_rrnd: Vec<String>,
    pub fail_modr: Vec<String>,
    pub expt_test: Vec<String>,
    pub profile: Option<ProfileStats>,
}

impl IterationResult {
    pub fn new(task: TaskKind, gval: u64, gdur: u64, pdelay: u64) -> Self {
        Self {
            task,
            gval,
            gdur,
            pdelay,
            temperature: 0,
            verdict: None,
            ret_val: 0,
            ccnt_s: 0,
            insn_s: 0,
            ccnt_g: 0,
            insn_g: 0,
            scratch_s: String::new(),
            scratch_g: String::new(),
            tz_failed: false,
            fail_rnd: String::new(),
            fail_mod: Vec::new(),
            fail_ct: Vec::new(),
            fail_rrnd: Vec::new(),
            fail_modr: Vec::new(),
            expt_test: Vec::new(),
            profile: None,
        }
    }

    /// No slave verdict was observed
    pub fn is_invalid(&self) -> bool {
        self.verdict.is_none()
    }

    fn reported_verdict(&self) -> Verdict {
        match self.verdict {
            Some(Verdict::Pass) => Verdict::Pass,
            _ => Verdict::Fail,
        }
    }

    /// Short form written for results carrying profiling statistics
    pub fn profile_line(&self) -> String {
        let stats = self.profile.unwrap_or_default();
        format!(
            "{}, {:x}, {}, {},{},{},{},{}",
            self.reported_verdict(),
            self.ret_val,
            self.temperature,
            self.ccnt_s,
            self.insn_s,
            self.ccnt_g,
            self.insn_g,
            stats
        )
    }

    /// Bit-flip analysis of the collected failure bytes, depending on the task
    fn modulus_flips(&self, nprime: &str) -> Option<FlipReport> {
        (self.task == TaskKind::RsaAuth && !nprime.contains("00000000"))
            .then(|| bitflip_report(nprime))
    }

    fn expt_flips(&self, expt: &str) -> Option<FlipReport> {
        match self.task {
            TaskKind::RsaAuth | TaskKind::GlitchExpt => Some(bitflip_report(expt)),
            TaskKind::GlitchProfiling => Some(memcpy_report(expt)),
            TaskKind::PdelayProfiling => None,
        }
    }
}

fn write_flips(f: &mut fmt::Formatter<'_>, report: Option<FlipReport>) -> fmt::Result {
    match report {
        Some(report) if !report.is_empty() => write!(f, "\n{}", report),
        _ => Ok(()),
    }
}

/// General form: verdict, return value, temperature, counters and scratch
/// bytes, followed by one continuation line per failure category.
/// Invalid results render as `,,,,,`.
impl fmt::Display for IterationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            return write!(f, ",,,,,");
        }
        write!(
            f,
            "{}, {:x}, {}, {},{},{},{},\t{}|{}",
            self.reported_verdict(),
            self.ret_val,
            self.temperature,
            self.ccnt_s,
            self.insn_s,
            self.ccnt_g,
            self.insn_g,
            self.scratch_g,
            self.scratch_s
        )?;
        if !self.fail_rnd.is_empty() {
            write!(f, "\n\t\tRND:{}", self.fail_rnd)?;
        }
        if !self.fail_ct.is_empty() {
            write!(f, "\n\t\tCT:{}", self.fail_ct.concat())?;
        }
        if !self.fail_rrnd.is_empty() {
            write!(f, "\n\t\tRRND:{}", self.fail_rrnd.join(","))?;
        }
        if !self.fail_modr.is_empty() {
            write!(f, "\n\t\tR2MODN:{}", self.fail_modr.concat())?;
        }
        if !self.fail_mod.is_empty() {
            let nprime = self.fail_mod.concat();
            write!(f, "\n\t\tNPRIME:{}", nprime)?;
            write_flips(f, self.modulus_flips(&nprime))?;
        }
        if !self.expt_test.is_empty() {
            let expt = self.expt_test.concat();
            write!(f, "\n\t\tEXPT_STR:{}", expt)?;
            write_flips(f, self.expt_flips(&expt))?;
        }
        Ok(())
    }
}
