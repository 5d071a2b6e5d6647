//! Experiments driven on top of the engine.
//!
//! Every task walks the Cartesian product of its profile's axes and retries
//! failed glitch rounds: a trusted environment failure is retried in place,
//! any other failure reboots and reconfigures the device first.

pub mod pdelay;
pub mod sweep;

pub use pdelay::{binary_search, PdelayProfilingTask};
pub use sweep::{GlitchExptTask, GlitchProfilingTask, GlitchRsaTask};

use crate::config::{DeviceConfig, ParameterProfile, TaskKind};
use crate::engine::{Engine, GlitchOutcome, GlitchParams};
use crate::result_log::ResultLog;
use itertools::iproduct;
use log::{info, warn};
use std::path::Path;
use std::time::Duration;

/// A runnable experiment
pub trait Task {
    fn kind(&self) -> TaskKind;

    fn run(&mut self, engine: &mut Engine) -> Result<(), String>;
}

/// One tuple of the sweep grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPoint {
    /// Lower temperature bound, for sweeps with a temperature axis
    pub temp: Option<u64>,
    pub params: GlitchParams,
}

/// Build the sweep grid of a profile.
///
/// Order is temperature, glitch value, duration, pre-delay with the last one
/// varying fastest.
///
/// # Arguments
///
/// * `profile` - Profile with `gval` and `gdur` axes.
/// * `with_temperature` - Include the `temp` axis.
pub fn sweep_grid(profile: &ParameterProfile, with_temperature: bool) -> Result<Vec<SweepPoint>, String> {
    let resume = profile.resume;
    let temps: Vec<Option<u64>> = if with_temperature {
        profile
            .temp_axis()?
            .range(resume)
            .into_iter()
            .map(Some)
            .collect()
    } else {
        vec![None]
    };
    let gvals = profile.gval_axis()?.range(resume);
    let gdurs = profile.gdur_axis()?.range(resume);
    let pdelays = profile.pdelay.range(resume);

    Ok(iproduct!(temps, gvals, gdurs, pdelays)
        .map(|(temp, gval, gdur, pdelay)| SweepPoint {
            temp,
            params: GlitchParams { gval, gdur, pdelay },
        })
        .collect())
}

/// Which signal wins when a round reports success and a trusted
/// environment failure at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    SuccessFirst,
    TzFailureFirst,
}

/// Next step of the retry policy after one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Done,
    RetryInPlace,
    Recover,
}

pub fn next_step(outcome: &GlitchOutcome, precedence: Precedence) -> Step {
    match (precedence, outcome.success, outcome.tz_failed) {
        (Precedence::SuccessFirst, true, _) => Step::Done,
        (Precedence::TzFailureFirst, _, true) => Step::RetryInPlace,
        (_, true, _) => Step::Done,
        (_, false, true) => Step::RetryInPlace,
        (_, false, false) => Step::Recover,
    }
}

/// Run up to `nb_tries` rounds until one succeeds.
///
/// # Arguments
///
/// * `engine` - Device session.
/// * `nb_tries` - Maximum number of rounds.
/// * `precedence` - Retry policy when success and tz failure coincide.
/// * `delay` - Pause before every round.
/// * `label` - Iteration label for the progress banner.
/// * `round` - Performs one glitch round.
///
/// # Returns
///
/// * `Ok(GlitchOutcome)` - Outcome of the last round.
/// * `Err(String)` - The device is lost.
pub fn run_tries<F>(
    engine: &mut Engine,
    nb_tries: u64,
    precedence: Precedence,
    delay: Duration,
    label: &str,
    mut round: F,
) -> Result<GlitchOutcome, String>
where
    F: FnMut(&mut Engine) -> Result<GlitchOutcome, String>,
{
    let mut last = GlitchOutcome::default();
    for t in 0..nb_tries {
        println!("\n[+]======[{} - Try {}]==========", label, t + 1);
        engine.sleep(delay);

        last = round(engine)?;
        match next_step(&last, precedence) {
            Step::Done => break,
            Step::RetryInPlace => info!("[-]   Slave seemed to have failed in TZ"),
            Step::Recover => engine.reboot_until_ready()?,
        }
    }
    Ok(last)
}

/// Create the task selected on the command line
pub fn create_task(kind: TaskKind, cfg: &DeviceConfig, log_dir: &Path) -> Result<Box<dyn Task>, String> {
    let profile = cfg.profile(kind)?.clone();
    let log = ResultLog::new(&profile.log_path(log_dir, &cfg.device_id));
    info!("Results of {} go to {}", kind, log.path().display());
    if profile.resume {
        warn!("Resuming {} from the LAST values of the profile", kind);
    }

    let task: Box<dyn Task> = match kind {
        TaskKind::PdelayProfiling => Box::new(PdelayProfilingTask::new(profile, log)),
        TaskKind::GlitchProfiling => Box::new(GlitchProfilingTask::new(profile, log)),
        TaskKind::RsaAuth => Box::new(GlitchRsaTask::new(profile, log)),
        TaskKind::GlitchExpt => Box::new(GlitchExptTask::new(profile, log)),
    };
    Ok(task)
}
