use super::{run_tries, sweep_grid, Precedence, Task};
use crate::config::{ParameterProfile, TaskKind};
use crate::engine::{Engine, GlitchRequest};
use crate::result_log::ResultLog;
use log::info;
use std::time::Duration;

const TRY_DELAY: Duration = Duration::from_secs(2);

/// Grid sweep over glitch value, duration and pre-delay with `nb_iter`
/// successful rounds per tuple
struct GridSweep {
    kind: TaskKind,
    profile: ParameterProfile,
    log: ResultLog,
}

impl GridSweep {
    fn run(&self, engine: &mut Engine) -> Result<(), String> {
        for point in sweep_grid(&self.profile, false)? {
            let req = GlitchRequest::glitch(self.kind, &self.profile.modname, point.params);
            for i in 0..self.profile.nb_iter {
                run_tries(
                    engine,
                    self.profile.nb_tries,
                    Precedence::TzFailureFirst,
                    TRY_DELAY,
                    &format!("Iter {}", i),
                    |engine| engine.do_glitch_one(&req, &self.log),
                )?;
            }
        }
        Ok(())
    }
}

/// Glitch sweep against the synthetic benchmark module
pub struct GlitchProfilingTask(GridSweep);

impl GlitchProfilingTask {
    pub fn new(profile: ParameterProfile, log: ResultLog) -> Self {
        Self(GridSweep {
            kind: TaskKind::GlitchProfiling,
            profile,
            log,
        })
    }
}

impl Task for GlitchProfilingTask {
    fn kind(&self) -> TaskKind {
        self.0.kind
    }

    fn run(&mut self, engine: &mut Engine) -> Result<(), String> {
        self.0.run(engine)
    }
}

/// Glitch sweep against the RSA authentication workload
pub struct GlitchRsaTask(GridSweep);

impl GlitchRsaTask {
    pub fn new(profile: ParameterProfile, log: ResultLog) -> Self {
        Self(GridSweep {
            kind: TaskKind::RsaAuth,
            profile,
            log,
        })
    }
}

impl Task for GlitchRsaTask {
    fn kind(&self) -> TaskKind {
        self.0.kind
    }

    fn run(&mut self, engine: &mut Engine) -> Result<(), String> {
        self.0.run(engine)
    }
}

/// Glitching rate experiment.
///
/// Sweeps temperature, value, duration and pre-delay, and keeps glitching
/// each tuple until more than `target_results` valid results were logged.
pub struct GlitchExptTask {
    profile: ParameterProfile,
    log: ResultLog,
}

impl GlitchExptTask {
    pub fn new(profile: ParameterProfile, log: ResultLog) -> Self {
        Self { profile, log }
    }
}

impl Task for GlitchExptTask {
    fn kind(&self) -> TaskKind {
        TaskKind::GlitchExpt
    }

    fn run(&mut self, engine: &mut Engine) -> Result<(), String> {
        for point in sweep_grid(&self.profile, true)? {
            let mut req = GlitchRequest::glitch(TaskKind::GlitchExpt, &self.profile.modname, point.params);
            if let Some(temp) = point.temp {
                req = req.min_temp(temp);
            }

            let mut collected = 0;
            loop {
                println!("\n[+]======[n = {}]==========", collected);
                engine.sleep(TRY_DELAY);

                let outcome = engine.do_glitch_one(&req, &self.log)?;
                if outcome.tz_failed {
                    info!("[-]   Slave seemed to have failed in TZ");
                    continue;
                }

                collected += outcome.valid;
                if collected > self.profile.target_results {
                    break;
                }
                if !outcome.success {
                    engine.reboot_until_ready()?;
                }
            }
            info!(
                "[+] {} ({:?}): {} results collected",
                point.params, point.temp, collected
            );
        }
        Ok(())
    }
}
