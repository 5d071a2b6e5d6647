use super::{run_tries, Precedence, Task};
use crate::config::{ParameterProfile, TaskKind};
use crate::engine::{Engine, GlitchParams, GlitchRequest};
use crate::result_log::ResultLog;
use crate::stats::iqr_mean;
use log::{info, warn};
use std::collections::BTreeMap;
use std::time::Duration;

/// Bracket score difference at which the search stops
const DEFAULT_EPS: f64 = 1.0;
/// Number of midpoints scoring above both ends before giving up
const MAX_STAGNATION: usize = 3;
/// Glitch duration used for profiling
const PROFILE_GDUR: u64 = 1;
const TRY_DELAY: Duration = Duration::from_secs(5);

/// Narrow `[lo, hi]` towards the lower score.
///
/// Each step scores the midpoint and replaces the end on the side where the
/// mean of the neighbouring scores is higher. A midpoint scoring above both
/// ends leaves the bracket untouched and is measured again, at most
/// `MAX_STAGNATION` times. The search stops when the scores of both ends
/// differ by at most `eps`. A collapsed bracket keeps re-probing its lower
/// end, so `score` is expected to change with repeated measurements.
///
/// # Arguments
///
/// * `lo`, `hi` - Initial bracket.
/// * `eps` - Score difference at which the search stops.
/// * `score` - Scores one value. Repeated calls for the same value may
///   return different scores.
///
/// # Returns
///
/// * `Ok((u64, u64))` - Final bracket.
pub fn binary_search<F>(mut lo: u64, mut hi: u64, eps: f64, mut score: F) -> Result<(u64, u64), String>
where
    F: FnMut(u64) -> Result<f64, String>,
{
    let mut metric_lo = score(lo)?;
    let mut metric_hi = score(hi)?;
    let mut diff = (metric_hi - metric_lo).abs();
    let mut n = 0;
    let mut n_stagnate = 0;

    while diff > eps && n_stagnate < MAX_STAGNATION {
        println!(
            "\n*** [{}] [{}, {}]: {:.6}, {:.6} ({:.6})",
            n, lo, hi, metric_lo, metric_hi, diff
        );
        n += 1;

        let mid = lo + (hi - lo) / 2;
        let metric_mid = score(mid)?;
        if metric_mid > metric_lo && metric_mid > metric_hi {
            warn!(
                "metric_curr ({:.6}) is out of range! Try again: n_stagnate={}",
                metric_mid, n_stagnate
            );
            n_stagnate += 1;
            continue;
        }

        if (metric_lo + metric_mid) / 2.0 < (metric_mid + metric_hi) / 2.0 {
            hi = mid;
            metric_hi = metric_mid;
        } else {
            lo = mid;
            metric_lo = metric_mid;
        }
        diff = (metric_hi - metric_lo).abs();
    }
    Ok((lo, hi))
}

/// Calibrate the pre-delay by binary search on the profiling statistics.
///
/// Every measured value runs `nb_iter` rounds (each with up to `nb_tries`
/// attempts) and accumulates the distance metric of every profiling result.
/// Its score is the interquartile mean of all metrics collected so far.
pub struct PdelayProfilingTask {
    profile: ParameterProfile,
    log: ResultLog,
    eps: f64,
    metrics: BTreeMap<u64, Vec<f64>>,
}

impl PdelayProfilingTask {
    pub fn new(profile: ParameterProfile, log: ResultLog) -> Self {
        Self {
            profile,
            log,
            eps: DEFAULT_EPS,
            metrics: BTreeMap::new(),
        }
    }

    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Metrics collected per pre-delay value
    pub fn metrics(&self) -> &BTreeMap<u64, Vec<f64>> {
        &self.metrics
    }

    /// Score of every measured value, ascending by value
    pub fn scores(&self) -> Vec<(u64, f64)> {
        self.metrics
            .iter()
            .map(|(pdelay, metrics)| (*pdelay, iqr_mean(metrics)))
            .collect()
    }

    /// Measure one pre-delay value and return its updated score
    fn profile_at(&mut self, engine: &mut Engine, pdelay: u64) -> Result<f64, String> {
        let req = GlitchRequest::calibration(
            &self.profile.modname,
            GlitchParams {
                gval: engine.config().freq_base,
                gdur: PROFILE_GDUR,
                pdelay,
            },
        );

        for i in 0..self.profile.nb_iter {
            let log = &self.log;
            let outcome = run_tries(
                engine,
                self.profile.nb_tries,
                Precedence::SuccessFirst,
                TRY_DELAY,
                &format!("Iter {}", i + 1),
                |engine| engine.do_glitch_one(&req, log),
            )?;

            let metrics = self.metrics.entry(pdelay).or_default();
            for stats in &outcome.profiles {
                let metric = stats.distance();
                info!(
                    "({}, 0x{:x}, {}, 0x{:x}) {} {:.6}",
                    stats.slave_wait_cycles,
                    stats.slave_timeouts,
                    stats.glitch_wait_cycles,
                    stats.glitch_timeouts,
                    pdelay,
                    metric
                );
                metrics.push(metric);
            }
        }

        let metrics = self.metrics.get(&pdelay).map(Vec::as_slice).unwrap_or_default();
        Ok(iqr_mean(metrics))
    }
}

impl Task for PdelayProfilingTask {
    fn kind(&self) -> TaskKind {
        TaskKind::PdelayProfiling
    }

    fn run(&mut self, engine: &mut Engine) -> Result<(), String> {
        let (lo, hi) = (self.profile.pdelay.base, self.profile.pdelay.end);
        let eps = self.eps;
        let (lo, hi) = binary_search(lo, hi, eps, |pdelay| self.profile_at(engine, pdelay))?;
        info!("Final pre-delay bracket: [{}, {}]", lo, hi);

        println!("--------------------------------");
        for (pdelay, score) in self.scores() {
            println!("pdelay={} => {:.6}", pdelay, score);
        }
        Ok(())
    }
}
