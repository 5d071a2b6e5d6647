use crate::engine::GlitchParams;
use crate::monitor::{IterationResult, ProfileStats};
use log::debug;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Counters of one dump
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DumpSummary {
    /// Results written to the log
    pub valid: usize,
    /// A result reported a trusted environment failure
    pub tz_failed: bool,
    /// Statistics of the profiling results, in log order
    pub profiles: Vec<ProfileStats>,
}

/// Append-only result file of one task and module
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the results of one glitch run.
    ///
    /// Every line is prefixed with the parameters the run was started with.
    /// Results with profiling statistics use the short profile form and are
    /// counted whatever their verdict, other results are written when they
    /// carry a verdict. Dumping stops at the first result with a trusted
    /// environment failure.
    ///
    /// # Arguments
    ///
    /// * `params` - Glitch parameters of the run.
    /// * `results` - Results collected by the kernel log monitor.
    ///
    /// # Returns
    ///
    /// * `Ok(DumpSummary)` - Counters of what was written.
    /// * `Err(String)` - The log file cannot be written.
    pub fn append(&self, params: &GlitchParams, results: &[IterationResult]) -> Result<DumpSummary, String> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| format!("Cannot open result log {}: {}", self.path.display(), e))?;
        let mut writer = BufWriter::new(file);
        let mut summary = DumpSummary::default();

        for res in results {
            if res.tz_failed {
                summary.tz_failed = true;
                break;
            }
            let decoded = match res.profile {
                Some(stats) => {
                    summary.profiles.push(stats);
                    res.profile_line()
                }
                None if !res.is_invalid() => res.to_string(),
                None => continue,
            };
            writeln!(
                writer,
                "0x{:x},{},{},{}",
                params.gval, params.gdur, params.pdelay, decoded
            )
            .map_err(|e| format!("Cannot write result log {}: {}", self.path.display(), e))?;
            summary.valid += 1;
        }

        writer
            .flush()
            .map_err(|e| format!("Cannot write result log {}: {}", self.path.display(), e))?;
        debug!(
            "Dumped {} results to {} (tz failure: {})",
            summary.valid,
            self.path.display(),
            summary.tz_failed
        );
        Ok(summary)
    }
}
