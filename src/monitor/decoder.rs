use super::result::{IterationResult, ProfileStats, Verdict};
use crate::config::TaskKind;
use log::{debug, warn};
use std::fmt;
use std::str::FromStr;

const TAG_ITER: &str = "ITER";
const TAG_GLITCH: &str = "glitch";
const TAG_SLAVE: &str = "slave";

/// Kernel log line that does not follow the glitch module's grammar.
///
/// Field positions count from 1 after the tag field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    UnknownSlaveTag { tag: String, line: String },
    MalformedField { tag: String, position: usize, value: String },
    MissingField { tag: String, position: usize },
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::UnknownSlaveTag { tag, line } => {
                write!(f, "Unexpected slave tag '{}' in line: {}", tag, line)
            }
            ProtocolViolation::MalformedField {
                tag,
                position,
                value,
            } => write!(f, "Malformed field {} of '{}' line: '{}'", position, tag, value),
            ProtocolViolation::MissingField { tag, position } => {
                write!(f, "Missing field {} of '{}' line", position, tag)
            }
        }
    }
}

/// Decoder state between two lines
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderState {
    /// No `ITER` line seen since start or reset
    Idle,
    /// Iteration started by the last `ITER` line, not finalized yet
    Accumulating(Box<IterationResult>),
}

/// Line decoder of the glitch module's kernel log protocol.
///
/// Every `ITER` line finalizes the pending iteration and starts a new one,
/// `glitch` and `slave` lines complete the pending iteration. Lines without
/// a known tag and lines before the first `ITER` are ignored.
#[derive(Debug, Clone)]
pub struct Decoder {
    task: TaskKind,
    state: DecoderState,
}

impl Decoder {
    pub fn new(task: TaskKind) -> Self {
        Self {
            task,
            state: DecoderState::Idle,
        }
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Decode one line.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(IterationResult))` - The line started a new iteration and the
    ///   previous one is finalized.
    /// * `Ok(None)` - The line was absorbed or ignored.
    /// * `Err(ProtocolViolation)` - The line breaks the grammar.
    pub fn feed(&mut self, line: &str) -> Result<Option<IterationResult>, ProtocolViolation> {
        let line = line.trim();
        let fields: Vec<&str> = line.split(',').collect();
        let Some((position, tag)) = fields
            .iter()
            .enumerate()
            .find_map(|(i, field)| known_tag(field).map(|tag| (i, tag)))
        else {
            return Ok(None);
        };
        let args = &fields[position + 1..];

        if tag == TAG_ITER {
            let next = self.start_iteration(args)?;
            let finished = self.finish();
            self.state = DecoderState::Accumulating(Box::new(next));
            return Ok(finished);
        }

        let DecoderState::Accumulating(res) = &mut self.state else {
            return Ok(None);
        };
        if tag == TAG_GLITCH {
            apply_glitch(res, args)?;
        } else {
            apply_slave(res, args, line)?;
        }
        Ok(None)
    }

    /// Finalize the pending iteration, if any, and return to `Idle`
    pub fn finish(&mut self) -> Option<IterationResult> {
        match std::mem::replace(&mut self.state, DecoderState::Idle) {
            DecoderState::Accumulating(res) => Some(*res),
            DecoderState::Idle => None,
        }
    }

    /// Drop the pending iteration
    pub fn reset(&mut self) {
        self.state = DecoderState::Idle;
    }

    fn start_iteration(&self, args: &[&str]) -> Result<IterationResult, ProtocolViolation> {
        // args[0] is the iteration counter of the module
        let gval = hex_field(TAG_ITER, args, 1)?;
        let gdur = number_field(TAG_ITER, args, 2)?;
        let pdelay = number_field(TAG_ITER, args, 3)?;
        let mut res = IterationResult::new(self.task, gval, gdur, pdelay);
        if let Some(temperature) = args.get(4).map(|s| s.trim()) {
            if !temperature.is_empty() && temperature.chars().all(|c| c.is_ascii_digit()) {
                res.temperature = number_field(TAG_ITER, args, 4)?;
            }
        }
        debug!("ITER 0x{:x},{},{}", gval, gdur, pdelay);
        Ok(res)
    }
}

/// Last word of a field, so that a log prefix like `[  12.3] clkscrew: ITER`
/// resolves to `ITER`
fn tag_of(field: &str) -> &str {
    field
        .trim()
        .rsplit(|c: char| c.is_whitespace() || c == ':')
        .next()
        .unwrap_or_default()
}

/// Tag of a field. Any word starting with `ITER` opens an iteration, so
/// numbered variants like `ITER-01` are recognised too.
fn known_tag(field: &str) -> Option<&'static str> {
    let word = tag_of(field);
    if word.starts_with(TAG_ITER) {
        return Some(TAG_ITER);
    }
    [TAG_GLITCH, TAG_SLAVE].into_iter().find(|tag| *tag == word)
}

fn field<'a>(tag: &str, args: &[&'a str], index: usize) -> Result<&'a str, ProtocolViolation> {
    args.get(index)
        .map(|s| s.trim())
        .ok_or_else(|| ProtocolViolation::MissingField {
            tag: tag.to_string(),
            position: index + 1,
        })
}

fn number_field<T: FromStr>(tag: &str, args: &[&str], index: usize) -> Result<T, ProtocolViolation> {
    let value = field(tag, args, index)?;
    value.parse().map_err(|_| ProtocolViolation::MalformedField {
        tag: tag.to_string(),
        position: index + 1,
        value: value.to_string(),
    })
}

fn hex_field(tag: &str, args: &[&str], index: usize) -> Result<u64, ProtocolViolation> {
    let value = field(tag, args, index)?;
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|_| ProtocolViolation::MalformedField {
        tag: tag.to_string(),
        position: index + 1,
        value: value.to_string(),
    })
}

/// Payload fields after the sub-tag and its leading counter
fn payload(args: &[&str]) -> Vec<String> {
    args.iter().skip(2).map(|s| s.trim().to_string()).collect()
}

fn apply_glitch(res: &mut IterationResult, args: &[&str]) -> Result<(), ProtocolViolation> {
    if args.len() < 3 {
        warn!("Skipping short glitch line: {:?}", args);
        return Ok(());
    }
    debug!("  GLITCH {:?}", args);
    res.ccnt_g = number_field(TAG_GLITCH, args, 0)?;
    res.insn_g = number_field(TAG_GLITCH, args, 1)?;
    // First field is the anchor counter
    res.scratch_g = args[2]
        .trim()
        .split('|')
        .skip(1)
        .collect::<Vec<_>>()
        .join("|");
    Ok(())
}

fn apply_slave(res: &mut IterationResult, args: &[&str], line: &str) -> Result<(), ProtocolViolation> {
    let kind = field(TAG_SLAVE, args, 0)?;
    if kind != "EXPT_TEST" {
        debug!("  SLAVE {:?}", args);
    }
    match kind {
        "PASS" | "FAIL" | "DONE" => {
            res.ccnt_s = number_field(TAG_SLAVE, args, 1)?;
            res.insn_s = number_field(TAG_SLAVE, args, 2)?;
            res.ret_val = hex_field(TAG_SLAVE, args, 3)?;
            res.scratch_s = args.get(4).map(|s| s.trim().to_string()).unwrap_or_default();
            res.verdict = Some(if kind == "FAIL" {
                Verdict::Fail
            } else {
                Verdict::Pass
            });
        }
        "FAIL_RND" => {
            res.fail_rnd = args[1..]
                .iter()
                .map(|s| s.trim())
                .collect::<Vec<_>>()
                .join(",");
        }
        "FAIL_MOD" => res.fail_mod.extend(payload(args)),
        "FAIL_CT" => res.fail_ct.extend(payload(args)),
        "FAIL_RRND" => res.fail_rrnd.extend(payload(args)),
        "FAIL_MODR" => res.fail_modr.extend(payload(args)),
        "EXPT_TEST" => res.expt_test.extend(payload(args)),
        "TZFAIL" => res.tz_failed = true,
        "PROFILE" => {
            res.profile = Some(ProfileStats {
                slave_wait_cycles: number_field(TAG_SLAVE, args, 1)?,
                slave_timeouts: number_field(TAG_SLAVE, args, 2)?,
                glitch_wait_cycles: number_field(TAG_SLAVE, args, 3)?,
                glitch_timeouts: number_field(TAG_SLAVE, args, 4)?,
            });
        }
        other => {
            return Err(ProtocolViolation::UnknownSlaveTag {
                tag: other.to_string(),
                line: line.to_string(),
            })
        }
    }
    Ok(())
}
