//! The emulator invocation contract
//!
//! One invocation is a fixed argument vector plus an exit code drawn
//! from a per-stage taxonomy. The values below are protocol constants
//! shared with the instrumented emulator, not implementation choices.

use crate::config::Config;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

/// Identification: a new status-register read site was found.
pub const RC_NEW_SR_READ: i32 = 0x20;
/// Identification: a category was fixed up mid-run; identification
/// must be re-run once before its output is trusted.
pub const RC_CAT_FIXUP: i32 = 0x19;
/// Identification: no unmodeled read was seen for an extended window;
/// extraction has converged.
pub const RC_CONVERGED: i32 = 0x30;
/// Exploration: the enclosing function returned cleanly.
pub const RC_CLEAN_RETURN: i32 = 0x21;
/// Exploration: the firmware made no progress and was halted.
pub const RC_HANG: i32 = 0x23;
/// Exploration contract violation: the status-register model the
/// document promises does not exist.
pub const RC_MISSING_SR_MODEL: i32 = 0x24;
/// Fuzzing: the firmware touched a register the model has not
/// categorized. Extraction must resume.
pub const RC_AUP_UNCAT_REG: i32 = 0x40;
/// Fuzzing: the firmware polled a status register at a read site the
/// model does not cover. Extraction must resume.
pub const RC_AUP_UNMODELED_SITE: i32 = 0x41;

lazy_static! {
    static ref KNOWN_VIOLATIONS: HashMap<i32, &'static str> = {
        let mut m = HashMap::new();
        m.insert(
            RC_MISSING_SR_MODEL,
            "emulator could not find a status-register model the document says exists",
        );
        m
    };
}

/// A human-readable explanation for exit codes that are known contract
/// violations, surfaced alongside the raw code when a run aborts.
pub fn describe_code(code: i32) -> Option<&'static str> {
    KNOWN_VIOLATIONS.get(&code).copied()
}

/// Explain why a fuzzing run bounced back into extraction.
pub fn describe_aup(code: i32) -> &'static str {
    match code {
        RC_AUP_UNCAT_REG => "access to an uncategorized register",
        RC_AUP_UNMODELED_SITE => "status-register read at an unmodeled site",
        _ => "unknown unmodeled-peripheral access reason",
    }
}

/// The emulator stages this engine drives. The fuzzing stage (wire id
/// 3) belongs to the external campaign launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Identify,
    /// Re-run of identification after a mid-run category fixup.
    IdentifyRetry,
    Explore,
}

impl Stage {
    pub fn wire_id(self) -> u32 {
        match self {
            Stage::Identify | Stage::IdentifyRetry => 1,
            Stage::Explore => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Identify => "identification",
            Stage::IdentifyRetry => "identification rerun",
            Stage::Explore => "exploration",
        }
    }

    /// Exit codes that are part of the protocol for this stage.
    /// Anything else is a contract violation.
    pub fn expected_codes(self) -> &'static [i32] {
        match self {
            Stage::Identify => &[RC_NEW_SR_READ, RC_CAT_FIXUP, RC_CONVERGED],
            Stage::IdentifyRetry => &[RC_NEW_SR_READ, RC_CONVERGED],
            Stage::Explore => &[RC_CLEAN_RETURN, RC_HANG],
        }
    }
}

/// Per-invocation file paths.
#[derive(Debug, Clone, Default)]
pub struct StageIo {
    pub model_input: Option<PathBuf>,
    pub model_output: PathBuf,
    pub trace: PathBuf,
    pub reg_acc: PathBuf,
    pub sr_input: Option<PathBuf>,
    pub fuzz_input: Option<PathBuf>,
}

/// Builder for emulator command lines: the fixed base arguments from
/// the configuration plus the per-stage ones.
#[derive(Debug, Clone)]
pub struct EmulatorCmd {
    bin: PathBuf,
    base: Vec<String>,
}

impl EmulatorCmd {
    pub fn new(config: &Config) -> Self {
        let mut base = config.emulator.args.clone();
        base.push("-board".to_string());
        base.push(config.program.board.clone());
        base.push("-mcu".to_string());
        base.push(config.program.mcu.clone());
        base.push("-image".to_string());
        base.push(config.program.image.display().to_string());
        EmulatorCmd {
            bin: config.emulator.bin.clone(),
            base,
        }
    }

    pub fn build(&self, stage: Stage, io: &StageIo) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.base);
        cmd.arg("-pm-stage").arg(stage.wire_id().to_string());
        cmd.arg("-trace").arg(&io.trace);
        cmd.arg("-reg-acc").arg(&io.reg_acc);
        cmd.arg("-model-output").arg(&io.model_output);
        if let Some(input) = &io.model_input {
            cmd.arg("-model-input").arg(input);
        }
        if let Some(sr_input) = &io.sr_input {
            cmd.arg("-sr-input").arg(sr_input);
        }
        if let Some(fuzz_input) = &io.fuzz_input {
            cmd.arg("-aflFile").arg(fuzz_input);
        }
        cmd
    }
}

/// Render a command for logging.
pub fn render(cmd: &Command) -> String {
    format!("{:?}", cmd)
}
