//! Error type for model extraction

use std::io;
use thiserror::Error;

/// Error type for a model extraction run.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying cause of error is I/O related
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Underlying cause of error is JSON related
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file is missing required data or holds an
    /// invalid value.
    #[error("configuration error: {0}")]
    Config(String),

    /// The model document violates the schema the emulator contract
    /// promises (missing section, unknown category code, bad address).
    #[error("model document error: {0}")]
    Model(String),

    /// Disassembling the firmware image failed, so read-site return
    /// addresses cannot be bounded.
    #[error("disassembly failed: {0}")]
    Disasm(String),

    /// The emulator kept returning a code outside the expected set for
    /// the stage. The raw code is surfaced to the operator.
    #[error("emulator returned 0x{code:x} during {stage} after {attempts} attempts")]
    Protocol {
        stage: &'static str,
        code: i32,
        attempts: u32,
    },

    /// A single-input fuzz-seed probe hung and was killed by the
    /// watchdog. A fuzzer seed must never hang, so this is fatal.
    #[error("fuzz-seed probe hung and was killed by the watchdog")]
    SeedHang,
}

pub type Result<T> = std::result::Result<T, Error>;
