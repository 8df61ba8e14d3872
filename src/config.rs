//! Run configuration file representation

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// In-memory representation of the extraction configuration.
///
/// This file is typically named `regprobe.json` and describes the
/// emulator binary, the firmware program under test, and the knobs of
/// the extraction loop. Unknown keys are rejected so that a stale or
/// misspelled configuration fails at load time instead of silently
/// falling back to defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub emulator: EmulatorConfig,
    pub program: ProgramConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

/// The instrumented emulator binary and any fixed arguments it needs
/// before the per-stage ones (verbosity, display suppression, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmulatorConfig {
    pub bin: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The firmware program under test.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramConfig {
    pub board: String,
    pub mcu: String,
    pub image: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionConfig {
    /// How many times an invocation with an unexpected exit code is
    /// re-run before the whole extraction aborts.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Watchdog timeout per emulator invocation, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Size of the MMIO window owned by one peripheral. Register
    /// accesses are attributed to the triggering peripheral only when
    /// they fall within `[base, base + peri_addr_range)`. Peripherals
    /// with overlapping or non-contiguous windows are not supported;
    /// this is a configuration invariant to validate, not infer.
    #[serde(default = "default_peri_addr_range")]
    pub peri_addr_range: u64,

    /// Disassembler used to bound exploration by call-site return
    /// addresses.
    #[serde(default = "default_objdump")]
    pub objdump: String,
}

fn default_retry_limit() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_peri_addr_range() -> u64 {
    0x200
}

fn default_objdump() -> String {
    "objdump".to_string()
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            retry_limit: default_retry_limit(),
            timeout_secs: default_timeout_secs(),
            peri_addr_range: default_peri_addr_range(),
            objdump: default_objdump(),
        }
    }
}

impl Config {
    /// Read and validate the configuration.
    ///
    /// Paths are made absolute here because the run later changes into
    /// its per-run working directory.
    pub fn read(filename: &Path) -> Result<Self> {
        let file = fs::File::open(filename).map_err(|e| {
            Error::Config(format!("cannot open {}: {}", filename.display(), e))
        })?;
        let mut config: Self = serde_json::from_reader(file)?;

        config.emulator.bin = fs::canonicalize(&config.emulator.bin).map_err(|e| {
            Error::Config(format!(
                "emulator binary {}: {}",
                config.emulator.bin.display(),
                e
            ))
        })?;
        config.program.image = fs::canonicalize(&config.program.image).map_err(|e| {
            Error::Config(format!(
                "firmware image {}: {}",
                config.program.image.display(),
                e
            ))
        })?;

        if config.extraction.peri_addr_range == 0 {
            return Err(Error::Config(
                "peri_addr_range must be positive".to_string(),
            ));
        }
        if config.extraction.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be positive".to_string()));
        }

        Ok(config)
    }
}
