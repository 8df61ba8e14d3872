//! Peripheral-register model extraction for firmware fuzzing
//!
//! Drives an instrumented emulator through identification and
//! exploration stages, infers which memory-mapped register bits the
//! firmware waits on, and writes a model the fuzzing campaign can
//! replay peripherals from.

mod config;
mod emulator;
mod error;
mod extract;
mod model;
mod objdump;
mod trace;

use crate::config::Config;
use crate::emulator::describe_aup;
use crate::error::Result;
use crate::extract::{Engine, RunOptions};
use crate::model::ModelDoc;
use clap::{App, Arg};
use log::{error, info, warn};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Instant;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let matches = App::new("regprobe")
        .about("Extracts a behavioral peripheral-register model from firmware")
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("regprobe.json")
                .takes_value(true)
                .help("The configuration file to load"),
        )
        .arg(
            Arg::with_name("model-input")
                .long("model-input")
                .value_name("FILE")
                .takes_value(true)
                .help("Model snapshot to resume extraction from"),
        )
        .arg(
            Arg::with_name("run-num")
                .long("run-num")
                .value_name("DIR")
                .takes_value(true)
                .help("Working directory for this extraction run"),
        )
        .arg(
            Arg::with_name("from-forkserver")
                .long("from-forkserver")
                .help("The run was re-entered from the fuzzing forkserver"),
        )
        .arg(
            Arg::with_name("fuzz-input")
                .long("fuzz-input")
                .value_name("FILE")
                .takes_value(true)
                .help("Fuzzer input replayed by every emulator invocation"),
        )
        .arg(
            Arg::with_name("diagnostics")
                .long("diagnostics")
                .help("Annotate prerequisite records with read-site diagnostics"),
        )
        .get_matches();

    let config = Config::read(Path::new(
        matches.value_of("config").unwrap_or("regprobe.json"),
    ))?;

    // Everything below runs inside the per-run directory, so input
    // paths have to be absolute first.
    let model_input = match matches.value_of("model-input") {
        Some(path) => Some(fs::canonicalize(path)?),
        None => None,
    };
    let fuzz_input = match matches.value_of("fuzz-input") {
        Some(path) => Some(fs::canonicalize(path)?),
        None => None,
    };

    let run_dir = matches.value_of("run-num").unwrap_or("1");
    fs::create_dir_all(run_dir)?;
    env::set_current_dir(run_dir)?;

    let options = RunOptions {
        model_input,
        fuzz_input,
        from_forkserver: matches.is_present("from-forkserver"),
        diagnostics: matches.is_present("diagnostics"),
    };

    if options.from_forkserver {
        match &options.model_input {
            Some(path) => {
                let seed = ModelDoc::read(path)?;
                match &seed.access_to_unmodeled_peri {
                    Some(aup) => {
                        let reason = aup
                            .get("aup_reason")
                            .and_then(|v| v.as_i64())
                            .unwrap_or(0) as i32;
                        info!("re-entered from the forkserver: {}", describe_aup(reason));
                    }
                    None => warn!(
                        "re-entered from the forkserver but the seed model carries no access record"
                    ),
                }
            }
            None => warn!("re-entered from the forkserver without a seed model"),
        }
    }

    let started = Instant::now();
    let mut engine = Engine::new(config, options);
    let result = engine.run();
    // A failed run still gets its final artifacts written.
    if let Err(e) = engine.finalize() {
        warn!("could not write final artifacts: {}", e);
    }
    info!(
        "extraction finished in {:.1}s",
        started.elapsed().as_secs_f64()
    );
    result
}
