//! Retrying invoker with a wall-clock watchdog
//!
//! Every emulator run goes through here. A hung child is killed by the
//! watchdog and recorded as a hang outcome, never silently dropped; an
//! exit code outside the stage's expected set is retried up to the
//! configured budget before the run aborts with the raw code surfaced.

use crate::emulator::cmd::{self, Stage, RC_HANG};
use crate::error::{Error, Result};
use log::{debug, error, warn};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// What a watchdog kill means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangPolicy {
    /// Identification/exploration: the hang is an observation, mapped
    /// to the exploration hang code.
    Record,
    /// Single-input fuzz-seed probes: a seed must never hang, so the
    /// kill aborts the run.
    Fatal,
}

enum Outcome {
    Exited(i32),
    TimedOut,
}

pub struct Invoker {
    retry_limit: u32,
    timeout: Duration,
}

impl Invoker {
    pub fn new(retry_limit: u32, timeout: Duration) -> Self {
        Invoker {
            // A budget of zero still gets one attempt.
            retry_limit: retry_limit.max(1),
            timeout,
        }
    }

    /// Run one invocation to completion, retrying unexpected exit
    /// codes. `make` builds a fresh command per attempt.
    pub fn invoke<F>(&self, make: F, stage: Stage, hang: HangPolicy) -> Result<i32>
    where
        F: Fn() -> Command,
    {
        let mut last_code = 0;
        for attempt in 1..=self.retry_limit {
            let code = match self.run_once(make())? {
                Outcome::Exited(code) => code,
                Outcome::TimedOut => match hang {
                    HangPolicy::Record => {
                        warn!(
                            "{} run exceeded {:?}, killed by watchdog; recording hang",
                            stage.name(),
                            self.timeout
                        );
                        return Ok(RC_HANG);
                    }
                    HangPolicy::Fatal => return Err(Error::SeedHang),
                },
            };
            debug!("{} exit code: 0x{:x}", stage.name(), code);
            if stage.expected_codes().contains(&code) {
                return Ok(code);
            }
            warn!(
                "{} returned 0x{:x} (attempt {}/{}), re-running",
                stage.name(),
                code,
                attempt,
                self.retry_limit
            );
            last_code = code;
        }

        if let Some(reason) = cmd::describe_code(last_code) {
            error!("{}", reason);
        }
        Err(Error::Protocol {
            stage: stage.name(),
            code: last_code,
            attempts: self.retry_limit,
        })
    }

    fn run_once(&self, mut command: Command) -> Result<Outcome> {
        debug!("running {}", cmd::render(&command));
        let mut child = command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                // A signal death has no code; treat it as unexpected
                // so the retry/abort path reports it.
                return Ok(Outcome::Exited(status.code().unwrap_or(-1)));
            }
            if Instant::now() >= deadline {
                // The child had the whole timeout window to exit; all
                // that is left is the forceful kill and the reap.
                let _ = child.kill();
                child.wait()?;
                return Ok(Outcome::TimedOut);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}
