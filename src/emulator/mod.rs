//! Driving the external instrumented emulator

mod cmd;
mod invoke;

pub use cmd::{
    describe_aup, describe_code, render, EmulatorCmd, Stage, StageIo, RC_AUP_UNCAT_REG,
    RC_AUP_UNMODELED_SITE, RC_CAT_FIXUP, RC_CLEAN_RETURN, RC_CONVERGED, RC_HANG,
    RC_MISSING_SR_MODEL, RC_NEW_SR_READ,
};
pub use invoke::{HangPolicy, Invoker};
