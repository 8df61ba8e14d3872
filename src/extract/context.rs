//! Per-depth artifact naming
//!
//! One depth iteration leaves behind a chain of immutable model
//! snapshots plus the traces, access logs, and synthetic inputs of its
//! stages, all relative to the run directory. Snapshot names carry the
//! depth and a running stage ordinal, so no file is ever written twice.

use crate::extract::combo::ComboLabel;
use std::path::PathBuf;

#[derive(Debug)]
pub struct DepthContext {
    depth: u32,
    next_stage: u32,
}

impl DepthContext {
    pub fn new(depth: u32) -> Self {
        DepthContext {
            depth,
            next_stage: 0,
        }
    }

    /// Allocate the next model snapshot path for this depth.
    pub fn next_snapshot(&mut self) -> PathBuf {
        let path = PathBuf::from(format!(
            "model-depth{}-stage{}.json",
            self.depth, self.next_stage
        ));
        self.next_stage += 1;
        path
    }

    pub fn identify_trace(&self) -> PathBuf {
        PathBuf::from(format!("trace-depth{}", self.depth))
    }

    pub fn identify_reg_acc(&self) -> PathBuf {
        PathBuf::from(format!("reg-acc-depth{}", self.depth))
    }

    /// Directory the synthetic status-register inputs of one
    /// escalation level are written into.
    pub fn sr_input_dir(&self, level: u32) -> PathBuf {
        PathBuf::from(format!("sr-input-depth{}-level{}", self.depth, level))
    }

    pub fn sr_input(&self, level: u32, label: &ComboLabel) -> PathBuf {
        self.sr_input_dir(level).join(label.to_string())
    }

    /// Directory the per-input exploration artifacts of one escalation
    /// level land in.
    pub fn explore_dir(&self, level: u32) -> PathBuf {
        PathBuf::from(format!("explore-depth{}-level{}", self.depth, level))
    }

    pub fn explore_trace(&self, level: u32, label: &ComboLabel) -> PathBuf {
        self.explore_dir(level).join(format!("trace-{}", label))
    }

    pub fn explore_reg_acc(&self, level: u32, label: &ComboLabel) -> PathBuf {
        self.explore_dir(level).join(format!("reg-acc-{}", label))
    }

    pub fn explore_model(&self, level: u32, label: &ComboLabel) -> PathBuf {
        self.explore_dir(level).join(format!("model-{}.json", label))
    }

    /// Diagnostic dump of one escalation level's marked signature tree.
    pub fn trace_summary(&self, level: u32) -> PathBuf {
        PathBuf::from(format!(
            "trace-summary-depth{}-level{}.json",
            self.depth, level
        ))
    }
}
