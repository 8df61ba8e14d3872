//! Prerequisite records: the bit patterns a status register must
//! present for the firmware to make forward progress

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Whether a constrained bit must be set or cleared.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum BitState {
    Clear,
    Set,
}

impl TryFrom<u8> for BitState {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, String> {
        match code {
            0 => Ok(BitState::Clear),
            1 => Ok(BitState::Set),
            _ => Err(format!("unknown bit state code {}", code)),
        }
    }
}

impl From<BitState> for u8 {
    fn from(state: BitState) -> u8 {
        match state {
            BitState::Clear => 0,
            BitState::Set => 1,
        }
    }
}

/// One constraint on one status register: the bit positions involved
/// (-1 meaning "no constraint") and whether they must be set or clear.
///
/// Serializes as the two-element array `[[bits...], 0|1]` the emulator
/// consumes.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BitConstraint(pub Vec<i32>, pub BitState);

/// One prerequisite: a bit constraint per involved status register,
/// ordered outermost first to match the signature-tree nesting.
pub type ConstraintTuple = Vec<BitConstraint>;

/// Everything inferred about one status-register read site under one
/// control configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrereqRecord {
    pub sr_num: usize,
    pub sr_idx: Vec<usize>,
    /// Bits set simultaneously in each synthetic input (1, or 2 when
    /// escalated).
    pub set_bits: u32,

    /// Read index within the basic block of a combined control/status
    /// register, when one is involved.
    #[serde(
        rename = "CR_SR_r_idx",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cr_sr_r_idx: Option<u32>,

    /// Conditions that unlock forward progress.
    #[serde(default)]
    pub satisfy: Vec<ConstraintTuple>,
    /// Error conditions that must be cleared.
    #[serde(default)]
    pub never_satisfy: Vec<ConstraintTuple>,
    /// Checked but unclassified conditions.
    #[serde(default)]
    pub other: Vec<ConstraintTuple>,

    /// Diagnostics only; present when the run was started with
    /// `--diagnostics`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srr_func: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbl_cnt: Option<u64>,
}

impl PrereqRecord {
    /// Append another record's findings to this one. Re-visits of the
    /// same (configuration, read-site) key accumulate rather than
    /// overwrite.
    pub fn merge(&mut self, other: PrereqRecord) {
        self.satisfy.extend(other.satisfy);
        self.never_satisfy.extend(other.never_satisfy);
        self.other.extend(other.other);
    }
}
