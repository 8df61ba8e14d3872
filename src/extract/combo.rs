//! Synthetic status-register input generation
//!
//! For every suspected status register the exploration stage feeds the
//! firmware one input per choice of `arity` simultaneously-set bits,
//! plus an all-clear baseline, cartesian across registers. The label
//! both names the input file and keys the signature tree, and
//! round-trips with the bit buffer.

use crate::error::{Error, Result};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Bytes each register occupies in the input buffer. The emulator
/// always consumes a 4-byte big-endian mask per register, whatever the
/// declared register width.
pub const MASK_BYTES: usize = 4;

/// The bit positions set for one register in one input. All `-1` means
/// the all-clear baseline. Positions are strictly decreasing, which
/// keeps every choice of bits unique.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitCombo(pub Vec<i32>);

impl BitCombo {
    pub fn baseline(arity: u32) -> Self {
        BitCombo(vec![-1; arity as usize])
    }

    pub fn is_baseline(&self) -> bool {
        self.0.iter().all(|&b| b == -1)
    }

    pub fn mask(&self) -> u32 {
        self.0
            .iter()
            .filter(|&&b| b >= 0)
            .fold(0, |acc, &b| acc | (1u32 << b))
    }
}

impl fmt::Display for BitCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02}", b)).collect();
        write!(f, "{}", parts.join("+"))
    }
}

impl FromStr for BitCombo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bits = s
            .split('+')
            .map(|p| {
                p.parse::<i32>()
                    .map_err(|_| Error::Model(format!("bad bit position {:?}", p)))
            })
            .collect::<Result<Vec<i32>>>()?;
        Ok(BitCombo(bits))
    }
}

/// One combination across all registers, outermost register first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComboLabel(pub Vec<BitCombo>);

impl fmt::Display for ComboLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| format!("bit:{}", c)).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for ComboLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let combos = s
            .split(',')
            .map(|part| {
                part.strip_prefix("bit:")
                    .ok_or_else(|| Error::Model(format!("bad combination label {:?}", s)))
                    .and_then(BitCombo::from_str)
            })
            .collect::<Result<Vec<BitCombo>>>()?;
        Ok(ComboLabel(combos))
    }
}

/// One synthetic input: its label and the bytes the emulator reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComboInput {
    pub label: ComboLabel,
    pub data: Vec<u8>,
}

fn descending_choices(below: i32, arity: u32) -> Vec<Vec<i32>> {
    if arity == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for first in 0..below {
        for rest in descending_choices(first, arity - 1) {
            let mut combo = vec![first];
            combo.extend(rest);
            out.push(combo);
        }
    }
    out
}

/// Every combination for one register: each strictly-decreasing choice
/// of `arity` bits out of `width`, then the all-clear baseline.
pub fn register_combos(width: u32, arity: u32) -> Vec<BitCombo> {
    let mut combos: Vec<BitCombo> = descending_choices(width as i32, arity)
        .into_iter()
        .map(BitCombo)
        .collect();
    combos.push(BitCombo::baseline(arity));
    combos
}

/// The full ordered input set for `sr_num` registers of `width` bits
/// with `arity` bits set per register.
pub fn generate(sr_num: usize, width: u32, arity: u32) -> Vec<ComboInput> {
    let per_register = register_combos(width, arity);
    let mut out = vec![ComboInput {
        label: ComboLabel(Vec::new()),
        data: Vec::new(),
    }];
    for _ in 0..sr_num {
        let mut next = Vec::with_capacity(out.len() * per_register.len());
        for prefix in &out {
            for combo in &per_register {
                let mut label = prefix.label.0.clone();
                label.push(combo.clone());
                let mut data = prefix.data.clone();
                data.extend_from_slice(&combo.mask().to_be_bytes());
                next.push(ComboInput {
                    label: ComboLabel(label),
                    data,
                });
            }
        }
        out = next;
    }
    out
}

/// Materialize each input as a file named after its label.
pub fn write_inputs(dir: &Path, inputs: &[ComboInput]) -> Result<()> {
    fs::create_dir_all(dir)?;
    for input in inputs {
        fs::write(dir.join(input.label.to_string()), &input.data)?;
    }
    Ok(())
}
