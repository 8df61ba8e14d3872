//! Functional classification of checked bits
//!
//! Exploration tells us which bits the firmware inspects; this module
//! decides what each checked combination means. A combination either
//! unlocks forward progress (`satisfy`), marks an error state the
//! firmware refuses to proceed past (`never_satisfy`), or stays
//! unclassified (`other`). The decision keys on the set of termination
//! outcomes observed across the checked inputs.

use crate::emulator::{RC_CLEAN_RETURN, RC_HANG};
use crate::extract::combo::BitCombo;
use crate::extract::readsite::ReadSite;
use crate::extract::sigtree::SigNode;
use crate::model::{BitConstraint, BitState, Category, ConstraintTuple, PrereqRecord, Register};
use crate::trace::{Coverage, RegAccess};
use log::warn;
use std::collections::BTreeSet;

/// Everything observed while exploring one checked input.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Bit combinations per register, outermost first.
    pub path: Vec<BitCombo>,
    /// Termination code, clean return or hang.
    pub code: i32,
    pub reg_acc: Vec<RegAccess>,
    pub coverage: Coverage,
}

/// Inputs to one classification pass, assembled by the orchestrator
/// after the signature tree has been marked.
pub struct ClassifyInput<'a> {
    pub site: &'a ReadSite,
    /// The marked signature tree, for wildcard resolution.
    pub tree: &'a SigNode,
    /// Bits set per register in each synthetic input.
    pub set_bits: u32,
    /// One observation per traversed combination, in generation order:
    /// the all-clear baseline first, then each checked combination.
    pub observations: Vec<Observation>,
    /// Run-wide coverage before exploration started.
    pub baseline_cov: &'a Coverage,
    /// The peripheral's register list at classification time.
    pub regs: &'a [Register],
    /// Width of the peripheral's register window, in bytes.
    pub peri_addr_range: u64,
    pub diagnostics: bool,
}

/// End address of the basic block holding the final status-register
/// read, i.e. where the firmware was polling when the run ended.
fn final_read_site(accs: &[RegAccess]) -> Option<u64> {
    accs.iter()
        .rev()
        .find(|a| a.category.is_status() && !a.is_write)
        .map(|a| a.bbl.1)
}

/// Basic blocks executed that the pre-exploration baseline never saw.
fn new_coverage(cov: &Coverage, baseline: &Coverage) -> usize {
    cov.keys().filter(|bbl| !baseline.contains_key(bbl)).count()
}

fn wrote_status_register(accs: &[RegAccess]) -> bool {
    accs.iter().any(|a| a.category.is_status() && a.is_write)
}

/// Count data-register traffic between the polling loop's exit and the
/// next status-register read. Only accesses inside the peripheral's
/// own register window, to registers the model still calls data, are
/// counted.
fn data_traffic(input: &ClassifyInput, accs: &[RegAccess]) -> (u32, u32) {
    let base = input.site.peri_base;
    let end = base + input.peri_addr_range;
    let reg_bytes = (input.site.sr_bits / 8).max(1) as u64;

    let mut reads = 0;
    let mut writes = 0;
    for acc in accs
        .iter()
        .skip_while(|a| a.category.is_status() && !a.is_write)
    {
        if acc.category.is_status() && !acc.is_write {
            break;
        }
        if acc.category != Category::Data || acc.addr < base || acc.addr >= end {
            continue;
        }
        let reg_idx = ((acc.addr - base) / reg_bytes) as usize;
        if input
            .regs
            .get(reg_idx)
            .map_or(false, |r| r.category == Category::Data)
        {
            if acc.is_write {
                writes += 1;
            } else {
                reads += 1;
            }
        }
    }
    (reads, writes)
}

/// Resolve one register's baseline placeholder against the bits the
/// inner register turned out to check. A register checking more than
/// one combination cannot be pinned, so the whole entry is dropped.
fn resolve_wildcard(
    tree: &SigNode,
    path: &[BitCombo],
    level: usize,
    classified: bool,
) -> Option<BitConstraint> {
    let node = tree.node_at(&path[..level])?;
    match node.checked_bits.len() {
        0 => Some(BitConstraint(vec![-1], BitState::Clear)),
        1 => Some(BitConstraint(node.checked_bits[0].0.clone(), BitState::Clear)),
        n => {
            if classified {
                warn!(
                    "register checks {} distinct bit combinations; cannot pin the cleared bits of a classified condition, dropping it",
                    n
                );
            } else {
                warn!(
                    "register checks {} distinct bit combinations; dropping ambiguous unclassified entry",
                    n
                );
            }
            None
        }
    }
}

/// Turn a combination path into the wire-format constraint tuple. Set
/// registers constrain their bits set; baseline registers constrain the
/// inner register's own checked bit cleared, when it is unambiguous.
fn to_tuple(tree: &SigNode, path: &[BitCombo], classified: bool) -> Option<ConstraintTuple> {
    let mut tuple = ConstraintTuple::new();
    for (level, combo) in path.iter().enumerate() {
        if combo.is_baseline() {
            tuple.push(resolve_wildcard(tree, path, level, classified)?);
        } else {
            tuple.push(BitConstraint(combo.0.clone(), BitState::Set));
        }
    }
    Some(tuple)
}

/// Classify every checked combination and assemble the prerequisite
/// record for the read site.
pub fn classify(input: &ClassifyInput) -> PrereqRecord {
    let mut satisfy_idx: Vec<usize> = Vec::new();
    let mut never_idx: Vec<usize> = Vec::new();

    let codes: BTreeSet<i32> = input.observations.iter().map(|o| o.code).collect();
    let hangs = codes.contains(&RC_HANG);
    let cleans = codes.contains(&RC_CLEAN_RETURN);

    if hangs && cleans {
        // The firmware stalls until one specific condition shows up:
        // the first combination that let it return is the unlock. The
        // baseline observes first, so a busy-flag poll where setting
        // the bit stalls classifies as an active-low unlock.
        if let Some(i) = input
            .observations
            .iter()
            .position(|o| o.code == RC_CLEAN_RETURN)
        {
            satisfy_idx.push(i);
        }
        let checked = input
            .observations
            .iter()
            .filter(|o| !o.path.iter().all(BitCombo::is_baseline))
            .count();
        if checked > 1 {
            warn!(
                "{} checked combinations with mixed outcomes at {}; only the first clean return is classified",
                checked,
                input.site.site_key
            );
        }
    } else if hangs {
        let sites: BTreeSet<Option<u64>> = input
            .observations
            .iter()
            .map(|o| final_read_site(&o.reg_acc))
            .collect();
        let original = Some(input.site.bbl_e);

        if sites.len() == 2 && sites.contains(&original) {
            // The firmware moved on to poll a different register: the
            // combination that got it past this site is the unlock.
            if let Some(i) = input
                .observations
                .iter()
                .position(|o| final_read_site(&o.reg_acc) != original)
            {
                satisfy_idx.push(i);
            }
        } else if sites.len() == 1 {
            // All inputs end up polling the same register. The one
            // that drove the firmware through strictly the most new
            // code did something; whether it helped or hurt shows in
            // how the firmware reacted.
            let gains: Vec<usize> = input
                .observations
                .iter()
                .map(|o| new_coverage(&o.coverage, input.baseline_cov))
                .collect();
            let best = gains.iter().copied().max().unwrap_or(0);
            let winners: Vec<usize> = gains
                .iter()
                .enumerate()
                .filter(|(_, g)| **g == best)
                .map(|(i, _)| i)
                .collect();
            if winners.len() == 1 && best > 0 {
                let i = winners[0];
                if wrote_status_register(&input.observations[i].reg_acc) {
                    // Clearing the bit by writing the register is the
                    // signature of error handling.
                    never_idx.push(i);
                } else {
                    satisfy_idx.push(i);
                }
            } else {
                warn!(
                    "hang-only outcomes at {} with no strict coverage winner; leaving combinations unclassified",
                    input.site.site_key
                );
            }
        } else if !input.observations.is_empty() {
            warn!(
                "hang-only outcomes at {} end at {} distinct read sites; leaving combinations unclassified",
                input.site.site_key,
                sites.len()
            );
        }
    } else if cleans {
        // Every input returned cleanly, so the checked bits gate data
        // movement rather than progress. A data-register read right
        // after the poll means receive-ready; a write, transmit-ready.
        for (i, obs) in input.observations.iter().enumerate() {
            let (dr_r, dr_w) = data_traffic(input, &obs.reg_acc);
            if dr_r + dr_w > 1 {
                warn!(
                    "combination at {} touches the data register {} times before the next poll",
                    input.site.site_key,
                    dr_r + dr_w
                );
            }
            if dr_r > 0 || dr_w > 0 {
                satisfy_idx.push(i);
            }
        }
    }

    let mut record = PrereqRecord {
        sr_num: input.site.sr_num,
        sr_idx: input.site.sr_idx.clone(),
        set_bits: input.set_bits,
        cr_sr_r_idx: if input.site.cr_sr_r_idx != 0 {
            Some(input.site.cr_sr_r_idx)
        } else {
            None
        },
        satisfy: Vec::new(),
        never_satisfy: Vec::new(),
        other: Vec::new(),
        srr_func: if input.diagnostics {
            Some(input.site.sr_func.clone())
        } else {
            None
        },
        bbl_cnt: if input.diagnostics {
            Some(input.site.bbl_cnt)
        } else {
            None
        },
    };

    for (i, obs) in input.observations.iter().enumerate() {
        if satisfy_idx.contains(&i) {
            if let Some(t) = to_tuple(input.tree, &obs.path, true) {
                record.satisfy.push(t);
            }
        } else if never_idx.contains(&i) {
            if let Some(t) = to_tuple(input.tree, &obs.path, true) {
                record.never_satisfy.push(t);
            }
        } else if let Some(t) = to_tuple(input.tree, &obs.path, false) {
            record.other.push(t);
        }
    }
    record
}
