//! Category reconciliation between model snapshots
//!
//! The emulator re-derives register categories on every run, and a
//! later run can contradict an earlier one. Cross-depth reconciliation
//! compares the snapshot a depth iteration started from with the one
//! identification produced; intra-stage reconciliation folds the
//! per-input snapshots of one exploration round back into a single
//! model. Every accepted change is accumulated so the run can dump an
//! adjustment summary at exit.

use crate::extract::readsite::ReadSite;
use crate::model::{Category, ModelDoc, Peripheral, Register};
use log::{info, warn};
use serde::Serialize;

/// One accepted category adjustment, for the end-of-run summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Adjustment {
    pub depth: u32,
    pub peri: String,
    pub reg_idx: usize,
    pub from: Category,
    pub to: Category,
    pub action: &'static str,
}

/// Accumulates adjustments across the whole run.
#[derive(Debug, Default, Serialize)]
pub struct AdjustmentLog {
    pub adjustments: Vec<Adjustment>,
}

impl AdjustmentLog {
    pub fn record(
        &mut self,
        depth: u32,
        peri: &str,
        reg_idx: usize,
        from: Category,
        to: Category,
        action: &'static str,
    ) {
        self.adjustments.push(Adjustment {
            depth,
            peri: peri.to_string(),
            reg_idx,
            from,
            to,
            action,
        });
    }
}

/// Per-peripheral category changes found by a cross-depth diff.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CategoryShift {
    /// A register became control after having been categorized as
    /// something other than control. All prerequisites inferred under
    /// the old configuration space are stale.
    pub cr_ins: Vec<usize>,
    /// A control register stopped being control.
    pub cr_del: Vec<usize>,
    /// A status register stopped being status.
    pub sr_del: Vec<usize>,
    /// An already-categorized register turned into status.
    pub sr_ins: Vec<usize>,
}

impl CategoryShift {
    pub fn any(&self) -> bool {
        !self.cr_ins.is_empty()
            || !self.cr_del.is_empty()
            || !self.sr_del.is_empty()
            || !self.sr_ins.is_empty()
    }
}

/// Diff two register lists, ignoring transient control values. The
/// older, shorter list is padded with uncategorized entries; new
/// registers appearing for the first time shift nothing.
pub fn diff_registers(old: &[Register], new: &[Register]) -> CategoryShift {
    let mut shift = CategoryShift::default();
    let pad = Register::uncategorized();
    for (idx, nr) in new.iter().enumerate() {
        let or = old.get(idx).unwrap_or(&pad);
        let (ot, nt) = (or.category, nr.category);
        if ot == nt {
            continue;
        }
        if nt.is_control() && !ot.is_control() && ot != Category::Uncategorized {
            shift.cr_ins.push(idx);
        }
        if ot == Category::Control && nt != Category::ControlStatus {
            shift.cr_del.push(idx);
        }
        if ot == Category::Status && !nt.is_status() {
            shift.sr_del.push(idx);
        }
        if nt == Category::Status && ot != Category::Uncategorized {
            shift.sr_ins.push(idx);
        }
    }
    shift
}

/// Outcome of reconciling a freshly identified snapshot against the one
/// the depth started from.
#[derive(Debug, Default, PartialEq)]
pub struct CrossDepthOutcome {
    /// A control insertion invalidated a peripheral's prerequisites;
    /// the depth must restart from the adjusted model.
    pub restart: bool,
}

/// Reconcile the new snapshot against the previous depth's. Prunes or
/// discards prerequisite records made stale by category shifts; mutates
/// `new` in place.
pub fn reconcile_cross_depth(
    old: &ModelDoc,
    new: &mut ModelDoc,
    depth: u32,
    log: &mut AdjustmentLog,
) -> CrossDepthOutcome {
    let mut outcome = CrossDepthOutcome::default();
    for (key, peri) in new.model.iter_mut() {
        let old_regs: &[Register] = old
            .model
            .get(key)
            .map(|p| p.regs.as_slice())
            .unwrap_or(&[]);
        let shift = diff_registers(old_regs, &peri.regs);
        if !shift.any() {
            continue;
        }

        let pad = Register::uncategorized();
        let old_cat =
            |idx: usize| old_regs.get(idx).unwrap_or(&pad).category;

        if !shift.cr_ins.is_empty() {
            for &idx in &shift.cr_ins {
                warn!(
                    "{} register {} became {}; discarding the peripheral's prerequisites",
                    key, idx, peri.regs[idx].category
                );
                log.record(
                    depth,
                    key,
                    idx,
                    old_cat(idx),
                    peri.regs[idx].category,
                    "control-insert",
                );
            }
            peri.events.clear();
            outcome.restart = true;
        }

        if !shift.cr_del.is_empty() || !shift.sr_del.is_empty() {
            for &idx in shift.cr_del.iter().chain(&shift.sr_del) {
                info!(
                    "{} register {} is no longer {}; pruning its records",
                    key,
                    idx,
                    old_cat(idx)
                );
                log.record(
                    depth,
                    key,
                    idx,
                    old_cat(idx),
                    peri.regs[idx].category,
                    "delete",
                );
            }
            peri.prune_events(&shift.cr_del, &shift.sr_del);
        }

        for &idx in &shift.sr_ins {
            warn!(
                "{} register {} turned from {} into a status register; not reconciled",
                key,
                idx,
                old_cat(idx)
            );
            log.record(
                depth,
                key,
                idx,
                old_cat(idx),
                Category::Status,
                "status-insert",
            );
        }
    }
    outcome
}

fn merge_register(base: &mut Register, peri: &str, idx: usize, candidates: &[&Register]) {
    let news: Vec<Category> = {
        let mut cats: Vec<Category> = candidates
            .iter()
            .map(|r| r.category)
            .filter(|&c| c != base.category)
            .collect();
        cats.sort();
        cats.dedup();
        cats
    };
    match news.as_slice() {
        [] => {}
        [new] => {
            if base.category.can_become(*new) {
                base.category = *new;
            } else {
                warn!(
                    "{} register {}: forbidden category transition {} -> {}, keeping {}",
                    peri, idx, base.category, new, base.category
                );
            }
        }
        many => {
            warn!(
                "{} register {}: {} conflicting new categories, keeping {}",
                peri,
                idx,
                many.len(),
                base.category
            );
        }
    }

    for r in candidates {
        base.read = base.read.max(r.read);
        base.write = base.write.max(r.write);
        // The lock only ever latches on.
        if r.sr_locked.map_or(false, |v| v != 0) {
            base.sr_locked = Some(1);
        }
        if r.cr_value.is_some() {
            base.cr_value = r.cr_value.clone();
        }
    }
}

/// Fold one exploration round's per-input output snapshots back into
/// the model the round started from, producing the next snapshot.
pub fn reconcile_intra(base: &ModelDoc, outputs: &[ModelDoc]) -> ModelDoc {
    let mut merged = base.clone();
    for out in outputs {
        for (key, peri) in &out.model {
            let slot = merged
                .model
                .entry(key.clone())
                .or_insert_with(|| Peripheral {
                    reg_size: peri.reg_size,
                    regs: Vec::new(),
                    events: Default::default(),
                    extra: peri.extra.clone(),
                });
            while slot.regs.len() < peri.regs.len() {
                slot.regs.push(Register::uncategorized());
            }
        }
    }

    for (key, slot) in merged.model.iter_mut() {
        for idx in 0..slot.regs.len() {
            let candidates: Vec<&Register> = outputs
                .iter()
                .filter_map(|out| out.model.get(key))
                .filter_map(|p| p.regs.get(idx))
                .collect();
            if !candidates.is_empty() {
                merge_register(&mut slot.regs[idx], key, idx, &candidates);
            }
        }
    }
    merged
}

/// Demote a read site's never-checked, unlocked status registers to
/// data and drop the records that described them. Locked registers are
/// left alone with a warning. Returns whether anything was demoted.
pub fn demote_never_checked(
    doc: &mut ModelDoc,
    site: &ReadSite,
    depth: u32,
    log: &mut AdjustmentLog,
) -> crate::error::Result<bool> {
    let peri = doc.peripheral_mut(&site.peri_key)?;
    let mut demoted = Vec::new();
    for &idx in &site.sr_idx {
        let reg = match peri.regs.get_mut(idx) {
            Some(r) => r,
            None => continue,
        };
        if !reg.category.is_status() {
            continue;
        }
        if reg.locked() {
            warn!(
                "{} register {} is never checked but locked as status; leaving it unmodeled",
                site.peri_key, idx
            );
            continue;
        }
        info!(
            "{} register {} is never checked; demoting to a data register",
            site.peri_key, idx
        );
        log.record(
            depth,
            &site.peri_key,
            idx,
            reg.category,
            Category::Data,
            "demote",
        );
        reg.category = Category::Data;
        reg.sr_locked = None;
        demoted.push(idx);
    }
    if !demoted.is_empty() {
        peri.prune_events(&[], &demoted);
    }
    Ok(!demoted.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(category: Category) -> Register {
        Register {
            category,
            read: 0,
            write: 0,
            sr_locked: if category.is_status() { Some(0) } else { None },
            cr_value: None,
        }
    }

    #[test]
    fn first_categorization_is_not_an_insertion() {
        // Uncategorized -> control is a register being seen for the
        // first time, not a contradiction.
        let shift = diff_registers(
            &[reg(Category::Uncategorized)],
            &[reg(Category::Control)],
        );
        assert!(!shift.any());
    }

    #[test]
    fn recategorization_to_control_is_an_insertion() {
        let shift = diff_registers(&[reg(Category::Data)], &[reg(Category::Control)]);
        assert_eq!(shift.cr_ins, vec![0]);
        // Control gaining a status role keeps its control role.
        let shift = diff_registers(&[reg(Category::Control)], &[reg(Category::ControlStatus)]);
        assert!(shift.cr_ins.is_empty());
        assert!(shift.cr_del.is_empty());
    }

    #[test]
    fn deletions_and_padding() {
        // The old, shorter list pads with uncategorized entries.
        let shift = diff_registers(
            &[reg(Category::Control), reg(Category::Status)],
            &[
                reg(Category::Data),
                reg(Category::Data),
                reg(Category::Status),
            ],
        );
        assert_eq!(shift.cr_del, vec![0]);
        assert_eq!(shift.sr_del, vec![1]);
        assert!(shift.sr_ins.is_empty());
    }

    #[test]
    fn identical_snapshots_reconcile_to_nothing() {
        let mut doc = ModelDoc::default();
        doc.model.insert(
            "0x40004400".to_string(),
            Peripheral {
                reg_size: 4,
                regs: vec![reg(Category::Control), reg(Category::Status)],
                events: Default::default(),
                extra: Default::default(),
            },
        );
        let old = doc.clone();
        let mut log = AdjustmentLog::default();
        let outcome = reconcile_cross_depth(&old, &mut doc, 0, &mut log);
        assert!(!outcome.restart);
        assert!(log.adjustments.is_empty());
        assert_eq!(doc, old);

        let merged = reconcile_intra(&doc, &[doc.clone(), doc.clone()]);
        assert_eq!(merged, doc);
    }

    #[test]
    fn intra_conflict_keeps_the_old_category() {
        let base_doc = {
            let mut d = ModelDoc::default();
            d.model.insert(
                "0x40004400".to_string(),
                Peripheral {
                    reg_size: 4,
                    regs: vec![reg(Category::Uncategorized)],
                    events: Default::default(),
                    extra: Default::default(),
                },
            );
            d
        };
        let with_cat = |c: Category| {
            let mut d = base_doc.clone();
            d.model.get_mut("0x40004400").unwrap().regs[0] = reg(c);
            d
        };
        let merged = reconcile_intra(&base_doc, &[with_cat(Category::Data), with_cat(Category::Control)]);
        assert_eq!(
            merged.model["0x40004400"].regs[0].category,
            Category::Uncategorized
        );

        // A single agreeing divergence is taken.
        let merged = reconcile_intra(&base_doc, &[with_cat(Category::Data), with_cat(Category::Data)]);
        assert_eq!(merged.model["0x40004400"].regs[0].category, Category::Data);
    }

    #[test]
    fn intra_counts_take_the_maximum_and_lock_latches() {
        let mk = |read, write, locked| {
            let mut d = ModelDoc::default();
            d.model.insert(
                "0x40004400".to_string(),
                Peripheral {
                    reg_size: 4,
                    regs: vec![Register {
                        category: Category::Status,
                        read,
                        write,
                        sr_locked: Some(locked),
                        cr_value: None,
                    }],
                    events: Default::default(),
                    extra: Default::default(),
                },
            );
            d
        };
        let merged = reconcile_intra(&mk(2, 0, 0), &[mk(5, 1, 0), mk(3, 2, 1)]);
        let r = &merged.model["0x40004400"].regs[0];
        assert_eq!(r.read, 5);
        assert_eq!(r.write, 2);
        assert_eq!(r.sr_locked, Some(1));
    }

    #[test]
    fn never_checked_unlocked_status_demotes_to_data() {
        let mut doc = ModelDoc::default();
        doc.model.insert(
            "0x40004400".to_string(),
            Peripheral {
                reg_size: 4,
                regs: vec![reg(Category::Control), reg(Category::Status)],
                events: Default::default(),
                extra: Default::default(),
            },
        );
        let site = ReadSite {
            peri_base: 0x40004400,
            peri_key: "0x40004400".to_string(),
            sr_num: 1,
            sr_idx: vec![1],
            cr_sr_r_idx: 0,
            sr_bits: 32,
            bbl_e: 0x8000104,
            site_key: "0x8000104".to_string(),
            config_sig: String::new(),
            sr_func: "poll".to_string(),
            bbl_cnt: 1,
        };
        let mut log = AdjustmentLog::default();
        assert!(demote_never_checked(&mut doc, &site, 0, &mut log).unwrap());
        assert_eq!(
            doc.model["0x40004400"].regs[1].category,
            Category::Data
        );

        // A locked status register stays status.
        doc.model.get_mut("0x40004400").unwrap().regs[1] = Register {
            category: Category::Status,
            read: 0,
            write: 0,
            sr_locked: Some(1),
            cr_value: None,
        };
        let mut log = AdjustmentLog::default();
        assert!(!demote_never_checked(&mut doc, &site, 1, &mut log).unwrap());
        assert_eq!(
            doc.model["0x40004400"].regs[1].category,
            Category::Status
        );
    }
}
