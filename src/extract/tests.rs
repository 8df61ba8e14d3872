//! Scenario tests wiring the extraction stages together without an
//! emulator: synthetic traces and access logs stand in for real runs.

use crate::emulator::{HangPolicy, Invoker, Stage, RC_CLEAN_RETURN};
use crate::error::Error;
use crate::extract::classify::{classify, ClassifyInput, Observation};
use crate::extract::combo::{generate, BitCombo, ComboLabel};
use crate::extract::readsite::ReadSite;
use crate::extract::reconcile::{
    demote_never_checked, reconcile_cross_depth, reconcile_intra, AdjustmentLog,
};
use crate::extract::sigtree::{all_unchecked, md5_hex, SigNode};
use crate::model::{
    BitConstraint, BitState, Category, ModelDoc, Peripheral, PrereqRecord, Register,
};
use crate::trace::{Coverage, RegAccess};
use std::collections::{BTreeMap, HashMap};
use std::process::Command;
use std::time::Duration;

fn uart_site() -> ReadSite {
    ReadSite {
        peri_base: 0x40004400,
        peri_key: "0x40004400".to_string(),
        sr_num: 1,
        sr_idx: vec![1],
        cr_sr_r_idx: 0,
        sr_bits: 8,
        bbl_e: 0x8000104,
        site_key: "0x8000104".to_string(),
        config_sig: "0:2c".to_string(),
        sr_func: "uart_poll".to_string(),
        bbl_cnt: 21,
    }
}

fn uart_regs() -> Vec<Register> {
    vec![
        Register {
            category: Category::Control,
            read: 0,
            write: 1,
            sr_locked: None,
            cr_value: Some("2c".to_string()),
        },
        Register {
            category: Category::Status,
            read: 5,
            write: 0,
            sr_locked: Some(0),
            cr_value: None,
        },
        Register {
            category: Category::Data,
            read: 2,
            write: 2,
            sr_locked: None,
            cr_value: None,
        },
    ]
}

fn uart_peripheral(events: BTreeMap<String, BTreeMap<String, PrereqRecord>>) -> Peripheral {
    Peripheral {
        reg_size: 1,
        regs: uart_regs(),
        events,
        extra: Default::default(),
    }
}

fn record_for(sr: usize) -> PrereqRecord {
    PrereqRecord {
        sr_num: 1,
        sr_idx: vec![sr],
        set_bits: 1,
        cr_sr_r_idx: None,
        satisfy: vec![vec![BitConstraint(vec![3], BitState::Set)]],
        never_satisfy: Vec::new(),
        other: Vec::new(),
        srr_func: None,
        bbl_cnt: None,
    }
}

fn events_with_record() -> BTreeMap<String, BTreeMap<String, PrereqRecord>> {
    let mut sites = BTreeMap::new();
    sites.insert("0x8000104".to_string(), record_for(1));
    let mut events = BTreeMap::new();
    events.insert("0:2c".to_string(), sites);
    events
}

fn sr_read(bbl_e: u64) -> RegAccess {
    RegAccess {
        addr: 0x40004401,
        category: Category::Status,
        is_write: false,
        value: 0,
        bbl: (bbl_e - 4, bbl_e),
    }
}

/// One status register, 8 bits, one bit checked and letting the
/// firmware return with a data-register read: the receive-ready case.
#[test]
fn single_bit_receive_ready_pipeline() {
    let inputs = generate(1, 8, 1);
    assert_eq!(inputs.len(), 9);

    // Only bit 3 drives the firmware down a different path.
    let mut tree = SigNode::build(1, 8, 1, &|label: &ComboLabel| {
        Ok(if label.0[0] == BitCombo(vec![3]) {
            md5_hex(b"returned with data")
        } else {
            md5_hex(b"stuck polling")
        })
    })
    .unwrap();
    let checked = tree.mark_checked();
    assert!(!all_unchecked(&checked));
    assert_eq!(tree.checked_bits, vec![BitCombo(vec![3])]);

    let data_read = RegAccess {
        addr: 0x40004402,
        category: Category::Data,
        is_write: false,
        value: 0x41,
        bbl: (0x8000110, 0x8000118),
    };
    let site = uart_site();
    let regs = uart_regs();
    let baseline = Coverage::new();
    let record = classify(&ClassifyInput {
        site: &site,
        tree: &tree,
        set_bits: 1,
        observations: vec![Observation {
            path: vec![BitCombo(vec![3])],
            code: RC_CLEAN_RETURN,
            reg_acc: vec![sr_read(0x8000104), data_read],
            coverage: Coverage::new(),
        }],
        baseline_cov: &baseline,
        regs: &regs,
        peri_addr_range: 0x200,
        diagnostics: true,
    });

    assert_eq!(
        record.satisfy,
        vec![vec![BitConstraint(vec![3], BitState::Set)]]
    );
    assert!(record.never_satisfy.is_empty());
    assert!(record.other.is_empty());
    assert_eq!(record.srr_func.as_deref(), Some("uart_poll"));
    assert_eq!(record.bbl_cnt, Some(21));
}

/// A busy flag: the all-clear input returns cleanly while setting the
/// checked bit keeps the firmware polling. The baseline path the tree
/// hands back is observed like any other, and its clean return pins
/// the bit active-low.
#[test]
fn busy_flag_baseline_return_pins_the_bit_cleared() {
    let mut tree = SigNode::build(1, 8, 1, &|label: &ComboLabel| {
        Ok(if label.0[0] == BitCombo(vec![3]) {
            md5_hex(b"stuck polling")
        } else {
            md5_hex(b"returned")
        })
    })
    .unwrap();
    let checked = tree.mark_checked();
    // The traversal always leads with the baseline path.
    assert_eq!(checked[0], vec![BitCombo(vec![-1])]);
    assert_eq!(checked[1], vec![BitCombo(vec![3])]);

    let site = uart_site();
    let regs = uart_regs();
    let baseline = Coverage::new();
    let observations: Vec<Observation> = checked
        .iter()
        .map(|path| Observation {
            path: path.clone(),
            code: if path[0] == BitCombo(vec![3]) {
                crate::emulator::RC_HANG
            } else {
                RC_CLEAN_RETURN
            },
            reg_acc: vec![sr_read(0x8000104)],
            coverage: Coverage::new(),
        })
        .collect();
    let record = classify(&ClassifyInput {
        site: &site,
        tree: &tree,
        set_bits: 1,
        observations,
        baseline_cov: &baseline,
        regs: &regs,
        peri_addr_range: 0x200,
        diagnostics: false,
    });

    assert_eq!(
        record.satisfy,
        vec![vec![BitConstraint(vec![3], BitState::Clear)]]
    );
    assert_eq!(
        record.other,
        vec![vec![BitConstraint(vec![3], BitState::Set)]]
    );
    assert!(record.never_satisfy.is_empty());
}

/// Two checked bits, both returning cleanly without touching any data
/// register: nothing to conclude, both stay unclassified.
#[test]
fn clean_returns_without_data_traffic_stay_other() {
    let mut tree = SigNode::build(1, 8, 1, &|label: &ComboLabel| {
        Ok(match label.0[0].0.first() {
            Some(&2) => md5_hex(b"variant two"),
            Some(&5) => md5_hex(b"variant five"),
            _ => md5_hex(b"default"),
        })
    })
    .unwrap();
    tree.mark_checked();

    let site = uart_site();
    let regs = uart_regs();
    let baseline = Coverage::new();
    let obs = |bit: i32| Observation {
        path: vec![BitCombo(vec![bit])],
        code: RC_CLEAN_RETURN,
        reg_acc: vec![sr_read(0x8000104)],
        coverage: Coverage::new(),
    };
    let record = classify(&ClassifyInput {
        site: &site,
        tree: &tree,
        set_bits: 1,
        observations: vec![obs(2), obs(5)],
        baseline_cov: &baseline,
        regs: &regs,
        peri_addr_range: 0x200,
        diagnostics: false,
    });

    assert!(record.satisfy.is_empty());
    assert!(record.never_satisfy.is_empty());
    assert_eq!(
        record.other,
        vec![
            vec![BitConstraint(vec![2], BitState::Set)],
            vec![BitConstraint(vec![5], BitState::Set)],
        ]
    );
}

/// A register's first categorization is not a contradiction: no
/// restart, and existing records survive.
#[test]
fn first_control_assignment_does_not_restart() {
    let mut old = ModelDoc::default();
    let mut uncat_peri = uart_peripheral(events_with_record());
    uncat_peri.regs[0] = Register::uncategorized();
    old.model.insert("0x40004400".to_string(), uncat_peri);

    let mut new = ModelDoc::default();
    new.model
        .insert("0x40004400".to_string(), uart_peripheral(events_with_record()));

    let mut log = AdjustmentLog::default();
    let outcome = reconcile_cross_depth(&old, &mut new, 1, &mut log);
    assert!(!outcome.restart);
    assert!(new.model["0x40004400"].events.contains_key("0:2c"));
}

/// A register that was data turning control invalidates everything
/// inferred under the old configuration space.
#[test]
fn control_change_restarts_and_discards_records() {
    let mut old = ModelDoc::default();
    let mut data_peri = uart_peripheral(events_with_record());
    data_peri.regs[0] = Register {
        category: Category::Data,
        read: 1,
        write: 1,
        sr_locked: None,
        cr_value: None,
    };
    old.model.insert("0x40004400".to_string(), data_peri);

    let mut new = ModelDoc::default();
    new.model
        .insert("0x40004400".to_string(), uart_peripheral(events_with_record()));

    let mut log = AdjustmentLog::default();
    let outcome = reconcile_cross_depth(&old, &mut new, 1, &mut log);
    assert!(outcome.restart);
    assert!(new.model["0x40004400"].events.is_empty());
    assert_eq!(log.adjustments.len(), 1);
    assert_eq!(log.adjustments[0].action, "control-insert");
}

/// All escalation levels see identical traces for every input: the
/// unlocked status register is demoted and its records pruned.
#[test]
fn never_checked_register_demotes_after_escalation() {
    for arity in [1u32, 1, 2] {
        let mut tree =
            SigNode::build(1, 8, arity, &|_: &ComboLabel| Ok(md5_hex(b"always the same")))
                .unwrap();
        let checked = tree.mark_checked();
        assert!(all_unchecked(&checked));
    }

    let mut doc = ModelDoc::default();
    doc.model
        .insert("0x40004400".to_string(), uart_peripheral(events_with_record()));
    let mut log = AdjustmentLog::default();
    let demoted = demote_never_checked(&mut doc, &uart_site(), 0, &mut log).unwrap();
    assert!(demoted);

    let peri = &doc.model["0x40004400"];
    assert_eq!(peri.regs[1].category, Category::Data);
    // The pruned record was the only one under that signature.
    assert!(peri.events.is_empty());
    assert_eq!(log.adjustments[0].action, "demote");
}

/// Persistent unexpected exit codes abort with the raw code surfaced,
/// and the snapshot the run started from is left untouched.
#[test]
fn aborted_run_leaves_the_last_snapshot_intact() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("model-depth0-stage0.json");
    let mut doc = ModelDoc::default();
    doc.model
        .insert("0x40004400".to_string(), uart_peripheral(events_with_record()));
    doc.write(&snapshot).unwrap();
    let before = std::fs::read_to_string(&snapshot).unwrap();

    let invoker = Invoker::new(3, Duration::from_millis(300));
    let err = invoker
        .invoke(
            || {
                let mut c = Command::new("sh");
                c.arg("-c").arg("exit 7");
                c
            },
            Stage::Identify,
            HangPolicy::Record,
        )
        .unwrap_err();
    match err {
        Error::Protocol { code, attempts, .. } => {
            assert_eq!(code, 7);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(std::fs::read_to_string(&snapshot).unwrap(), before);
    let reread = ModelDoc::read(&snapshot).unwrap();
    assert_eq!(reread, doc);
}

/// No sequence of intra-stage reconciliations can push a register
/// through a transition the partial order forbids.
#[test]
fn reconciliation_sequences_respect_the_transition_order() {
    use crate::model::ALL_CATEGORIES;

    let doc_with = |cat: Category| {
        let mut d = ModelDoc::default();
        d.model.insert(
            "0x40004400".to_string(),
            Peripheral {
                reg_size: 4,
                regs: vec![Register {
                    category: cat,
                    read: 0,
                    write: 0,
                    sr_locked: None,
                    cr_value: None,
                }],
                events: Default::default(),
                extra: Default::default(),
            },
        );
        d
    };

    for &a in &ALL_CATEGORIES {
        for &b in &ALL_CATEGORIES {
            for &c in &ALL_CATEGORIES {
                let step1 = reconcile_intra(&doc_with(a), &[doc_with(b)]);
                let got1 = step1.model["0x40004400"].regs[0].category;
                assert_eq!(got1, if a.can_become(b) { b } else { a });

                let step2 = reconcile_intra(&step1, &[doc_with(c)]);
                let got2 = step2.model["0x40004400"].regs[0].category;
                assert!(got1.can_become(got2), "{} -> {}", got1, got2);
            }
        }
    }
}

/// Re-visiting a (configuration, site) key merges findings in an
/// order-insensitive way.
#[test]
fn repeat_visits_merge_as_sets() {
    let mut a = record_for(1);
    let mut b = record_for(1);
    b.satisfy = vec![vec![BitConstraint(vec![5], BitState::Set)]];
    b.other = vec![vec![BitConstraint(vec![0], BitState::Set)]];

    let mut ab = a.clone();
    ab.merge(b.clone());
    let mut ba = b.clone();
    ba.merge(a.clone());

    let as_set = |v: &Vec<Vec<BitConstraint>>| {
        let mut s = v.clone();
        s.sort();
        s
    };
    assert_eq!(as_set(&ab.satisfy), as_set(&ba.satisfy));
    assert_eq!(as_set(&ab.other), as_set(&ba.other));

    // And a third merge of the same findings only appends.
    a.merge(b);
    assert_eq!(a.satisfy.len(), 2);
}

/// Generated inputs are addressable by the labels the signature tree
/// hands back, closing the loop between generation and exploration.
#[test]
fn checked_paths_name_generated_inputs() {
    let inputs = generate(2, 4, 1);
    let by_label: HashMap<ComboLabel, &[u8]> = inputs
        .iter()
        .map(|i| (i.label.clone(), i.data.as_slice()))
        .collect();

    let mut tree = SigNode::build(2, 4, 1, &|label: &ComboLabel| {
        assert!(by_label.contains_key(label), "{} was never generated", label);
        Ok(if label.0[0] == BitCombo(vec![2]) {
            md5_hex(b"divergent")
        } else {
            md5_hex(b"default")
        })
    })
    .unwrap();
    let checked = tree.mark_checked();
    for path in &checked {
        assert!(by_label.contains_key(&ComboLabel(path.clone())));
    }
}
