//! The peripheral model document
//!
//! This is the JSON document exchanged with the emulator. Each
//! sub-stage reads the previous snapshot, applies its adjustment, and
//! writes a new immutable snapshot; nothing mutates a snapshot in
//! place. Fields neither side of this crate interprets are carried
//! through untouched.

use crate::error::{Error, Result};
use crate::model::category::Category;
use crate::model::prereq::PrereqRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Configuration signature → read-site key → prerequisite record.
pub type EventTable = BTreeMap<String, BTreeMap<String, PrereqRecord>>;

/// One register descriptor as the emulator dumps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    #[serde(rename = "type")]
    pub category: Category,
    #[serde(default)]
    pub read: u32,
    #[serde(default)]
    pub write: u32,
    /// Status registers only: pinned once firmware-observed behavior
    /// confirms the register is genuinely status. May only go 0 → 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sr_locked: Option<u32>,
    /// Control registers only: last observed value, transient. Used
    /// solely to derive configuration signatures and stripped from the
    /// final model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cr_value: Option<String>,
}

impl Register {
    pub fn uncategorized() -> Self {
        Register {
            category: Category::Uncategorized,
            read: 0,
            write: 0,
            sr_locked: None,
            cr_value: None,
        }
    }

    pub fn locked(&self) -> bool {
        self.sr_locked.map_or(false, |v| v != 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peripheral {
    pub reg_size: u32,
    #[serde(default)]
    pub regs: Vec<Register>,
    #[serde(default)]
    pub events: EventTable,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Peripheral {
    /// Derive the configuration signature: `idx:value` for every
    /// control register, ascending index, comma-joined. Empty when the
    /// peripheral has no control registers.
    pub fn config_signature(&self) -> String {
        self.regs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.category.is_control())
            .map(|(i, r)| format!("{}:{}", i, r.cr_value.as_deref().unwrap_or("0")))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Prune the event table after control/status register deletions.
    ///
    /// Deleted control indices are dropped from every configuration
    /// signature; single-SR records describing a deleted status
    /// register are removed. Records landing on the same rewritten
    /// signature merge instead of clobbering each other.
    pub fn prune_events(&mut self, deleted_crs: &[usize], deleted_srs: &[usize]) {
        let old = std::mem::take(&mut self.events);
        for (sig, sites) in old {
            let new_sig = rewrite_signature(&sig, deleted_crs);

            let mut kept: BTreeMap<String, PrereqRecord> = BTreeMap::new();
            for (site, rec) in sites {
                if rec.sr_num == 1 && rec.sr_idx.first().map_or(false, |i| deleted_srs.contains(i))
                {
                    continue;
                }
                kept.insert(site, rec);
            }

            let slot = self.events.entry(new_sig).or_insert_with(BTreeMap::new);
            for (site, rec) in kept {
                match slot.get_mut(&site) {
                    Some(existing) => existing.merge(rec),
                    None => {
                        slot.insert(site, rec);
                    }
                }
            }
        }
        self.events.retain(|_, sites| !sites.is_empty());
    }
}

fn rewrite_signature(sig: &str, deleted_crs: &[usize]) -> String {
    if sig.is_empty() {
        return String::new();
    }
    sig.split(',')
        .filter(|entry| {
            entry
                .split(':')
                .next()
                .and_then(|idx| idx.parse::<usize>().ok())
                .map_or(true, |idx| !deleted_crs.contains(&idx))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// The transient read-site section the identification stage leaves in
/// the document while a depth iteration is unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrRead {
    pub sr_num: usize,
    pub sr_idx: Vec<usize>,
    /// Non-zero when a combined control/status register read needs
    /// special modeling.
    #[serde(rename = "CR_SR_r_idx", default)]
    pub cr_sr_r_idx: u32,
    pub peri_base_addr: u64,
    pub bbl_s: u64,
    pub bbl_e: u64,
    pub bbl_cnt: u64,
    pub sr_func: String,
    /// Return addresses bounding exploration; filled in by the
    /// read-site collection stage from the firmware disassembly.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sr_func_ret_addr: Vec<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The whole model document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelDoc {
    #[serde(default)]
    pub model: BTreeMap<String, Peripheral>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sr_read: Option<SrRead>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_to_unmodeled_peri: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelDoc {
    pub fn read(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .map_err(|e| Error::Model(format!("cannot open {}: {}", path.display(), e)))?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn peripheral(&self, key: &str) -> Result<&Peripheral> {
        self.model
            .get(key)
            .ok_or_else(|| Error::Model(format!("peripheral {} not in model", key)))
    }

    pub fn peripheral_mut(&mut self, key: &str) -> Result<&mut Peripheral> {
        self.model
            .get_mut(key)
            .ok_or_else(|| Error::Model(format!("peripheral {} not in model", key)))
    }

    /// Sanitize the document for downstream consumers: drop the
    /// transient read-site section and last-observed control values,
    /// and optionally the unmodeled-access marker a forkserver re-entry
    /// was seeded with.
    pub fn finalize(&mut self, strip_aup: bool) {
        self.sr_read = None;
        for peri in self.model.values_mut() {
            for reg in &mut peri.regs {
                reg.cr_value = None;
            }
        }
        if strip_aup {
            self.access_to_unmodeled_peri = None;
        }
    }

    /// Summary statistics embedded in the final model.
    pub fn statistics(&self) -> Value {
        let peri_list: Vec<&String> = self.model.keys().collect();
        let with_events: Vec<&String> = self
            .model
            .iter()
            .filter(|(_, p)| !p.events.is_empty())
            .map(|(k, _)| k)
            .collect();
        serde_json::json!({
            "peri_num": peri_list.len(),
            "peri_list": peri_list,
            "peri_with_event_num": with_events.len(),
            "peri_with_event_list": with_events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::prereq::{BitConstraint, BitState};

    fn status_record(sr: usize) -> PrereqRecord {
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

    fn peripheral_with_events() -> Peripheral {
        let mut events = EventTable::new();
        let mut sites = BTreeMap::new();
        sites.insert("0x8000200".to_string(), status_record(2));
        sites.insert("0x8000300".to_string(), status_record(1));
        events.insert("0:1a,3:ff".to_string(), sites);
        Peripheral {
            reg_size: 4,
            regs: vec![
                Register {
                    category: Category::Control,
                    read: 0,
                    write: 1,
                    sr_locked: None,
                    cr_value: Some("1a".to_string()),
                },
                Register {
                    category: Category::Status,
                    read: 1,
                    write: 0,
                    sr_locked: Some(0),
                    cr_value: None,
                },
                Register {
                    category: Category::Status,
                    read: 1,
                    write: 0,
                    sr_locked: Some(0),
                    cr_value: None,
                },
                Register {
                    category: Category::Control,
                    read: 0,
                    write: 2,
                    sr_locked: None,
                    cr_value: Some("ff".to_string()),
                },
            ],
            events,
            extra: Map::new(),
        }
    }

    #[test]
    fn config_signature_is_sorted_and_comma_joined() {
        let peri = peripheral_with_events();
        assert_eq!(peri.config_signature(), "0:1a,3:ff");
    }

    #[test]
    fn prune_drops_deleted_control_from_signatures() {
        let mut peri = peripheral_with_events();
        peri.prune_events(&[3], &[]);
        assert!(peri.events.contains_key("0:1a"));
        assert_eq!(peri.events["0:1a"].len(), 2);
    }

    #[test]
    fn prune_drops_records_of_deleted_status_register() {
        let mut peri = peripheral_with_events();
        peri.prune_events(&[], &[2]);
        let sites = &peri.events["0:1a,3:ff"];
        assert_eq!(sites.len(), 1);
        assert!(sites.contains_key("0x8000300"));
    }

    #[test]
    fn unknown_fields_pass_through() {
        let raw = r#"{
            "model": {},
            "dma_channels": [1, 2],
            "access_to_unmodeled_peri": {"aup_reason": 64}
        }"#;
        let doc: ModelDoc = serde_json::from_str(raw).unwrap();
        assert!(doc.extra.contains_key("dma_channels"));
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["dma_channels"], serde_json::json!([1, 2]));
    }

    #[test]
    fn finalize_strips_transients() {
        let mut doc = ModelDoc::default();
        doc.model.insert("0x40004400".to_string(), peripheral_with_events());
        doc.access_to_unmodeled_peri = Some(serde_json::json!({"aup_reason": 64}));
        doc.finalize(true);
        assert!(doc.access_to_unmodeled_peri.is_none());
        assert!(doc.model["0x40004400"]
            .regs
            .iter()
            .all(|r| r.cr_value.is_none()));
        let stats = doc.statistics();
        assert_eq!(stats["peri_num"], 1);
        assert_eq!(stats["peri_with_event_num"], 1);
    }
}
