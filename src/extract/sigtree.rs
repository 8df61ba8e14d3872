//! Trace signature trees
//!
//! If flipping a bit changes the execution trace, the firmware
//! inspected that bit; if most inputs produce identical traces, those
//! bits are irrelevant. The tree nests one level per status register,
//! innermost register at the leaves, and partitions each level's
//! children into the majority ("default") trace and the minority
//! groups whose labels are the checked bits.

use crate::error::Result;
use crate::extract::combo::{register_combos, BitCombo, ComboLabel};
use log::warn;
use md5::{Digest, Md5};
use serde_json::Value;

/// MD5 of a byte string, as lowercase hex.
pub fn md5_hex(bytes: &[u8]) -> String {
    let digest = Md5::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One node of the signature tree. Leaves hash a single trace;
/// internal nodes hash their ordered child content.
#[derive(Debug, Clone, PartialEq)]
pub struct SigNode {
    /// Children in generation order: bit combinations ascending, the
    /// all-clear baseline last.
    pub children: Vec<(BitCombo, SigNode)>,
    pub sig: String,
    /// Minority labels at this level, excluding the baseline. Filled
    /// in by [`SigNode::mark_checked`].
    pub checked_bits: Vec<BitCombo>,
}

impl SigNode {
    /// Build the tree for `sr_num` registers, pulling each leaf hash
    /// from `leaf_sig` (the orchestrator hashes trace files; tests
    /// supply synthetic hashes).
    pub fn build<F>(sr_num: usize, width: u32, arity: u32, leaf_sig: &F) -> Result<SigNode>
    where
        F: Fn(&ComboLabel) -> Result<String>,
    {
        let per_register = register_combos(width, arity);
        let mut prefix = Vec::new();
        Self::build_level(sr_num, &per_register, &mut prefix, leaf_sig)
    }

    fn build_level<F>(
        levels_left: usize,
        per_register: &[BitCombo],
        prefix: &mut Vec<BitCombo>,
        leaf_sig: &F,
    ) -> Result<SigNode>
    where
        F: Fn(&ComboLabel) -> Result<String>,
    {
        if levels_left == 0 {
            let sig = leaf_sig(&ComboLabel(prefix.clone()))?;
            return Ok(SigNode {
                children: Vec::new(),
                sig,
                checked_bits: Vec::new(),
            });
        }

        let mut children = Vec::with_capacity(per_register.len());
        for combo in per_register {
            prefix.push(combo.clone());
            let child = Self::build_level(levels_left - 1, per_register, prefix, leaf_sig)?;
            prefix.pop();
            children.push((combo.clone(), child));
        }

        let mut hasher = Md5::new();
        for (combo, child) in &children {
            hasher.update(combo.to_string().as_bytes());
            hasher.update(b":");
            hasher.update(child.sig.as_bytes());
            hasher.update(b";");
        }
        let sig = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        Ok(SigNode {
            children,
            sig,
            checked_bits: Vec::new(),
        })
    }

    /// Partition every level and return the full set of checked bit
    /// combinations, outermost register first. The baseline branch is
    /// always traversed, so a never-checked tree yields exactly one
    /// all-baseline combination.
    pub fn mark_checked(&mut self) -> Vec<Vec<BitCombo>> {
        if self.children.is_empty() {
            return vec![Vec::new()];
        }

        // Group children by trace signature, preserving generation
        // order so the majority pick is deterministic.
        let mut groups: Vec<(String, Vec<BitCombo>)> = Vec::new();
        for (combo, child) in &self.children {
            match groups.iter_mut().find(|(sig, _)| *sig == child.sig) {
                Some((_, members)) => members.push(combo.clone()),
                None => groups.push((child.sig.clone(), vec![combo.clone()])),
            }
        }
        // On a tie the earliest group wins, i.e. the one holding the
        // smallest bit combination, keeping re-runs reproducible.
        let mut majority = 0;
        for (i, (_, members)) in groups.iter().enumerate() {
            if members.len() > groups[majority].1.len() {
                majority = i;
            }
        }

        let mut checked = Vec::new();
        for (i, (_, members)) in groups.iter().enumerate() {
            if i == majority {
                continue;
            }
            for combo in members {
                if combo.is_baseline() {
                    // The all-clear input defines no new information by
                    // construction; a divergent baseline trace means
                    // the firmware reacted to something else entirely.
                    warn!("all-clear baseline produced a minority trace; ignoring it");
                    continue;
                }
                checked.push(combo.clone());
            }
        }
        checked.sort();
        self.checked_bits = checked.clone();

        let baseline = self
            .children
            .iter()
            .map(|(c, _)| c.clone())
            .find(|c| c.is_baseline())
            .expect("baseline child always generated");

        let mut out = Vec::new();
        let mut targets = vec![baseline];
        targets.extend(checked);
        for combo in targets {
            let idx = self
                .children
                .iter()
                .position(|(c, _)| *c == combo)
                .expect("checked combination is a child");
            for mut sub in self.children[idx].1.mark_checked() {
                sub.insert(0, combo.clone());
                out.push(sub);
            }
        }
        out
    }

    /// Descend by already-resolved outer-register combinations.
    pub fn node_at(&self, path: &[BitCombo]) -> Option<&SigNode> {
        let mut node = self;
        for combo in path {
            node = &node
                .children
                .iter()
                .find(|(c, _)| c == combo)?
                .1;
        }
        Some(node)
    }

    /// Diagnostic dump of the whole tree.
    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for (combo, child) in &self.children {
            obj.insert(combo.to_string(), child.to_json());
        }
        obj.insert("sig".to_string(), Value::String(self.sig.clone()));
        obj.insert(
            "checked_bits".to_string(),
            Value::Array(
                self.checked_bits
                    .iter()
                    .map(|c| Value::String(c.to_string()))
                    .collect(),
            ),
        );
        Value::Object(obj)
    }
}

/// True when the marked result shows no register is ever checked: the
/// lone all-baseline combination.
pub fn all_unchecked(checked: &[Vec<BitCombo>]) -> bool {
    checked.len() == 1 && checked[0].iter().all(BitCombo::is_baseline)
}
