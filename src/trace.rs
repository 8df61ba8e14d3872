//! Execution trace and register-access log parsing
//!
//! Both artifacts are plain text emitted by the emulator. The trace is
//! a stream of `BBL (<start>, <end>)` tokens in execution order; the
//! register-access log holds one
//! `(<addr>, <category>, r|w, <value>) in BBL (<start>, <end>)` line
//! per MMIO access. Lines that do not match are skipped, matching the
//! pattern-extraction consumption the contract specifies.

use crate::error::Result;
use crate::model::Category;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs;
use std::path::Path;

/// A basic-block range `(start, end)`.
pub type BblRange = (u64, u64);

/// Basic-block hit counts for one trace.
pub type Coverage = HashMap<BblRange, u32>;

/// One line of the register-access log.
#[derive(Debug, Clone, PartialEq)]
pub struct RegAccess {
    pub addr: u64,
    /// The register's category as the emulator saw it at access time.
    pub category: Category,
    pub is_write: bool,
    pub value: u64,
    /// Enclosing basic block.
    pub bbl: BblRange,
}

fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// Extract every `BBL (start, end)` token from a chunk of text.
pub fn parse_bbl_tokens(text: &str) -> Vec<BblRange> {
    let mut out = Vec::new();
    for (idx, _) in text.match_indices("BBL (") {
        let rest = &text[idx + 5..];
        let end = match rest.find(')') {
            Some(e) => e,
            None => continue,
        };
        let mut parts = rest[..end].split(',');
        let start = parts.next().and_then(parse_hex);
        let stop = parts.next().and_then(parse_hex);
        if let (Some(s), Some(e)) = (start, stop) {
            out.push((s, e));
        }
    }
    out
}

/// Count basic-block executions in one trace file.
pub fn count_coverage(path: &Path) -> Result<Coverage> {
    let text = fs::read_to_string(path)?;
    let mut cov = Coverage::new();
    for bbl in parse_bbl_tokens(&text) {
        *cov.entry(bbl).or_insert(0) += 1;
    }
    Ok(cov)
}

fn parse_reg_acc_line(line: &str) -> Option<RegAccess> {
    let line = line.trim();
    let rest = line.strip_prefix('(')?;
    let close = rest.find(')')?;
    let mut head = rest[..close].split(", ");

    let addr = head.next().and_then(parse_hex)?;
    let category = head
        .next()
        .and_then(|c| c.trim().parse::<u8>().ok())
        .and_then(|c| Category::try_from(c).ok())?;
    let is_write = match head.next()?.trim() {
        "r" => false,
        "w" => true,
        _ => return None,
    };
    let value = parse_hex(head.next()?)?;

    let bbl = parse_bbl_tokens(&rest[close + 1..]).into_iter().next()?;
    Some(RegAccess {
        addr,
        category,
        is_write,
        value,
        bbl,
    })
}

/// Parse a register-access log, skipping malformed lines.
pub fn parse_reg_acc(path: &Path) -> Result<Vec<RegAccess>> {
    let text = fs::read_to_string(path)?;
    Ok(text.lines().filter_map(parse_reg_acc_line).collect())
}
