//! Read-site collection
//!
//! After identification stops on a new status-register read, the
//! transient `sr_read` section of the model names the registers, the
//! basic block, and the enclosing function. This stage validates it,
//! bounds exploration by resolving the function's return addresses from
//! the firmware disassembly, and captures everything later stages need
//! as one value.

use crate::error::{Error, Result};
use crate::extract::combo::MASK_BYTES;
use crate::model::ModelDoc;
use crate::objdump;
use log::warn;

/// The highest register fan-out one read site may name. The combined
/// input buffer stays small enough to enumerate exhaustively.
pub const MAX_SR_NUM: usize = 4;

/// One unresolved status-register read site, as the rest of the depth
/// iteration consumes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadSite {
    pub peri_base: u64,
    /// Key of the owning peripheral in the model map.
    pub peri_key: String,
    pub sr_num: usize,
    pub sr_idx: Vec<usize>,
    /// Read index of a combined control/status register within the
    /// basic block; 0 when none is involved.
    pub cr_sr_r_idx: u32,
    /// Register width in bits.
    pub sr_bits: u32,
    /// End address of the basic block performing the read.
    pub bbl_e: u64,
    /// Event-table key for this site.
    pub site_key: String,
    /// Configuration signature the peripheral held when the site was
    /// found.
    pub config_sig: String,
    pub sr_func: String,
    pub bbl_cnt: u64,
}

/// Validate the pending `sr_read` section, fill in its exploration
/// return addresses from the disassembly, and return the site
/// descriptor.
pub fn collect(doc: &mut ModelDoc, dump: &str) -> Result<ReadSite> {
    let sr = doc
        .sr_read
        .as_ref()
        .ok_or_else(|| Error::Model("no unresolved status-register read in the model".into()))?;

    if sr.sr_num == 0 || sr.sr_num > MAX_SR_NUM {
        return Err(Error::Model(format!(
            "read site at 0x{:x} names {} status registers, supported range is 1..={}",
            sr.bbl_e, sr.sr_num, MAX_SR_NUM
        )));
    }
    if sr.sr_idx.len() != sr.sr_num {
        return Err(Error::Model(format!(
            "read site at 0x{:x}: sr_num {} does not match {} register indices",
            sr.bbl_e,
            sr.sr_num,
            sr.sr_idx.len()
        )));
    }

    let peri_key = format!("0x{:x}", sr.peri_base_addr);
    let peri = doc.peripheral(&peri_key)?;
    if peri.reg_size == 0 || peri.reg_size as usize > MASK_BYTES {
        return Err(Error::Model(format!(
            "peripheral {} has {}-byte registers; the input mask covers 1..={} bytes",
            peri_key, peri.reg_size, MASK_BYTES
        )));
    }
    let site = ReadSite {
        peri_base: sr.peri_base_addr,
        peri_key: peri_key.clone(),
        sr_num: sr.sr_num,
        sr_idx: sr.sr_idx.clone(),
        cr_sr_r_idx: sr.cr_sr_r_idx,
        sr_bits: peri.reg_size * 8,
        bbl_e: sr.bbl_e,
        site_key: format!("0x{:x}", sr.bbl_e),
        config_sig: peri.config_signature(),
        sr_func: sr.sr_func.clone(),
        bbl_cnt: sr.bbl_cnt,
    };

    let ret_addrs = objdump::call_sites(dump, &site.sr_func);
    if ret_addrs.is_empty() {
        warn!(
            "no call site of {} found in the disassembly; exploration is unbounded",
            site.sr_func
        );
    }
    if let Some(sr) = doc.sr_read.as_mut() {
        sr.sr_func_ret_addr = ret_addrs;
    }
    Ok(site)
}

/// Replace the site's return addresses with those one call level
/// further out, so workers run on past a second clean return.
pub fn widen_return_addresses(doc: &mut ModelDoc, dump: &str) -> Result<()> {
    let func = doc
        .sr_read
        .as_ref()
        .map(|sr| sr.sr_func.clone())
        .ok_or_else(|| Error::Model("no unresolved status-register read in the model".into()))?;
    let widened = objdump::caller_call_sites(dump, &func);
    if widened.is_empty() {
        warn!(
            "no caller of {} has a resolvable call site; keeping exploration unbounded",
            func
        );
    }
    if let Some(sr) = doc.sr_read.as_mut() {
        sr.sr_func_ret_addr = widened;
    }
    Ok(())
}
