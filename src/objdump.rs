//! Call-site extraction from the firmware disassembly
//!
//! The exploration stage must know where the function enclosing a
//! status-register read returns to, so workers can stop once the
//! firmware makes it back out. The return addresses come from the
//! disassembly: the instruction following each call to the function.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;

/// Run the configured disassembler over the firmware image.
pub fn disassemble(objdump: &str, image: &Path) -> Result<String> {
    let output = Command::new(objdump).arg("-dC").arg(image).output()?;
    if !output.status.success() {
        return Err(Error::Disasm(format!(
            "{} -dC {} exited with {}",
            objdump,
            image.display(),
            output.status
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|e| Error::Disasm(format!("disassembly is not valid UTF-8: {}", e)))
}

fn leading_addr(line: &str) -> Option<u64> {
    let t = line.trim_start();
    let colon = t.find(':')?;
    u64::from_str_radix(&t[..colon], 16).ok()
}

/// Return addresses of every call to `func`: the address of the
/// instruction directly after a call line ending in `<func>`.
pub fn call_sites(dump: &str, func: &str) -> Vec<u64> {
    let needle = format!("<{}>", func);
    let mut out = Vec::new();
    let mut lines = dump.lines().peekable();
    while let Some(line) = lines.next() {
        if line.trim_end().ends_with(&needle) {
            if let Some(addr) = lines.peek().and_then(|next| leading_addr(next)) {
                out.push(addr);
            }
        }
    }
    out
}

/// Function start addresses and names, from `<name>:` header lines.
pub fn function_starts(dump: &str) -> Vec<(u64, String)> {
    let mut out = Vec::new();
    for line in dump.lines() {
        let mut parts = line.split_whitespace();
        let addr = match parts.next().and_then(|a| u64::from_str_radix(a, 16).ok()) {
            Some(a) => a,
            None => continue,
        };
        if let Some(rest) = parts.next() {
            if rest.starts_with('<') && rest.ends_with(">:") && parts.next().is_none() {
                out.push((addr, rest[1..rest.len() - 2].to_string()));
            }
        }
    }
    out
}

/// Return addresses one call level further out: for each function that
/// calls `func`, the return addresses of that caller's own call sites.
/// Used when exploration must run past a second clean return.
pub fn caller_call_sites(dump: &str, func: &str) -> Vec<u64> {
    let funcs = function_starts(dump);
    let mut out = BTreeSet::new();
    for site in call_sites(dump, func) {
        // The enclosing function is the last one starting at or before
        // the call site.
        let caller = funcs
            .iter()
            .take_while(|(addr, _)| *addr <= site)
            .last()
            .map(|(_, name)| name.clone());
        if let Some(caller) = caller {
            out.extend(call_sites(dump, &caller));
        }
    }
    out.into_iter().collect()
}
