//! The extraction loop
//!
//! One run is a sequence of depth iterations. Each depth lets the
//! firmware run until it polls a status register the model does not
//! explain, reconciles whatever the emulator re-learned about register
//! categories on the way, then explores that read site with synthetic
//! register values until the checked bits are classified or the
//! register is demoted. The run stops when identification reports that
//! the whole firmware executes without hitting an unexplained poll.

use crate::config::Config;
use crate::emulator::{
    EmulatorCmd, HangPolicy, Invoker, Stage, StageIo, RC_CAT_FIXUP, RC_CONVERGED, RC_HANG,
};
use crate::error::{Error, Result};
use crate::extract::classify::{classify, ClassifyInput, Observation};
use crate::extract::combo::{self, BitCombo, ComboLabel};
use crate::extract::context::DepthContext;
use crate::extract::readsite::{self, ReadSite};
use crate::extract::reconcile::{
    demote_never_checked, reconcile_cross_depth, reconcile_intra, AdjustmentLog,
};
use crate::extract::sigtree::{all_unchecked, md5_hex, SigNode};
use crate::model::{ModelDoc, PrereqRecord};
use crate::objdump;
use crate::trace::{self, Coverage};
use log::{info, warn};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// How a run was started, from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Model snapshot to resume from, if any.
    pub model_input: Option<PathBuf>,
    /// Fuzzer input replayed by every emulator invocation.
    pub fuzz_input: Option<PathBuf>,
    /// The run was re-entered from the fuzzing forkserver after an
    /// unmodeled-peripheral access.
    pub from_forkserver: bool,
    /// Annotate prerequisite records with read-site diagnostics.
    pub diagnostics: bool,
}

pub struct Engine {
    config: Config,
    options: RunOptions,
    cmd: EmulatorCmd,
    invoker: Invoker,
    /// Basic blocks the firmware reaches on its own, before synthetic
    /// register values push it further. Accumulated per identification
    /// run, cleared when a depth restarts.
    baseline_cov: Coverage,
    adjustments: AdjustmentLog,
    /// Latest snapshot that parsed and reconciled cleanly; the final
    /// model is derived from it even when the run aborts later.
    last_valid: Option<ModelDoc>,
}

impl Engine {
    pub fn new(config: Config, options: RunOptions) -> Self {
        let cmd = EmulatorCmd::new(&config);
        let invoker = Invoker::new(
            config.extraction.retry_limit,
            Duration::from_secs(config.extraction.timeout_secs),
        );
        Engine {
            config,
            options,
            cmd,
            invoker,
            baseline_cov: Coverage::new(),
            adjustments: AdjustmentLog::default(),
            last_valid: None,
        }
    }

    /// Drive depth iterations until identification converges.
    pub fn run(&mut self) -> Result<()> {
        let dump = objdump::disassemble(
            &self.config.extraction.objdump,
            &self.config.program.image,
        )?;

        let mut current_path = self.options.model_input.clone();
        let mut current_doc = match &current_path {
            Some(path) => ModelDoc::read(path)?,
            None => ModelDoc::default(),
        };
        // When a fuzzer seed drives the run, it must never hang.
        let ident_hang = if self.options.from_forkserver {
            HangPolicy::Fatal
        } else {
            HangPolicy::Record
        };

        let mut depth = 0u32;
        loop {
            let mut ctx = DepthContext::new(depth);
            info!("depth {}: identification", depth);

            let mut io = StageIo {
                model_input: current_path.clone(),
                model_output: ctx.next_snapshot(),
                trace: ctx.identify_trace(),
                reg_acc: ctx.identify_reg_acc(),
                sr_input: None,
                fuzz_input: self.options.fuzz_input.clone(),
            };
            let mut code = self.invoker.invoke(
                || self.cmd.build(Stage::Identify, &io),
                Stage::Identify,
                ident_hang,
            )?;
            if code == RC_CAT_FIXUP {
                info!(
                    "depth {}: category fixed up mid-run, re-running identification",
                    depth
                );
                io.model_output = ctx.next_snapshot();
                code = self.invoker.invoke(
                    || self.cmd.build(Stage::IdentifyRetry, &io),
                    Stage::IdentifyRetry,
                    ident_hang,
                )?;
            }
            if code == RC_HANG {
                return Err(Error::Protocol {
                    stage: Stage::Identify.name(),
                    code,
                    attempts: 1,
                });
            }

            for (bbl, n) in trace::count_coverage(&io.trace)? {
                *self.baseline_cov.entry(bbl).or_insert(0) += n;
            }

            let mut doc = ModelDoc::read(&io.model_output)?;
            let outcome =
                reconcile_cross_depth(&current_doc, &mut doc, depth, &mut self.adjustments);
            let reconciled = ctx.next_snapshot();
            doc.write(&reconciled)?;
            if outcome.restart {
                warn!(
                    "depth {}: restarting from the adjusted model, coverage baseline reset",
                    depth
                );
                self.baseline_cov.clear();
                current_doc = doc;
                current_path = Some(reconciled);
                depth += 1;
                continue;
            }

            if code == RC_CONVERGED {
                info!(
                    "depth {}: no unexplained status-register poll left, extraction converged",
                    depth
                );
                self.last_valid = Some(doc);
                return Ok(());
            }

            let site = readsite::collect(&mut doc, &dump)?;
            info!(
                "depth {}: read site {} of {} ({} register(s), {} bits)",
                depth, site.site_key, site.peri_key, site.sr_num, site.sr_bits
            );
            let mut snapshot = ctx.next_snapshot();
            doc.write(&snapshot)?;
            self.last_valid = Some(doc.clone());

            let mut resolved = false;
            for level in 1..=3u32 {
                let set_bits = if level == 3 { 2 } else { 1 };
                if level == 2 {
                    // Same inputs, but workers run on to a second clean
                    // return before giving up on the bit.
                    readsite::widen_return_addresses(&mut doc, &dump)?;
                    snapshot = ctx.next_snapshot();
                    doc.write(&snapshot)?;
                }
                info!(
                    "depth {} level {}: exploring with {} bit(s) set per register",
                    depth, level, set_bits
                );

                let inputs = combo::generate(site.sr_num, site.sr_bits, set_bits);
                combo::write_inputs(&ctx.sr_input_dir(level), &inputs)?;
                fs::create_dir_all(ctx.explore_dir(level))?;

                let model_in = snapshot.clone();
                let codes: HashMap<ComboLabel, i32> = inputs
                    .par_iter()
                    .map(|input| -> Result<(ComboLabel, i32)> {
                        let io = StageIo {
                            model_input: Some(model_in.clone()),
                            model_output: ctx.explore_model(level, &input.label),
                            trace: ctx.explore_trace(level, &input.label),
                            reg_acc: ctx.explore_reg_acc(level, &input.label),
                            sr_input: Some(ctx.sr_input(level, &input.label)),
                            fuzz_input: self.options.fuzz_input.clone(),
                        };
                        let code = self.invoker.invoke(
                            || self.cmd.build(Stage::Explore, &io),
                            Stage::Explore,
                            HangPolicy::Record,
                        )?;
                        Ok((input.label.clone(), code))
                    })
                    .collect::<Result<HashMap<_, _>>>()?;

                let outputs: Vec<ModelDoc> = inputs
                    .iter()
                    .filter_map(|input| {
                        match ModelDoc::read(&ctx.explore_model(level, &input.label)) {
                            Ok(d) => Some(d),
                            Err(e) => {
                                warn!("no usable model for input {}: {}", input.label, e);
                                None
                            }
                        }
                    })
                    .collect();
                doc = reconcile_intra(&doc, &outputs);
                snapshot = ctx.next_snapshot();
                doc.write(&snapshot)?;

                let mut tree =
                    SigNode::build(site.sr_num, site.sr_bits, set_bits, &|label: &ComboLabel| {
                        // A watchdog-killed run can leave no trace
                        // behind; hash those as empty so they group
                        // together instead of aborting the level.
                        let bytes = match fs::read(ctx.explore_trace(level, label)) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!("no trace for input {}: {}", label, e);
                                Vec::new()
                            }
                        };
                        Ok(md5_hex(&bytes))
                    })?;
                let checked = tree.mark_checked();
                fs::write(
                    ctx.trace_summary(level),
                    serde_json::to_string_pretty(&tree.to_json())?,
                )?;

                if all_unchecked(&checked) {
                    info!(
                        "depth {} level {}: no register bit changed the trace",
                        depth, level
                    );
                    continue;
                }

                let observations = self.gather_observations(&ctx, level, &checked, &codes)?;
                let record = {
                    let peri = doc.peripheral(&site.peri_key)?;
                    classify(&ClassifyInput {
                        site: &site,
                        tree: &tree,
                        set_bits,
                        observations,
                        baseline_cov: &self.baseline_cov,
                        regs: &peri.regs,
                        peri_addr_range: self.config.extraction.peri_addr_range,
                        diagnostics: self.options.diagnostics,
                    })
                };
                info!(
                    "site {}: {} satisfy, {} never-satisfy, {} other",
                    site.site_key,
                    record.satisfy.len(),
                    record.never_satisfy.len(),
                    record.other.len()
                );

                self.install_record(&mut doc, &site, record)?;
                snapshot = ctx.next_snapshot();
                doc.write(&snapshot)?;
                resolved = true;
                break;
            }

            if !resolved {
                demote_never_checked(&mut doc, &site, depth, &mut self.adjustments)?;
                snapshot = ctx.next_snapshot();
                doc.write(&snapshot)?;
            }

            self.last_valid = Some(doc.clone());
            current_doc = doc;
            current_path = Some(snapshot);
            depth += 1;
        }
    }

    /// Re-read the trace and access log of every traversed combination.
    /// The all-clear baseline comes along too: when setting a bit is
    /// what stalls the firmware, the baseline's clean return is the
    /// observation that classifies the bit.
    fn gather_observations(
        &self,
        ctx: &DepthContext,
        level: u32,
        checked: &[Vec<BitCombo>],
        codes: &HashMap<ComboLabel, i32>,
    ) -> Result<Vec<Observation>> {
        checked
            .iter()
            .map(|path| {
                let label = ComboLabel(path.clone());
                let code = *codes.get(&label).ok_or_else(|| {
                    Error::Model(format!("no exploration outcome for input {}", label))
                })?;
                let reg_acc = trace::parse_reg_acc(&ctx.explore_reg_acc(level, &label))
                    .unwrap_or_else(|e| {
                        warn!("no access log for input {}: {}", label, e);
                        Vec::new()
                    });
                let coverage = trace::count_coverage(&ctx.explore_trace(level, &label))
                    .unwrap_or_else(|e| {
                        warn!("no trace for input {}: {}", label, e);
                        Coverage::new()
                    });
                Ok(Observation {
                    path: path.clone(),
                    code,
                    reg_acc,
                    coverage,
                })
            })
            .collect()
    }

    fn install_record(
        &self,
        doc: &mut ModelDoc,
        site: &ReadSite,
        record: PrereqRecord,
    ) -> Result<()> {
        let peri = doc.peripheral_mut(&site.peri_key)?;
        let sites = peri
            .events
            .entry(site.config_sig.clone())
            .or_insert_with(BTreeMap::new);
        match sites.get_mut(&site.site_key) {
            Some(existing) => {
                warn!(
                    "read site {} under configuration {:?} already modeled, merging",
                    site.site_key, site.config_sig
                );
                existing.merge(record);
            }
            None => {
                sites.insert(site.site_key.clone(), record);
            }
        }
        Ok(())
    }

    /// Write the run's final artifacts. Called on every exit path, so a
    /// failed run still leaves its last valid model behind.
    pub fn finalize(&self) -> Result<()> {
        let mut doc = self.last_valid.clone().unwrap_or_default();
        doc.finalize(self.options.from_forkserver);

        let stats = doc.statistics();
        let mut value = serde_json::to_value(&doc)?;
        value["statistics"] = stats;
        fs::write(
            "peripheral_model.json",
            serde_json::to_string_pretty(&value)?,
        )?;

        let cov: BTreeMap<String, u32> = self
            .baseline_cov
            .iter()
            .map(|(&(s, e), &n)| (format!("0x{:x},0x{:x}", s, e), n))
            .collect();
        fs::write("bbl_cov.json", serde_json::to_string_pretty(&cov)?)?;
        fs::write(
            "category_adjustments.json",
            serde_json::to_string_pretty(&self.adjustments)?,
        )?;

        info!(
            "final model covers {} peripheral(s), {} with events",
            doc.model.len(),
            doc.model.values().filter(|p| !p.events.is_empty()).count()
        );
        Ok(())
    }
}
