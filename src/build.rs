//! Realization orchestration over resolved installables.
//!
//! `build` turns installables into buildables, accumulates one realization
//! set for the whole batch, and hands it to the store in a single request.
//! The convenience forms flatten the result to store paths or derivation
//! paths.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use tracing::{debug, instrument};

use crate::installable::{Buildable, Installable};
use crate::session::Session;

/// What to do with the accumulated realization set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealiseMode {
    /// Realize the set.
    Build,
    /// Report what is missing, with no side effects.
    DryRun,
    /// Resolve only; the store is forced read-only up front.
    NoBuild,
}

/// Realization targets for one buildable: `drv!out1,out2` for a
/// derivation with its selected outputs, bare output paths otherwise.
fn realise_targets(b: &Buildable) -> Vec<String> {
    match &b.drv_path {
        Some(drv) => {
            let outs: Vec<&str> = b.outputs.keys().map(String::as_str).collect();
            vec![format!("{}!{}", drv, outs.join(","))]
        }
        None => b.outputs.values().cloned().collect(),
    }
}

/// Resolve every installable and drive the store according to `mode`.
/// Returns the full buildable list regardless of mode.
#[instrument(level = "debug", skip(sess, installables), fields(count = installables.len()))]
pub fn build(
    sess: &mut Session,
    mode: RealiseMode,
    installables: &[Installable],
) -> Result<Vec<Buildable>> {
    if mode != RealiseMode::Build {
        // evaluation alone must not write to the store
        sess.store.set_read_only(true);
    }

    let mut buildables = Vec::new();
    let mut targets = BTreeSet::new();

    for installable in installables {
        for buildable in installable.to_buildables(sess)? {
            targets.extend(realise_targets(&buildable));
            buildables.push(buildable);
        }
    }

    debug!(targets = targets.len(), "accumulated realization set");
    match mode {
        RealiseMode::DryRun => sess.store.print_missing(&targets)?,
        RealiseMode::Build => sess.store.build_paths(&targets)?,
        RealiseMode::NoBuild => {}
    }

    Ok(buildables)
}

/// All output paths produced by building the installables.
pub fn to_store_paths(
    sess: &mut Session,
    mode: RealiseMode,
    installables: &[Installable],
) -> Result<BTreeSet<String>> {
    let mut out_paths = BTreeSet::new();
    for buildable in build(sess, mode, installables)? {
        out_paths.extend(buildable.outputs.into_values());
    }
    Ok(out_paths)
}

/// Single-output form; fails unless exactly one path results.
pub fn to_store_path(
    sess: &mut Session,
    mode: RealiseMode,
    installable: &Installable,
) -> Result<String> {
    let paths = to_store_paths(sess, mode, std::slice::from_ref(installable))?;
    let mut iter = paths.into_iter();
    match (iter.next(), iter.next()) {
        (Some(path), None) => Ok(path),
        _ => bail!(
            "argument '{}' should evaluate to one store path",
            installable.what()
        ),
    }
}

/// Derivation paths behind the installables.
///
/// Buildables without a derivation either fail (`use_deriver` false) or
/// fall back to the store's recorded derivers of each output path.
pub fn to_derivations(
    sess: &mut Session,
    installables: &[Installable],
    use_deriver: bool,
) -> Result<BTreeSet<String>> {
    let mut drv_paths = BTreeSet::new();

    for installable in installables {
        for buildable in installable.to_buildables(sess)? {
            match &buildable.drv_path {
                Some(drv) => {
                    drv_paths.insert(drv.clone());
                }
                None => {
                    if !use_deriver {
                        bail!(
                            "argument '{}' did not evaluate to a derivation",
                            installable.what()
                        );
                    }
                    for out_path in buildable.outputs.values() {
                        let derivers = sess.store.query_valid_derivers(out_path)?;
                        match derivers.first() {
                            Some(deriver) => {
                                drv_paths.insert(deriver.clone());
                            }
                            None => bail!(
                                "'{}' does not have a known deriver",
                                installable.what()
                            ),
                        }
                    }
                }
            }
        }
    }

    Ok(drv_paths)
}
