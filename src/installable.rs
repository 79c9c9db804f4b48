//! The installable model.
//!
//! An `Installable` is anything a command-line target can resolve to: a
//! literal store path, an inline expression, an attribute path into a
//! loaded file, or an attribute inside a flake's outputs. Resolution
//! produces `Buildable`s, the uniform currency of the build layer.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, bail, Result};
use tracing::{debug, instrument, trace};

use crate::eval::{DrvInfo, Value};
use crate::flake::{write_closure_root, ResolvedFlake};
use crate::flake_ref::FlakeRef;
use crate::session::Session;
use crate::store::is_derivation;

/// Canonical result of resolving one installable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buildable {
    /// Derivation behind the outputs; `None` when only paths are known.
    pub drv_path: Option<String>,
    /// Output name to store path. Never empty for a resolved installable.
    pub outputs: BTreeMap<String, String>,
}

/// A single command-line target, classified but not yet evaluated.
#[derive(Debug, Clone)]
pub enum Installable {
    /// Literal store path.
    StorePath { path: String },
    /// Inline expression (written `(...)` on the command line).
    Expr { text: String },
    /// Attribute path into an already-loaded root value (`-f` mode).
    AttrPath { root: Value, attr_path: String },
    /// Attribute inside a flake's outputs, tried against a list of
    /// candidate paths and prefixes.
    Flake {
        flake_ref: FlakeRef,
        attr_paths: Vec<String>,
        prefixes: Vec<String>,
    },
}

/// Full ordered candidate list: every prefix applied to the first declared
/// attribute path, then the declared paths themselves.
pub fn actual_attr_paths(attr_paths: &[String], prefixes: &[String]) -> Vec<String> {
    let first = attr_paths.first().map(String::as_str).unwrap_or_default();
    let mut res: Vec<String> = prefixes.iter().map(|p| format!("{}{}", p, first)).collect();
    res.extend(attr_paths.iter().cloned());
    res
}

fn quoted_list(items: &[String]) -> String {
    items
        .iter()
        .map(|s| format!("'{}'", s))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Installable {
    /// Display string used in error messages.
    pub fn what(&self) -> String {
        match self {
            Installable::StorePath { path } => path.clone(),
            Installable::Expr { text } => text.clone(),
            Installable::AttrPath { attr_path, .. } => attr_path.clone(),
            Installable::Flake {
                flake_ref,
                attr_paths,
                ..
            } => format!(
                "{}:{}",
                flake_ref,
                attr_paths.first().map(String::as_str).unwrap_or_default()
            ),
        }
    }

    /// The literal store path, for the variant that has one.
    pub fn get_store_path(&self) -> Option<&str> {
        match self {
            Installable::StorePath { path } => Some(path),
            _ => None,
        }
    }

    /// Resolve to buildables.
    ///
    /// Value-backed variants evaluate to derivations first; multiple
    /// results that share one derivation are merged into a single
    /// buildable whose output map is the union (an "all outputs"
    /// selection shows up exactly this way).
    #[instrument(level = "debug", skip_all, fields(installable = %self.what()))]
    pub fn to_buildables(&self, sess: &mut Session) -> Result<Vec<Buildable>> {
        if let Installable::StorePath { path } = self {
            let drv_path = is_derivation(path).then(|| path.clone());
            return Ok(vec![Buildable {
                drv_path,
                outputs: BTreeMap::from([("out".to_string(), path.clone())]),
            }]);
        }

        let drvs = self.to_derivations(sess)?;

        let mut res = Vec::new();
        let mut drv_paths = BTreeSet::new();
        for drv in drvs {
            if drv.output_name.is_empty() {
                bail!("derivation '{}' lacks an 'outputName' attribute", drv.drv_path);
            }
            drv_paths.insert(drv.drv_path.clone());
            res.push(Buildable {
                drv_path: Some(drv.drv_path),
                outputs: BTreeMap::from([(drv.output_name, drv.out_path)]),
            });
        }

        if drv_paths.len() == 1 && res.len() > 1 {
            let mut outputs = BTreeMap::new();
            for b in res {
                for (name, path) in b.outputs {
                    // output names are disjoint per derivation; first wins
                    outputs.entry(name).or_insert(path);
                }
            }
            return Ok(vec![Buildable {
                drv_path: drv_paths.into_iter().next(),
                outputs,
            }]);
        }

        Ok(res)
    }

    /// Like `to_buildables`, for contexts that require exactly one result.
    pub fn to_buildable(&self, sess: &mut Session) -> Result<Buildable> {
        let mut buildables = self.to_buildables(sess)?;
        if buildables.len() != 1 {
            bail!(
                "installable '{}' evaluates to {} derivations, where only one is expected",
                self.what(),
                buildables.len()
            );
        }
        Ok(buildables.remove(0))
    }

    /// Evaluate to derivation coordinates.
    pub fn to_derivations(&self, sess: &mut Session) -> Result<Vec<DrvInfo>> {
        match self {
            Installable::StorePath { path } => {
                bail!("'{}' is a store path and cannot be evaluated", path)
            }
            Installable::Expr { .. } | Installable::AttrPath { .. } => {
                let v = self.to_value(sess)?;
                sess.eval.derivations_in(v)
            }
            Installable::Flake {
                flake_ref,
                attr_paths,
                prefixes,
            } => {
                let resolved = sess.resolver.resolve(flake_ref, sess.lock_mode)?;
                let fingerprint = resolved.fingerprint();

                // The outputs value is evaluated at most once, shared by
                // every candidate in this call.
                let mut outputs: Option<Value> = None;

                for attr_path in actual_attr_paths(attr_paths, prefixes) {
                    if let Some(drv) = sess.cache.get_derivation(&fingerprint, &attr_path) {
                        // A hit is only trusted while its output is still
                        // in the store.
                        if sess.store.is_valid_path(&drv.out_path) {
                            trace!("evaluation cache hit for '{}'", attr_path);
                            return Ok(vec![drv]);
                        }
                    }

                    let vo = match outputs {
                        Some(v) => v,
                        None => {
                            let v = self.flake_outputs(sess, &resolved)?;
                            outputs = Some(v);
                            v
                        }
                    };

                    let Some(v) = sess.eval.select(vo, &attr_path)? else {
                        continue;
                    };
                    sess.eval.force(v)?;

                    let Some(drv) = sess.eval.derivation_info(v)? else {
                        bail!("flake output attribute '{}' is not a derivation", attr_path);
                    };

                    sess.cache.add_derivation(&fingerprint, &attr_path, drv.clone());
                    return Ok(vec![drv]);
                }

                bail!(
                    "flake '{}' does not provide attribute {}",
                    flake_ref,
                    quoted_list(attr_paths)
                )
            }
        }
    }

    /// Evaluate to the underlying value, without cache involvement.
    pub fn to_value(&self, sess: &mut Session) -> Result<Value> {
        match self {
            Installable::StorePath { path } => {
                bail!("'{}' is a store path and cannot be evaluated", path)
            }
            Installable::Expr { text } => {
                let v = sess.eval.eval_expr(text)?;
                sess.eval.force(v)?;
                Ok(v)
            }
            Installable::AttrPath { root, attr_path } => {
                let v = sess
                    .eval
                    .select(*root, attr_path)?
                    .ok_or_else(|| anyhow!("attribute '{}' not found", attr_path))?;
                sess.eval.force(v)?;
                Ok(v)
            }
            Installable::Flake {
                flake_ref,
                attr_paths,
                prefixes,
            } => {
                let resolved = sess.resolver.resolve(flake_ref, sess.lock_mode)?;
                let outputs = self.flake_outputs(sess, &resolved)?;
                for attr_path in actual_attr_paths(attr_paths, prefixes) {
                    let Some(v) = sess.eval.select(outputs, &attr_path)? else {
                        continue;
                    };
                    sess.eval.force(v)?;
                    return Ok(v);
                }
                bail!(
                    "flake '{}' does not provide attribute {}",
                    flake_ref,
                    quoted_list(attr_paths)
                )
            }
        }
    }

    /// Evaluate the flake and return its forced `outputs` value.
    ///
    /// The first evaluation of a flake also persists its input closure as
    /// a GC root, so already-fetched inputs cannot be collected before the
    /// flake is built.
    fn flake_outputs(&self, sess: &mut Session, resolved: &ResolvedFlake) -> Result<Value> {
        let vflake = sess.resolver.call_flake(&mut *sess.eval, resolved)?;

        let root_dir = sess.root_dir.clone();
        write_closure_root(&mut *sess.store, resolved, &root_dir)?;

        let outputs = sess
            .eval
            .get_attr(vflake, "outputs")?
            .ok_or_else(|| anyhow!("flake '{}' lacks an 'outputs' attribute", resolved.flake_ref))?;
        sess.eval.force(outputs)?;
        debug!("evaluated outputs of flake '{}'", resolved.flake_ref);
        Ok(outputs)
    }

    /// Evaluate to an app: a value of type `app` whose program lives in
    /// the store.
    pub fn to_app(&self, sess: &mut Session) -> Result<App> {
        let v = self.to_value(sess)?;
        App::from_value(sess, v)
    }
}

/// A runnable program described by a flake's `apps` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub program: String,
}

impl App {
    pub fn from_value(sess: &mut Session, v: Value) -> Result<App> {
        sess.eval.force(v)?;

        let type_value = sess
            .eval
            .get_attr(v, "type")?
            .ok_or_else(|| anyhow!("app value lacks a 'type' attribute"))?;
        let type_name = sess.eval.force_string(type_value)?;
        if type_name != "app" {
            bail!("value does not have type 'app'");
        }

        let program_value = sess
            .eval
            .get_attr(v, "program")?
            .ok_or_else(|| anyhow!("app value lacks a 'program' attribute"))?;
        let program = sess.eval.force_string(program_value)?;

        if !sess.store.is_in_store(&program) {
            bail!("app program '{}' is not in the Nix store", program);
        }

        Ok(App { program })
    }
}
