//! Flake resolution.
//!
//! This module covers the path from a flake reference to evaluated
//! derivations:
//! - lock-file handling policy (`LockFileMode`)
//! - the resolver seam that pins a reference to a `ResolvedFlake`
//! - the per-fingerprint evaluation cache
//! - persistence of a resolved flake's input closure as a GC root

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, instrument, trace};

use crate::command::NixCommand;
use crate::common::Cache;
use crate::eval::{DrvInfo, Evaluator, Value};
use crate::flake_ref::FlakeRef;
use crate::hash;
use crate::lock::{LockFile, LockedInput, LockedRef};
use crate::store::Store;

/// How lock-file state may be consulted and updated during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFileMode {
    /// No registry lookups, no lock-file writes.
    AllPure,
    /// Regenerate from scratch, keep the result in memory only.
    UseNewLockFile,
    /// Regenerate from scratch and persist.
    RecreateLockFile,
    /// Update stale entries and persist.
    UpdateLockFile,
    /// Update stale entries in memory only.
    UseUpdatedLockFile,
}

/// Select the lock-file mode from the command-line flags.
pub fn lock_file_mode(
    use_registries: bool,
    recreate_lock_file: bool,
    save_lock_file: bool,
) -> LockFileMode {
    if !use_registries {
        return LockFileMode::AllPure;
    }
    match (recreate_lock_file, save_lock_file) {
        (true, true) => LockFileMode::RecreateLockFile,
        (true, false) => LockFileMode::UseNewLockFile,
        (false, true) => LockFileMode::UpdateLockFile,
        (false, false) => LockFileMode::UseUpdatedLockFile,
    }
}

/// Content hash identifying a resolved flake's entire locked graph.
///
/// Stable exactly as long as the lock file (and the flake's own source)
/// is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A flake pinned to a concrete source and a fully-locked input graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFlake {
    /// The reference the user asked for, pre-resolution.
    pub flake_ref: FlakeRef,
    /// Store path of the flake's own fetched source.
    pub source_path: String,
    pub lock_file: LockFile,
}

impl ResolvedFlake {
    pub fn fingerprint(&self) -> Fingerprint {
        let material = format!("{};{}", self.source_path, self.lock_file.to_json());
        Fingerprint(hash::sha256_hex(material.as_bytes()))
    }
}

/// Resolution of flake references, treated as a black box by the
/// installable layer.
pub trait FlakeResolver {
    fn resolve(&mut self, flake_ref: &FlakeRef, mode: LockFileMode) -> Result<ResolvedFlake>;

    /// Produce the flake's top-level value (carrying the `outputs`
    /// attribute) for a resolved flake.
    fn call_flake(&mut self, eval: &mut dyn Evaluator, flake: &ResolvedFlake) -> Result<Value>;
}

/// Evaluation results memoized per (fingerprint, attribute path).
///
/// Entries are additive for the life of the process; there is no eviction.
/// Callers must re-validate a hit's output path against the store before
/// trusting it, since the output may have been collected since insertion.
#[derive(Default)]
pub struct EvalCache {
    inner: Cache<(Fingerprint, String), DrvInfo>,
}

impl EvalCache {
    pub fn new() -> Self {
        Self {
            inner: Cache::new(),
        }
    }

    pub fn get_derivation(&self, fingerprint: &Fingerprint, attr_path: &str) -> Option<DrvInfo> {
        self.inner
            .get(&(fingerprint.clone(), attr_path.to_string()))
    }

    pub fn add_derivation(&self, fingerprint: &Fingerprint, attr_path: &str, drv: DrvInfo) {
        self.inner
            .insert((fingerprint.clone(), attr_path.to_string()), drv);
    }
}

/// Directory holding one GC-root symlink per flake reference.
pub fn closure_root_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("lode")
        .join("flake-closures")
}

/// Make a flake reference safe as a single path component.
///
/// `%` is escaped first so the later escapes never get re-escaped.
fn encode_root_name(s: &str) -> String {
    s.replace('%', "%25")
        .replace('/', "%2f")
        .replace(':', "%3a")
}

/// Atomically repoint `link` at `target`: the old target stays in place
/// until the rename lands, so there is never a window without a root.
fn replace_symlink(target: &str, link: &Path) -> Result<()> {
    let file_name = link
        .file_name()
        .ok_or_else(|| anyhow!("invalid GC root path {}", link.display()))?
        .to_string_lossy();
    let tmp = link.with_file_name(format!(".{}.tmp-{}", file_name, std::process::id()));
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(target, &tmp)
        .with_context(|| format!("failed to create symlink {}", tmp.display()))?;
    std::fs::rename(&tmp, link)
        .with_context(|| format!("failed to replace symlink {}", link.display()))?;
    Ok(())
}

/// Persist the closure of a resolved flake's locked inputs as an indirect
/// GC root, so already-fetched inputs survive collection until the flake
/// is built.
///
/// Inputs are fetched lazily: an input that is not yet in the store is
/// skipped, but its own nested inputs are still visited. Runs on every
/// resolution; repointing the symlink is idempotent.
#[instrument(level = "debug", skip(store, flake), fields(flake_ref = %flake.flake_ref))]
pub fn write_closure_root(
    store: &mut dyn Store,
    flake: &ResolvedFlake,
    root_dir: &Path,
) -> Result<()> {
    if flake.flake_ref.is_local() {
        return Ok(());
    }

    let store_dir = store.store_dir();

    // Resolution fetched the flake itself; its source path must be valid.
    assert!(
        store.is_valid_path(&flake.source_path),
        "resolved flake source '{}' is not a valid store path",
        flake.source_path
    );

    let mut closure = BTreeSet::new();
    closure.insert(flake.source_path.clone());

    let mut queue: VecDeque<&BTreeMap<String, LockedInput>> = VecDeque::new();
    queue.push_back(&flake.lock_file.inputs);

    while let Some(inputs) = queue.pop_front() {
        for (name, input) in inputs {
            if let Some(path) = input.locked.compute_store_path(&store_dir) {
                if store.is_valid_path(&path) {
                    closure.insert(path);
                } else {
                    trace!("input '{}' ({}) not fetched yet", name, input.locked.describe());
                }
            }
            queue.push_back(&input.inputs);
        }
    }

    if closure.is_empty() {
        return Ok(());
    }

    let text = closure.iter().cloned().collect::<Vec<_>>().join(" ");
    let closure_path = store.add_text_to_store("flake-closure", &text, &closure)?;

    std::fs::create_dir_all(root_dir)
        .with_context(|| format!("failed to create {}", root_dir.display()))?;
    let link = root_dir.join(encode_root_name(&flake.flake_ref.to_string()));
    debug!(
        "writing GC root '{}' for flake closure of '{}'",
        link.display(),
        flake.flake_ref
    );
    replace_symlink(&closure_path, &link)?;
    store.add_indirect_root(&link)
}

/// Resolver backed by `nix flake metadata`.
pub struct CliFlakeResolver;

impl CliFlakeResolver {
    fn mode_flags(mode: LockFileMode) -> &'static [&'static str] {
        match mode {
            LockFileMode::AllPure => &["--no-registries", "--no-write-lock-file"],
            LockFileMode::UseNewLockFile => &["--recreate-lock-file", "--no-write-lock-file"],
            LockFileMode::RecreateLockFile => &["--recreate-lock-file"],
            LockFileMode::UpdateLockFile => &[],
            LockFileMode::UseUpdatedLockFile => &["--no-write-lock-file"],
        }
    }
}

impl FlakeResolver for CliFlakeResolver {
    #[instrument(level = "debug", skip(self, flake_ref), fields(flake_ref = %flake_ref))]
    fn resolve(&mut self, flake_ref: &FlakeRef, mode: LockFileMode) -> Result<ResolvedFlake> {
        let mut cmd = NixCommand::new("nix");
        cmd.args(["flake", "metadata", "--json"]);
        cmd.args(Self::mode_flags(mode));
        cmd.arg(flake_ref.to_string());
        let meta: serde_json::Value = cmd
            .json()
            .with_context(|| format!("failed to resolve flake '{}'", flake_ref))?;

        let source_path = meta["path"]
            .as_str()
            .ok_or_else(|| anyhow!("flake '{}' has no source path", flake_ref))?
            .to_string();
        let lock_file = lock_from_node_graph(&meta["locks"])?;

        debug!(source = %source_path, inputs = lock_file.inputs.len(), "resolved flake");
        Ok(ResolvedFlake {
            flake_ref: flake_ref.clone(),
            source_path,
            lock_file,
        })
    }

    fn call_flake(&mut self, eval: &mut dyn Evaluator, flake: &ResolvedFlake) -> Result<Value> {
        eval.eval_expr(&format!(
            "builtins.getFlake \"path:{}\"",
            flake.source_path
        ))
    }
}

/// Convert a flat `{nodes, root}` lock graph (as printed by the nix tools)
/// into the recursive form, guarding against reference cycles by cutting
/// off at any node already on the current descent path.
fn lock_from_node_graph(locks: &serde_json::Value) -> Result<LockFile> {
    let Some(nodes) = locks["nodes"].as_object() else {
        return Ok(LockFile::default());
    };
    let root_key = locks["root"].as_str().unwrap_or("root");

    fn resolve_key<'a>(
        nodes: &'a serde_json::Map<String, serde_json::Value>,
        root_key: &str,
        edge: &serde_json::Value,
    ) -> Option<String> {
        match edge {
            serde_json::Value::String(key) => Some(key.clone()),
            // a "follows" path, walked from the root node
            serde_json::Value::Array(path) => {
                let mut key = root_key.to_string();
                for part in path {
                    let name = part.as_str()?;
                    let next = &nodes.get(&key)?["inputs"][name];
                    key = resolve_key(nodes, root_key, next)?;
                }
                Some(key)
            }
            _ => None,
        }
    }

    fn build_inputs(
        nodes: &serde_json::Map<String, serde_json::Value>,
        root_key: &str,
        key: &str,
        ancestors: &mut Vec<String>,
    ) -> Result<BTreeMap<String, LockedInput>> {
        let mut result = BTreeMap::new();
        let Some(node) = nodes.get(key) else {
            return Ok(result);
        };
        let Some(edges) = node["inputs"].as_object() else {
            return Ok(result);
        };
        for (name, edge) in edges {
            let Some(child_key) = resolve_key(nodes, root_key, edge) else {
                continue;
            };
            let Some(child) = nodes.get(&child_key) else {
                continue;
            };
            let locked: LockedRef = match child.get("locked") {
                Some(l) => serde_json::from_value(l.clone())
                    .with_context(|| format!("malformed locked entry for input '{}'", name))?,
                None => continue,
            };
            let inputs = if ancestors.contains(&child_key) {
                BTreeMap::new()
            } else {
                ancestors.push(child_key.clone());
                let nested = build_inputs(nodes, root_key, &child_key, ancestors)?;
                ancestors.pop();
                nested
            };
            result.insert(name.clone(), LockedInput { locked, inputs });
        }
        Ok(result)
    }

    let mut ancestors = vec![root_key.to_string()];
    let inputs = build_inputs(nodes, root_key, root_key, &mut ancestors)?;
    Ok(LockFile {
        version: crate::lock::LOCK_FILE_VERSION,
        inputs,
    })
}
