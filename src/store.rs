//! Store interface and the process-backed implementation.
//!
//! The resolution core only needs a narrow slice of the store: path
//! validity, symlink resolution into the store, text objects, GC roots,
//! and realization. `CliStore` provides that slice by shelling out to
//! `nix` / `nix-store`; tests substitute in-memory implementations.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, trace};

use crate::command::NixCommand;
use crate::common::Memoized;

/// Whether a store path names a derivation rather than an output.
pub fn is_derivation(path: &str) -> bool {
    path.ends_with(".drv")
}

/// The store operations the resolution core depends on.
///
/// Realization targets use the form `<drvPath>!<out1>,<out2>` for a
/// derivation with selected outputs, or a bare store path.
pub trait Store {
    fn store_dir(&self) -> String;

    fn is_valid_path(&self, path: &str) -> bool;

    /// Whether a path (or a path to something inside it) is in the store.
    fn is_in_store(&self, path: &str) -> bool {
        let dir = self.store_dir();
        path == dir || path.starts_with(&format!("{}/", dir))
    }

    /// Canonicalize `path`, following symlinks, and return the top-level
    /// store path it lands in. `Ok(None)` when the result lies outside
    /// the store.
    fn follow_links_to_store_path(&self, path: &str) -> Result<Option<String>>;

    /// Add a plain-text object referencing every path in `refs`; returns
    /// its store path.
    fn add_text_to_store(
        &mut self,
        name: &str,
        text: &str,
        refs: &BTreeSet<String>,
    ) -> Result<String>;

    /// Register an existing symlink as an indirect GC root.
    fn add_indirect_root(&mut self, link: &Path) -> Result<()>;

    /// Realize every target in the set.
    fn build_paths(&mut self, targets: &BTreeSet<String>) -> Result<()>;

    /// Report which of the targets would have to be fetched or built.
    fn print_missing(&self, targets: &BTreeSet<String>) -> Result<()>;

    /// Derivations known to produce `out_path`.
    fn query_valid_derivers(&self, out_path: &str) -> Result<Vec<String>>;

    fn set_read_only(&mut self, read_only: bool);

    fn read_only(&self) -> bool;
}

/// Resolve a filesystem path to the top-level store path it points into.
pub fn resolve_store_path(store_dir: &str, path: &str) -> Result<Option<String>> {
    let canonical = match std::fs::canonicalize(path) {
        Ok(p) => p,
        Err(_) => return Ok(None),
    };
    let prefix = format!("{}/", store_dir);
    let canonical = canonical.to_string_lossy();
    let Some(rest) = canonical.strip_prefix(&prefix) else {
        return Ok(None);
    };
    // keep only the hash-name component directly below the store
    let top = rest.split('/').next().unwrap_or(rest);
    if top.is_empty() {
        return Ok(None);
    }
    Ok(Some(format!("{}/{}", store_dir, top)))
}

/// Store implementation backed by the nix tool suite.
pub struct CliStore {
    read_only: bool,
    store_dir: Memoized<String>,
}

impl CliStore {
    pub fn new() -> Self {
        Self {
            read_only: false,
            store_dir: Memoized::new(),
        }
    }

    fn ensure_writable(&self, op: &str) -> Result<()> {
        if self.read_only {
            bail!("store is in read-only mode; refusing to {}", op);
        }
        Ok(())
    }

    fn realise_args(targets: &BTreeSet<String>) -> Vec<String> {
        // `drv!a,b` selects outputs; nix spells the selection with `^`
        targets.iter().map(|t| t.replace('!', "^")).collect()
    }
}

impl Default for CliStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for CliStore {
    fn store_dir(&self) -> String {
        self.store_dir.get_or_init(|| {
            let mut cmd = NixCommand::new("nix-instantiate");
            cmd.args(["--eval", "--json", "--expr", "builtins.storeDir"]);
            cmd.json().unwrap_or_else(|_| "/nix/store".to_string())
        })
    }

    fn is_valid_path(&self, path: &str) -> bool {
        let mut cmd = NixCommand::new("nix-store");
        cmd.args(["--query", "--hash", path]);
        cmd.succeeds()
    }

    fn follow_links_to_store_path(&self, path: &str) -> Result<Option<String>> {
        resolve_store_path(&self.store_dir(), path)
    }

    fn add_text_to_store(
        &mut self,
        name: &str,
        text: &str,
        refs: &BTreeSet<String>,
    ) -> Result<String> {
        // read-only mode computes the path without writing the object
        if self.read_only {
            return Ok(crate::hash::make_text_path(
                &self.store_dir(),
                name,
                text,
                refs,
            ));
        }
        // nix-store --add does not register references; the closure file's
        // members stay rooted through the indirect root instead.
        let _ = refs;
        let staging = std::env::temp_dir().join(format!("lode-{}", std::process::id()));
        std::fs::create_dir_all(&staging)?;
        // --add names the store object after the file
        let file = staging.join(name);
        std::fs::write(&file, text)
            .with_context(|| format!("failed to write {}", file.display()))?;
        let mut cmd = NixCommand::new("nix-store");
        cmd.arg("--add").arg(&file);
        let path = cmd.output();
        let _ = std::fs::remove_file(&file);
        path
    }

    fn add_indirect_root(&mut self, link: &Path) -> Result<()> {
        if self.read_only {
            debug!("read-only mode, not registering root {}", link.display());
            return Ok(());
        }
        let target = std::fs::read_link(link)
            .with_context(|| format!("failed to read GC root symlink {}", link.display()))?;
        debug!("registering indirect GC root {}", link.display());
        let mut cmd = NixCommand::new("nix-store");
        cmd.args(["--indirect", "--add-root"])
            .arg(link)
            .arg("--realise")
            .arg(&target);
        cmd.run()
    }

    fn build_paths(&mut self, targets: &BTreeSet<String>) -> Result<()> {
        self.ensure_writable("build")?;
        if targets.is_empty() {
            return Ok(());
        }
        let mut cmd = NixCommand::new("nix");
        cmd.args(["build", "--no-link"]);
        cmd.args(Self::realise_args(targets));
        cmd.run()
    }

    fn print_missing(&self, targets: &BTreeSet<String>) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let mut cmd = NixCommand::new("nix");
        cmd.args(["build", "--dry-run", "--no-link"]);
        cmd.args(Self::realise_args(targets));
        cmd.run()
    }

    fn query_valid_derivers(&self, out_path: &str) -> Result<Vec<String>> {
        let mut cmd = NixCommand::new("nix-store");
        cmd.args(["--query", "--deriver", out_path]);
        let output = cmd
            .output()
            .map_err(|e| anyhow!("failed to query deriver of '{}': {}", out_path, e))?;
        let derivers: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != "unknown-deriver")
            .map(String::from)
            .collect();
        trace!("derivers of {}: {:?}", out_path, derivers);
        Ok(derivers)
    }

    fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
