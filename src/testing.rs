//! In-memory collaborators for behavioral tests.
//!
//! `MemStore` tracks every mutating call so tests can assert on realization
//! requests, text objects, and GC roots. `MemEval` evaluates programmed
//! JSON trees: objects with `"type": "derivation"` read as derivations,
//! `{"__call": body}` stands for a function that auto-applies to `body`,
//! and `{"__throw": msg}` fails when forced.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use serde_json::Value as Json;

use crate::eval::{DrvInfo, Evaluator, Value};
use crate::flake::{FlakeResolver, LockFileMode, ResolvedFlake};
use crate::flake_ref::FlakeRef;
use crate::hash;
use crate::store::Store;

pub(crate) struct MemStore {
    pub dir: String,
    pub valid: BTreeSet<String>,
    /// Programmed results for follow_links_to_store_path.
    pub links: HashMap<String, String>,
    pub derivers: HashMap<String, Vec<String>>,
    /// Every text object added: (name, text, refs).
    pub text_objects: Vec<(String, String, BTreeSet<String>)>,
    pub roots: Vec<PathBuf>,
    pub built: Vec<BTreeSet<String>>,
    pub missing_printed: std::cell::RefCell<Vec<BTreeSet<String>>>,
    read_only: bool,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            dir: "/nix/store".to_string(),
            valid: BTreeSet::new(),
            links: HashMap::new(),
            derivers: HashMap::new(),
            text_objects: Vec::new(),
            roots: Vec::new(),
            built: Vec::new(),
            missing_printed: std::cell::RefCell::new(Vec::new()),
            read_only: false,
        }
    }
}

impl Store for MemStore {
    fn store_dir(&self) -> String {
        self.dir.clone()
    }

    fn is_valid_path(&self, path: &str) -> bool {
        self.valid.contains(path)
    }

    fn follow_links_to_store_path(&self, path: &str) -> Result<Option<String>> {
        Ok(self.links.get(path).cloned())
    }

    fn add_text_to_store(
        &mut self,
        name: &str,
        text: &str,
        refs: &BTreeSet<String>,
    ) -> Result<String> {
        let path = hash::make_text_path(&self.dir, name, text, refs);
        // read-only mode computes the path without writing
        if !self.read_only {
            self.text_objects
                .push((name.to_string(), text.to_string(), refs.clone()));
            self.valid.insert(path.clone());
        }
        Ok(path)
    }

    fn add_indirect_root(&mut self, link: &Path) -> Result<()> {
        if !self.read_only {
            self.roots.push(link.to_path_buf());
        }
        Ok(())
    }

    fn build_paths(&mut self, targets: &BTreeSet<String>) -> Result<()> {
        if self.read_only {
            bail!("store is read-only");
        }
        self.built.push(targets.clone());
        Ok(())
    }

    fn print_missing(&self, targets: &BTreeSet<String>) -> Result<()> {
        self.missing_printed.borrow_mut().push(targets.clone());
        Ok(())
    }

    fn query_valid_derivers(&self, out_path: &str) -> Result<Vec<String>> {
        Ok(self.derivers.get(out_path).cloned().unwrap_or_default())
    }

    fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

pub(crate) struct MemEval {
    values: Vec<Json>,
    pub exprs: HashMap<String, Json>,
    pub files: HashMap<PathBuf, Json>,
    pub eval_expr_calls: usize,
    pub select_calls: usize,
}

impl MemEval {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            exprs: HashMap::new(),
            files: HashMap::new(),
            eval_expr_calls: 0,
            select_calls: 0,
        }
    }

    pub fn program(&mut self, expr: &str, tree: Json) {
        self.exprs.insert(expr.to_string(), tree);
    }

    fn alloc(&mut self, tree: Json) -> Value {
        self.values.push(tree);
        Value(self.values.len() as u64 - 1)
    }

    fn tree(&self, v: Value) -> Result<&Json> {
        self.values
            .get(v.0 as usize)
            .ok_or_else(|| anyhow!("unknown value handle {}", v.0))
    }

    fn auto_call(node: &Json) -> &Json {
        match node.get("__call") {
            Some(body) => Self::auto_call(body),
            None => node,
        }
    }

    fn is_drv(node: &Json) -> bool {
        node.get("type").and_then(Json::as_str) == Some("derivation")
    }

    fn drv_info(node: &Json) -> DrvInfo {
        DrvInfo {
            drv_path: node["drvPath"].as_str().unwrap_or("").to_string(),
            out_path: node["outPath"].as_str().unwrap_or("").to_string(),
            output_name: node["outputName"].as_str().unwrap_or("").to_string(),
        }
    }

    fn collect(node: &Json, acc: &mut Vec<DrvInfo>) {
        let node = Self::auto_call(node);
        if Self::is_drv(node) {
            acc.push(Self::drv_info(node));
            return;
        }
        let Some(obj) = node.as_object() else {
            return;
        };
        for (key, sub) in obj {
            if key == "recurseForDerivations" {
                continue;
            }
            if Self::is_drv(sub) {
                acc.push(Self::drv_info(sub));
            } else if sub.get("recurseForDerivations").and_then(Json::as_bool) == Some(true) {
                Self::collect(sub, acc);
            }
        }
    }
}

impl Evaluator for MemEval {
    fn eval_expr(&mut self, text: &str) -> Result<Value> {
        self.eval_expr_calls += 1;
        let tree = self
            .exprs
            .get(text)
            .cloned()
            .ok_or_else(|| anyhow!("evaluation error: unknown expression '{}'", text))?;
        Ok(self.alloc(tree))
    }

    fn eval_file(&mut self, path: &Path) -> Result<Value> {
        let tree = self
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("file '{}' does not exist", path.display()))?;
        Ok(self.alloc(tree))
    }

    fn force(&mut self, v: Value) -> Result<()> {
        let node = self.tree(v)?;
        if let Some(msg) = node.get("__throw").and_then(Json::as_str) {
            bail!("evaluation error: {}", msg);
        }
        Ok(())
    }

    fn select(&mut self, v: Value, attr_path: &str) -> Result<Option<Value>> {
        self.select_calls += 1;
        let mut node = self.tree(v)?.clone();
        for part in attr_path.split('.').filter(|p| !p.is_empty()) {
            let applied = Self::auto_call(&node).clone();
            // a throwing value along the path reads as "not found"
            if applied.get("__throw").is_some() {
                return Ok(None);
            }
            match applied.get(part) {
                Some(next) => node = next.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(self.alloc(node)))
    }

    fn get_attr(&mut self, v: Value, name: &str) -> Result<Option<Value>> {
        let node = self.tree(v)?.clone();
        Ok(node.get(name).map(|sub| self.alloc(sub.clone())))
    }

    fn force_string(&mut self, v: Value) -> Result<String> {
        let node = self.tree(v)?;
        match node.as_str() {
            Some(s) => Ok(s.to_string()),
            None => bail!("value is not a string"),
        }
    }

    fn derivation_info(&mut self, v: Value) -> Result<Option<DrvInfo>> {
        let node = self.tree(v)?;
        Ok(Self::is_drv(node).then(|| Self::drv_info(node)))
    }

    fn derivations_in(&mut self, v: Value) -> Result<Vec<DrvInfo>> {
        let node = self.tree(v)?.clone();
        let mut acc = Vec::new();
        Self::collect(&node, &mut acc);
        Ok(acc)
    }
}

/// Build a derivation tree node for programming `MemEval`.
pub(crate) fn drv_json(drv_path: &str, out_path: &str, output_name: &str) -> Json {
    serde_json::json!({
        "type": "derivation",
        "drvPath": drv_path,
        "outPath": out_path,
        "outputName": output_name,
    })
}

pub(crate) struct MemResolver {
    pub flakes: HashMap<String, ResolvedFlake>,
    pub resolve_calls: usize,
    pub call_flake_calls: usize,
    pub last_mode: Option<LockFileMode>,
}

impl MemResolver {
    pub fn new() -> Self {
        Self {
            flakes: HashMap::new(),
            resolve_calls: 0,
            call_flake_calls: 0,
            last_mode: None,
        }
    }

    /// The expression key `call_flake` evaluates for a resolved flake;
    /// program the evaluator's tree under this key.
    pub fn outputs_expr(source_path: &str) -> String {
        format!("flake:{}", source_path)
    }
}

impl FlakeResolver for MemResolver {
    fn resolve(&mut self, flake_ref: &FlakeRef, mode: LockFileMode) -> Result<ResolvedFlake> {
        self.resolve_calls += 1;
        self.last_mode = Some(mode);
        self.flakes
            .get(&flake_ref.to_string())
            .cloned()
            .ok_or_else(|| anyhow!("cannot resolve flake '{}'", flake_ref))
    }

    fn call_flake(&mut self, eval: &mut dyn Evaluator, flake: &ResolvedFlake) -> Result<Value> {
        self.call_flake_calls += 1;
        eval.eval_expr(&Self::outputs_expr(&flake.source_path))
    }
}
