//! Expression evaluation behind an opaque-value interface.
//!
//! The resolution core never inspects evaluated values directly; it holds
//! opaque handles and asks the evaluator to select attributes, force
//! values, or read derivation coordinates. `NixEvaluator` implements the
//! interface by generating guarded Nix expressions (attribute descent is
//! wrapped in `builtins.tryEval`, so a missing or throwing attribute reads
//! as a lookup miss) and evaluating them with `nix-instantiate`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::command::NixCommand;

/// Opaque handle to a value owned by an `Evaluator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(pub u64);

/// Derivation coordinates produced by evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrvInfo {
    #[serde(rename = "drvPath")]
    pub drv_path: String,
    #[serde(rename = "outPath")]
    pub out_path: String,
    #[serde(rename = "outputName", default)]
    pub output_name: String,
}

/// The evaluator operations the resolution core depends on.
pub trait Evaluator {
    /// Hand back a value for an expression supplied on the command line.
    fn eval_expr(&mut self, text: &str) -> Result<Value>;

    /// Evaluate a file's root value (the legacy `-f` path; impure).
    fn eval_file(&mut self, path: &Path) -> Result<Value>;

    /// Force the value shallowly, surfacing evaluation errors.
    fn force(&mut self, v: Value) -> Result<()>;

    /// Walk a dotted attribute path, auto-calling functions with the
    /// configured arguments along the way. `Ok(None)` means the path does
    /// not lead to a value.
    fn select(&mut self, v: Value, attr_path: &str) -> Result<Option<Value>>;

    /// Single attribute access, without auto-calling.
    fn get_attr(&mut self, v: Value, name: &str) -> Result<Option<Value>>;

    /// Coerce the value to a string.
    fn force_string(&mut self, v: Value) -> Result<String>;

    /// `Some` iff the value is a derivation.
    fn derivation_info(&mut self, v: Value) -> Result<Option<DrvInfo>>;

    /// Collect the derivations inside a value: the value itself, or the
    /// members of an attribute set, recursing into sets that opt in via
    /// `recurseForDerivations`.
    fn derivations_in(&mut self, v: Value) -> Result<Vec<DrvInfo>>;
}

/// An `--arg` / `--argstr` style auto-argument.
#[derive(Debug, Clone)]
pub enum AutoArg {
    Expr(String),
    Str(String),
}

/// Evaluator backed by `nix-instantiate --eval --json`.
///
/// Each handle holds the text of a deferred expression; every operation
/// wraps that text in a small generated helper and evaluates the result.
pub struct NixEvaluator {
    values: Vec<String>,
    base_dir: PathBuf,
    auto_args: BTreeMap<String, AutoArg>,
}

/// Quote a string as a Nix string literal.
pub fn nix_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Convert a dotted attribute path to a Nix list expression.
///
/// `"packages.x86_64-linux.hello"` becomes
/// `["packages" "x86_64-linux" "hello"]`; the empty path becomes `[]`.
pub fn attr_to_nix_list(attr: &str) -> String {
    let parts: Vec<&str> = attr.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return "[]".to_string();
    }
    let quoted: Vec<String> = parts.iter().map(|p| nix_string_literal(p)).collect();
    format!("[{}]", quoted.join(" "))
}

impl NixEvaluator {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            values: Vec::new(),
            base_dir,
            auto_args: BTreeMap::new(),
        }
    }

    pub fn with_auto_args(mut self, args: BTreeMap<String, AutoArg>) -> Self {
        self.auto_args = args;
        self
    }

    fn alloc(&mut self, expr: String) -> Value {
        self.values.push(expr);
        Value(self.values.len() as u64 - 1)
    }

    fn expr(&self, v: Value) -> Result<&str> {
        self.values
            .get(v.0 as usize)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("unknown value handle {}", v.0))
    }

    /// The auto-argument set as a Nix attrset literal.
    fn auto_args_expr(&self) -> String {
        let mut out = String::from("{ ");
        for (name, arg) in &self.auto_args {
            match arg {
                AutoArg::Expr(e) => out.push_str(&format!("{} = ({}); ", name, e)),
                AutoArg::Str(s) => {
                    out.push_str(&format!("{} = {}; ", name, nix_string_literal(s)))
                }
            }
        }
        out.push('}');
        out
    }

    /// Shared preamble: auto-argument application and guarded descent.
    fn descend_preamble(&self, root: &str) -> String {
        format!(
            r#"
  root = ({root});
  autoArgs = {auto_args};
  autoCall = v:
    if builtins.isFunction v
    then v (builtins.intersectAttrs (builtins.functionArgs v) autoArgs)
    else v;
  descend = v: path:
    if path == [] then true
    else
      let v2 = autoCall v; n = builtins.head path; in
      if builtins.isAttrs v2 && v2 ? ${{n}}
      then descend v2.${{n}} (builtins.tail path)
      else false;
  walk = v: path:
    if path == [] then autoCall v
    else walk (autoCall v).${{builtins.head path}} (builtins.tail path);
"#,
            root = root,
            auto_args = self.auto_args_expr(),
        )
    }

    #[instrument(level = "trace", skip(self, expr), fields(expr_len = expr.len()))]
    fn eval_json<T: serde::de::DeserializeOwned>(&self, expr: &str) -> Result<T> {
        trace!("evaluating expression:\n{}", expr);
        let mut cmd = NixCommand::new("nix-instantiate");
        cmd.current_dir(&self.base_dir);
        cmd.args(["--eval", "--json", "--strict", "--read-write-mode", "-E", expr]);
        cmd.json()
    }
}

impl Evaluator for NixEvaluator {
    fn eval_expr(&mut self, text: &str) -> Result<Value> {
        Ok(self.alloc(format!("({})", text)))
    }

    fn eval_file(&mut self, path: &Path) -> Result<Value> {
        let expanded = shellexpand::tilde(&path.to_string_lossy().into_owned()).to_string();
        let absolute = if expanded.starts_with('/') {
            PathBuf::from(&expanded)
        } else {
            self.base_dir.join(&expanded)
        };
        if !absolute.exists() {
            anyhow::bail!("file '{}' does not exist", absolute.display());
        }
        Ok(self.alloc(format!("(import {})", absolute.display())))
    }

    fn force(&mut self, v: Value) -> Result<()> {
        let expr = self.expr(v)?.to_string();
        let forced: bool = self
            .eval_json(&format!("builtins.seq ({}) true", expr))
            .with_context(|| "evaluation failed".to_string())?;
        anyhow::ensure!(forced, "evaluation produced no value");
        Ok(())
    }

    fn select(&mut self, v: Value, attr_path: &str) -> Result<Option<Value>> {
        if attr_path.is_empty() {
            return Ok(Some(v));
        }
        let root = self.expr(v)?.to_string();
        let path_list = attr_to_nix_list(attr_path);
        let probe = format!(
            "let {preamble} ok = builtins.tryEval (descend root {path}); in ok.success && ok.value",
            preamble = self.descend_preamble(&root),
            path = path_list,
        );
        let found: bool = self.eval_json(&probe)?;
        if !found {
            return Ok(None);
        }
        let selected = format!(
            "(let {preamble} in walk root {path})",
            preamble = self.descend_preamble(&root),
            path = path_list,
        );
        Ok(Some(self.alloc(selected)))
    }

    fn get_attr(&mut self, v: Value, name: &str) -> Result<Option<Value>> {
        let root = self.expr(v)?.to_string();
        let quoted = nix_string_literal(name);
        let probe = format!(
            "let root = ({root}); ok = builtins.tryEval (builtins.isAttrs root && root ? ${{{quoted}}}); in ok.success && ok.value",
        );
        let found: bool = self.eval_json(&probe)?;
        if !found {
            return Ok(None);
        }
        Ok(Some(self.alloc(format!("(({root}).${{{quoted}}})"))))
    }

    fn force_string(&mut self, v: Value) -> Result<String> {
        let expr = self.expr(v)?.to_string();
        self.eval_json(&format!("builtins.toString ({})", expr))
    }

    fn derivation_info(&mut self, v: Value) -> Result<Option<DrvInfo>> {
        let root = self.expr(v)?.to_string();
        let expr = format!(
            r#"
let
  v = ({root});
  isDrv = (builtins.tryEval ((v.type or null) == "derivation")).value or false;
in
  if isDrv
  then {{ drvPath = v.drvPath; outPath = "${{v.outPath}}"; outputName = v.outputName or ""; }}
  else null
"#,
        );
        self.eval_json(&expr)
    }

    fn derivations_in(&mut self, v: Value) -> Result<Vec<DrvInfo>> {
        let root = self.expr(v)?.to_string();
        let expr = format!(
            r#"
let
  {preamble}
  isDrv = v: (builtins.tryEval ((v.type or null) == "derivation")).value or false;
  info = v: {{ drvPath = v.drvPath; outPath = "${{v.outPath}}"; outputName = v.outputName or ""; }};
  collect = v:
    let v2 = autoCall v; in
    if isDrv v2 then [ (info v2) ]
    else if builtins.isAttrs v2 then
      builtins.concatMap
        (n:
          let
            probe = builtins.tryEval (
              let sub = v2.${{n}}; in
              if isDrv sub then [ (info sub) ]
              else if builtins.isAttrs sub && (sub.recurseForDerivations or false)
              then collect sub
              else []);
          in if probe.success then probe.value else [])
        (builtins.attrNames v2)
    else [];
in collect root
"#,
            preamble = self.descend_preamble(&root),
        );
        self.eval_json(&expr)
    }
}
