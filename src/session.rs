//! Command context: option flags, classification of raw command-line
//! arguments into installables, and the prepare hooks commands call
//! before use.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, ensure, Result};
use clap::{ArgAction, Args};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::eval::Evaluator;
use crate::flake::{lock_file_mode, EvalCache, FlakeResolver, LockFileMode};
use crate::flake_ref::{parse_flake_ref_at, split_fragment, FlakeRefError};
use crate::installable::Installable;
use crate::store::Store;

/// Lock-file handling flags shared by every flake-consuming command.
#[derive(Debug, Clone, Args)]
pub struct FlakeOpts {
    /// Recreate the lock file from scratch
    #[arg(long)]
    pub recreate_lock_file: bool,

    /// Do not save the newly generated lock file
    #[arg(long = "no-save-lock-file", action = ArgAction::SetFalse)]
    pub save_lock_file: bool,

    /// Don't use flake registries
    #[arg(long = "no-registries", action = ArgAction::SetFalse)]
    pub use_registries: bool,
}

impl FlakeOpts {
    pub fn lock_file_mode(&self) -> LockFileMode {
        lock_file_mode(
            self.use_registries,
            self.recreate_lock_file,
            self.save_lock_file,
        )
    }
}

impl Default for FlakeOpts {
    fn default() -> Self {
        Self {
            recreate_lock_file: false,
            save_lock_file: true,
            use_registries: true,
        }
    }
}

/// Source selection for the legacy `-f` mode.
#[derive(Debug, Clone, Default, Args)]
pub struct SourceOpts {
    /// Evaluate a set of attributes from FILE (deprecated)
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub file: Option<PathBuf>,
}

/// Current platform in the `<arch>-<os>` convention used by flake outputs.
pub fn current_system() -> String {
    let arch = match std::env::consts::ARCH {
        "x86" => "i686",
        "arm" => "armv7l",
        other => other,
    };
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    format!("{}-{}", arch, os)
}

/// Everything resolution needs, bundled for injection: the store, the
/// evaluator, the flake resolver, the evaluation cache, and the flags
/// governing lock-file handling and attribute search.
pub struct Session<'a> {
    pub store: &'a mut dyn Store,
    pub eval: &'a mut dyn Evaluator,
    pub resolver: &'a mut dyn FlakeResolver,
    pub cache: &'a EvalCache,
    pub lock_mode: LockFileMode,
    /// Legacy explicit-file override (`-f`).
    pub file: Option<PathBuf>,
    /// Directory relative flake paths resolve against.
    pub cwd: PathBuf,
    /// Candidate attribute paths tried when a flake ref carries no
    /// attribute of its own.
    pub default_attr_paths: Vec<String>,
    /// Prefixes tried in front of an explicit attribute path, in order.
    pub attr_path_prefixes: Vec<String>,
    /// Where GC-root symlinks for flake closures live.
    pub root_dir: PathBuf,
}

static ATTR_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9-_+]*(\.[A-Za-z_][A-Za-z0-9-_+]*)*$")
        .expect("attribute path pattern is valid")
});

static DOTTED_SYNTAX_WARNINGS: AtomicUsize = AtomicUsize::new(0);

#[cfg(test)]
pub(crate) fn dotted_syntax_warnings() -> usize {
    DOTTED_SYNTAX_WARNINGS.load(Ordering::Relaxed)
}

impl<'a> Session<'a> {
    pub fn new(
        store: &'a mut dyn Store,
        eval: &'a mut dyn Evaluator,
        resolver: &'a mut dyn FlakeResolver,
        cache: &'a EvalCache,
        cwd: PathBuf,
    ) -> Self {
        Self {
            store,
            eval,
            resolver,
            cache,
            lock_mode: LockFileMode::UseUpdatedLockFile,
            file: None,
            cwd,
            default_attr_paths: vec!["default".to_string()],
            attr_path_prefixes: Vec::new(),
            root_dir: crate::flake::closure_root_dir(),
        }
    }

    /// Configure the package search order for the given platform.
    pub fn with_system(mut self, system: &str) -> Self {
        self.default_attr_paths = vec![
            format!("packages.{}.default", system),
            format!("legacyPackages.{}.default", system),
        ];
        self.attr_path_prefixes = vec![
            format!("packages.{}.", system),
            format!("legacyPackages.{}.", system),
        ];
        self
    }

    /// Classify raw command-line strings into installables, one per input,
    /// in order.
    ///
    /// With `-f FILE` every string is an attribute path into the file's
    /// root value (impure legacy path). Otherwise, per string: inline
    /// expressions, the deprecated dotted registry form, whole flake URLs,
    /// `ref:attr` splitting at the last colon, then store-path lookup —
    /// in that order. A "real path but not a flake" failure is deferred
    /// and only surfaced when every later fallback misses too.
    #[instrument(level = "debug", skip(self, args), fields(count = args.len()))]
    pub fn parse_installables(&mut self, args: &[String]) -> Result<Vec<Installable>> {
        if let Some(file) = self.file.clone() {
            debug!("loading attributes from {}", file.display());
            let root = self.eval.eval_file(&file)?;
            let args = if args.is_empty() {
                vec![String::new()]
            } else {
                args.to_vec()
            };
            return Ok(args
                .iter()
                .map(|s| Installable::AttrPath {
                    root,
                    attr_path: s.clone(),
                })
                .collect());
        }

        args.iter().map(|s| self.parse_one(s)).collect()
    }

    fn parse_one(&mut self, s: &str) -> Result<Installable> {
        if s.starts_with('(') {
            return Ok(Installable::Expr {
                text: s.to_string(),
            });
        }

        if let Some(attr) = s.strip_prefix("nixpkgs.") {
            if ATTR_PATH_RE.is_match(attr) {
                if DOTTED_SYNTAX_WARNINGS.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("the syntax 'nixpkgs.<attr>' is deprecated; use 'nixpkgs:<attr>' instead");
                }
                return Ok(Installable::Flake {
                    flake_ref: crate::flake_ref::FlakeRef::Indirect {
                        id: "nixpkgs".to_string(),
                        ref_or_rev: None,
                    },
                    attr_paths: vec![format!("legacyPackages.{}", attr)],
                    prefixes: Vec::new(),
                });
            }
        }

        // A full flake URL (with optional #attr) wins over the colon and
        // store-path fallbacks.
        let mut missing_flake: Option<anyhow::Error> = None;
        let (ref_part, fragment) = split_fragment(s);
        match parse_flake_ref_at(ref_part, &self.cwd) {
            Ok(flake_ref) => {
                return Ok(match fragment {
                    Some(attr) => Installable::Flake {
                        flake_ref,
                        attr_paths: vec![attr],
                        prefixes: self.attr_path_prefixes.clone(),
                    },
                    None => Installable::Flake {
                        flake_ref,
                        attr_paths: self.default_attr_paths.clone(),
                        prefixes: Vec::new(),
                    },
                });
            }
            Err(err @ FlakeRefError::MissingFlake(_)) => {
                debug!("deferring: {}", err);
                missing_flake = Some(err.into());
            }
            Err(FlakeRefError::Bad(_)) => {}
        }

        // ref:attr, split at the last colon
        if let Some(colon) = s.rfind(':') {
            match parse_flake_ref_at(&s[..colon], &self.cwd) {
                Ok(flake_ref) => {
                    return Ok(Installable::Flake {
                        flake_ref,
                        attr_paths: vec![s[colon + 1..].to_string()],
                        prefixes: self.attr_path_prefixes.clone(),
                    });
                }
                Err(err @ FlakeRefError::MissingFlake(_)) => {
                    if missing_flake.is_none() {
                        debug!("deferring: {}", err);
                        missing_flake = Some(err.into());
                    }
                }
                Err(FlakeRefError::Bad(_)) => {}
            }
        }

        // path-looking arguments may name (a symlink to) a store path
        if s.contains('/') {
            let expanded = shellexpand::tilde(s).to_string();
            if let Some(path) = self.store.follow_links_to_store_path(&expanded)? {
                return Ok(Installable::StorePath { path });
            }
        }

        match missing_flake {
            Some(err) => Err(err),
            None => bail!("unsupported argument '{}'", s),
        }
    }

    /// Hook for multi-installable commands: default to the current
    /// directory when no arguments were given and the command permits it.
    pub fn prepare_installables(
        &mut self,
        raw: &[String],
        use_default: bool,
    ) -> Result<Vec<Installable>> {
        let raw = if raw.is_empty() && self.file.is_none() && use_default {
            vec![".".to_string()]
        } else {
            raw.to_vec()
        };
        self.parse_installables(&raw)
    }

    /// Hook for single-installable commands.
    pub fn prepare_installable(&mut self, raw: &str) -> Result<Installable> {
        let mut installables = self.parse_installables(&[raw.to_string()])?;
        ensure!(
            installables.len() == 1,
            "'{}' parsed to {} installables",
            raw,
            installables.len()
        );
        Ok(installables.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flake_ref::FlakeRef;
    use crate::testing::{MemEval, MemResolver, MemStore};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        store: MemStore,
        eval: MemEval,
        resolver: MemResolver,
        cache: EvalCache,
        cwd: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MemStore::new(),
                eval: MemEval::new(),
                resolver: MemResolver::new(),
                cache: EvalCache::new(),
                cwd: TempDir::new().unwrap(),
            }
        }

        fn session(&mut self) -> Session<'_> {
            Session::new(
                &mut self.store,
                &mut self.eval,
                &mut self.resolver,
                &self.cache,
                self.cwd.path().to_path_buf(),
            )
            .with_system("x86_64-linux")
        }

        fn parse(&mut self, s: &str) -> Result<Installable> {
            let mut sess = self.session();
            sess.prepare_installable(s)
        }

        fn make_flake(&self, name: &str) {
            let dir = self.cwd.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("flake.nix"), "{ outputs = { self }: { }; }").unwrap();
        }
    }

    #[test]
    fn expression_classification() {
        let mut fx = Fixture::new();
        let i = fx.parse("(1+1)").unwrap();
        assert!(matches!(i, Installable::Expr { ref text } if text == "(1+1)"));
    }

    #[test]
    fn dotted_nixpkgs_classification_warns_once() {
        let mut fx = Fixture::new();
        let before = dotted_syntax_warnings();

        let i = fx.parse("nixpkgs.hello").unwrap();
        let Installable::Flake {
            flake_ref,
            attr_paths,
            prefixes,
        } = i
        else {
            panic!("expected flake installable");
        };
        assert_eq!(
            flake_ref,
            FlakeRef::Indirect {
                id: "nixpkgs".to_string(),
                ref_or_rev: None
            }
        );
        assert_eq!(attr_paths, vec!["legacyPackages.hello"]);
        assert!(prefixes.is_empty());

        fx.parse("nixpkgs.hello").unwrap();
        fx.parse("nixpkgs.cowsay").unwrap();
        // the counter keeps growing but only the first crossing warns
        assert!(dotted_syntax_warnings() > before);
    }

    #[test]
    fn registry_name_with_fragment() {
        let mut fx = Fixture::new();
        let i = fx.parse("github:owner/repo#pkg").unwrap();
        let Installable::Flake {
            flake_ref,
            attr_paths,
            prefixes,
        } = i
        else {
            panic!("expected flake installable");
        };
        assert_eq!(flake_ref.to_string(), "github:owner/repo");
        assert_eq!(attr_paths, vec!["pkg"]);
        assert_eq!(
            prefixes,
            vec!["packages.x86_64-linux.", "legacyPackages.x86_64-linux."]
        );
    }

    #[test]
    fn bare_flake_ref_gets_default_attr_paths() {
        let mut fx = Fixture::new();
        let i = fx.parse("github:owner/repo").unwrap();
        let Installable::Flake {
            attr_paths,
            prefixes,
            ..
        } = i
        else {
            panic!("expected flake installable");
        };
        assert_eq!(
            attr_paths,
            vec![
                "packages.x86_64-linux.default",
                "legacyPackages.x86_64-linux.default"
            ]
        );
        assert!(prefixes.is_empty());
    }

    #[test]
    fn local_flake_with_fragment() {
        let mut fx = Fixture::new();
        fx.make_flake("local");
        let i = fx.parse("./local#pkg").unwrap();
        let Installable::Flake {
            flake_ref,
            attr_paths,
            ..
        } = i
        else {
            panic!("expected flake installable");
        };
        assert!(matches!(flake_ref, FlakeRef::Path { .. }));
        assert_eq!(attr_paths, vec!["pkg"]);
    }

    #[test]
    fn colon_split_at_last_colon() {
        let mut fx = Fixture::new();
        let i = fx.parse("github:owner/repo:pkg").unwrap();
        let Installable::Flake {
            flake_ref,
            attr_paths,
            ..
        } = i
        else {
            panic!("expected flake installable");
        };
        assert_eq!(flake_ref.to_string(), "github:owner/repo");
        assert_eq!(attr_paths, vec!["pkg"]);
    }

    #[test]
    fn store_path_lookup_after_flake_failures() {
        let mut fx = Fixture::new();
        // a symlink-like argument that resolves into the store
        fx.store.links.insert(
            "./result".to_string(),
            "/nix/store/abc-hello".to_string(),
        );
        let i = fx.parse("./result").unwrap();
        assert!(matches!(
            i,
            Installable::StorePath { ref path } if path == "/nix/store/abc-hello"
        ));
    }

    #[test]
    fn flake_ref_wins_over_store_path() {
        let mut fx = Fixture::new();
        fx.make_flake("local");
        // even though the path would also resolve to a store path, the
        // flake classification comes first
        let arg = "./local".to_string();
        fx.store
            .links
            .insert(arg.clone(), "/nix/store/abc-local".to_string());
        let i = fx.parse(&arg).unwrap();
        assert!(matches!(i, Installable::Flake { .. }));
    }

    #[test]
    fn missing_flake_error_is_deferred_then_reraised() {
        let mut fx = Fixture::new();
        // exists on disk, contains no flake.nix, resolves to nothing
        fs::create_dir_all(fx.cwd.path().join("plain")).unwrap();
        let err = fx.parse("./plain").unwrap_err();
        assert!(err.to_string().contains("not a flake"), "{}", err);
    }

    #[test]
    fn missing_flake_from_colon_split_is_reraised() {
        let mut fx = Fixture::new();
        fs::create_dir_all(fx.cwd.path().join("local")).unwrap();
        let err = fx.parse("./local:pkg").unwrap_err();
        assert!(err.to_string().contains("not a flake"), "{}", err);
    }

    #[test]
    fn colon_argument_can_still_be_a_store_path() {
        let mut fx = Fixture::new();
        fs::create_dir_all(fx.cwd.path().join("local")).unwrap();
        fx.store.links.insert(
            "./local:pkg".to_string(),
            "/nix/store/abc-weird".to_string(),
        );
        let i = fx.parse("./local:pkg").unwrap();
        assert!(matches!(i, Installable::StorePath { .. }));
    }

    #[test]
    fn unsupported_argument() {
        let mut fx = Fixture::new();
        let err = fx.parse("!!!not-a-thing!!!").unwrap_err();
        assert!(err.to_string().contains("unsupported argument"), "{}", err);
    }

    #[test]
    fn file_mode_turns_everything_into_attr_paths() {
        let mut fx = Fixture::new();
        let file = fx.cwd.path().join("default.nix");
        fx.eval
            .files
            .insert(file.clone(), json!({ "hello": {} }));

        let mut sess = fx.session();
        sess.file = Some(file);
        let parsed = sess
            .parse_installables(&["hello".to_string(), "world".to_string()])
            .unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed
            .iter()
            .all(|i| matches!(i, Installable::AttrPath { .. })));
    }

    #[test]
    fn file_mode_defaults_to_root_attr() {
        let mut fx = Fixture::new();
        let file = fx.cwd.path().join("default.nix");
        fx.eval.files.insert(file.clone(), json!({}));

        let mut sess = fx.session();
        sess.file = Some(file);
        let parsed = sess.parse_installables(&[]).unwrap();
        assert_eq!(parsed.len(), 1);
        let Installable::AttrPath { attr_path, .. } = &parsed[0] else {
            panic!("expected attr path installable");
        };
        assert_eq!(attr_path, "");
    }

    #[test]
    fn prepare_defaults_to_current_directory() {
        let mut fx = Fixture::new();
        fs::write(
            fx.cwd.path().join("flake.nix"),
            "{ outputs = { self }: { }; }",
        )
        .unwrap();
        let mut sess = fx.session();
        let parsed = sess.prepare_installables(&[], true).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(matches!(parsed[0], Installable::Flake { .. }));
    }

    #[test]
    fn prepare_without_default_stays_empty() {
        let mut fx = Fixture::new();
        let mut sess = fx.session();
        let parsed = sess.prepare_installables(&[], false).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn classification_preserves_order() {
        let mut fx = Fixture::new();
        let mut sess = fx.session();
        let parsed = sess
            .parse_installables(&["(1+1)".to_string(), "nixpkgs:hello".to_string()])
            .unwrap();
        assert!(matches!(parsed[0], Installable::Expr { .. }));
        assert!(matches!(parsed[1], Installable::Flake { .. }));
    }

    #[test]
    fn lock_mode_from_flags() {
        let opts = FlakeOpts::default();
        assert_eq!(opts.lock_file_mode(), LockFileMode::UpdateLockFile);

        let opts = FlakeOpts {
            use_registries: false,
            ..FlakeOpts::default()
        };
        assert_eq!(opts.lock_file_mode(), LockFileMode::AllPure);

        let opts = FlakeOpts {
            recreate_lock_file: true,
            save_lock_file: false,
            ..FlakeOpts::default()
        };
        assert_eq!(opts.lock_file_mode(), LockFileMode::UseNewLockFile);
    }

    #[test]
    fn current_system_shape() {
        let system = current_system();
        let parts: Vec<&str> = system.split('-').collect();
        assert_eq!(parts.len(), 2);
    }
}
