//! Flake reference parsing.
//!
//! Parses references like:
//! - `.` or `./path` or `/absolute/path` (local trees)
//! - `github:owner/repo` or `github:owner/repo/ref`
//! - `gitlab:owner/repo`, `sourcehut:~user/repo`
//! - `git+https://example.com/repo?ref=main&rev=abc`
//! - `https://example.com/flake.tar.gz`
//! - `nixpkgs` or `flake:nixpkgs` (registry names)
//!
//! Parsing comes in two flavors: a pure syntactic form, and an
//! "allow relative paths" form that additionally resolves path-style
//! references on disk and distinguishes "this is a real directory but not
//! a flake" from a plain syntax error. The classifier in `session` relies
//! on that distinction to defer the former while silently discarding the
//! latter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A flake reference, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlakeRef {
    /// A local tree (`.`, `./foo`, `/absolute`, `path:./foo`)
    Path { path: String },
    /// github:owner/repo[/ref-or-rev]
    GitHub {
        owner: String,
        repo: String,
        ref_or_rev: Option<String>,
    },
    /// gitlab:owner/repo[/ref-or-rev]
    GitLab {
        owner: String,
        repo: String,
        ref_or_rev: Option<String>,
    },
    /// sourcehut:~owner/repo[/ref-or-rev]
    Sourcehut {
        owner: String,
        repo: String,
        ref_or_rev: Option<String>,
    },
    /// git+https://... or git+ssh://..., with `ref`/`rev` pins in params
    Git {
        url: String,
        params: BTreeMap<String, String>,
    },
    /// https://example.com/foo.tar.gz or tarball+https://...
    Tarball { url: String },
    /// Registry name (nixpkgs, flake:nixpkgs)
    Indirect {
        id: String,
        ref_or_rev: Option<String>,
    },
    /// file:///path
    File { path: String },
}

/// Why a string failed to parse as a flake reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlakeRefError {
    /// Not a flake reference at all.
    Bad(String),
    /// A path-style reference whose target exists but holds no flake.
    MissingFlake(String),
}

impl std::fmt::Display for FlakeRefError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlakeRefError::Bad(msg) => write!(f, "bad flake reference: {}", msg),
            FlakeRefError::MissingFlake(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FlakeRefError {}

fn bad(msg: impl Into<String>) -> FlakeRefError {
    FlakeRefError::Bad(msg.into())
}

/// Split an installable string into its reference part and the optional
/// `#attribute` fragment. An empty fragment counts as absent.
pub fn split_fragment(input: &str) -> (&str, Option<String>) {
    match input.find('#') {
        Some(pos) => {
            let attr = &input[pos + 1..];
            (
                &input[..pos],
                (!attr.is_empty()).then(|| attr.to_string()),
            )
        }
        None => (input, None),
    }
}

fn is_path_syntax(input: &str) -> bool {
    input == "."
        || input == ".."
        || input.starts_with("./")
        || input.starts_with("../")
        || input.starts_with('/')
        || input.starts_with('~')
}

fn valid_flake_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Parse a flake reference, syntax only. Path references are kept verbatim;
/// no filesystem access happens here.
pub fn parse_flake_ref(input: &str) -> Result<FlakeRef, FlakeRefError> {
    if input.is_empty() {
        return Err(bad("empty flake reference"));
    }

    if let Some(rest) = input.strip_prefix("github:") {
        return parse_forge_ref("github", rest);
    }
    if let Some(rest) = input.strip_prefix("gitlab:") {
        return parse_forge_ref("gitlab", rest);
    }
    if let Some(rest) = input.strip_prefix("sourcehut:") {
        return parse_forge_ref("sourcehut", rest);
    }
    if input.starts_with("git+") {
        return parse_git_ref(input);
    }
    if let Some(rest) = input.strip_prefix("path:") {
        return Ok(FlakeRef::Path {
            path: rest.to_string(),
        });
    }
    if let Some(rest) = input.strip_prefix("flake:") {
        return parse_indirect_ref(rest);
    }
    if input.starts_with("tarball+") {
        return Ok(FlakeRef::Tarball {
            url: input.trim_start_matches("tarball+").to_string(),
        });
    }
    if let Some(rest) = input.strip_prefix("file://") {
        return Ok(FlakeRef::File {
            path: rest.trim_start_matches("localhost").to_string(),
        });
    }
    if input.starts_with("http://") || input.starts_with("https://") {
        if is_tarball_url(input) {
            return Ok(FlakeRef::Tarball {
                url: input.to_string(),
            });
        }
        return parse_git_ref(&format!("git+{}", input));
    }

    if is_path_syntax(input) {
        return Ok(FlakeRef::Path {
            path: input.to_string(),
        });
    }

    parse_indirect_ref(input)
}

/// Parse a flake reference in "allow relative paths" mode: path-style
/// references are resolved against `base_dir` and must point at a flake.
///
/// A path whose target exists but contains no flake is reported as
/// `MissingFlake`; a nonexistent path is a plain `Bad` reference.
pub fn parse_flake_ref_at(input: &str, base_dir: &Path) -> Result<FlakeRef, FlakeRefError> {
    let parsed = parse_flake_ref(input)?;
    let FlakeRef::Path { path } = &parsed else {
        return Ok(parsed);
    };

    let expanded = shellexpand::tilde(path).to_string();
    let absolute = if expanded.starts_with('/') {
        PathBuf::from(&expanded)
    } else {
        base_dir.join(&expanded)
    };

    if !absolute.exists() {
        return Err(bad(format!(
            "flake path '{}' does not exist",
            absolute.display()
        )));
    }

    let root = find_flake_root(&absolute).ok_or_else(|| {
        FlakeRefError::MissingFlake(format!(
            "path '{}' is not a flake (no flake.nix)",
            absolute.display()
        ))
    })?;

    Ok(FlakeRef::Path {
        path: root.to_string_lossy().into_owned(),
    })
}

/// Directory containing flake.nix for `path`, if any.
///
/// Accepts either the directory itself or its flake.nix file.
fn find_flake_root(path: &Path) -> Option<PathBuf> {
    let path = path.canonicalize().ok()?;

    if path.is_file() {
        if path.file_name().map(|n| n == "flake.nix").unwrap_or(false) {
            return path.parent().map(|p| p.to_path_buf());
        }
        return None;
    }

    if path.is_dir() && path.join("flake.nix").exists() {
        return Some(path);
    }

    None
}

fn parse_forge_ref(scheme: &str, input: &str) -> Result<FlakeRef, FlakeRefError> {
    // Format: owner/repo[/ref][?params]
    let (path_part, _params) = split_query_params(input);

    // a colon here means the argument is really `ref:attr` syntax
    if path_part.contains(':') {
        return Err(bad(format!("{}: invalid ':' in reference", scheme)));
    }

    let parts: Vec<&str> = path_part.split('/').collect();
    if parts.len() < 2 {
        return Err(bad(format!("{}: requires owner/repo format", scheme)));
    }

    let owner = parts[0].to_string();
    let repo = parts[1].to_string();
    if owner.is_empty() || repo.is_empty() {
        return Err(bad(format!("{}: owner and repo cannot be empty", scheme)));
    }
    let ref_or_rev = (parts.len() > 2).then(|| parts[2..].join("/"));

    Ok(match scheme {
        "github" => FlakeRef::GitHub {
            owner,
            repo,
            ref_or_rev,
        },
        "gitlab" => FlakeRef::GitLab {
            owner,
            repo,
            ref_or_rev,
        },
        _ => FlakeRef::Sourcehut {
            owner,
            repo,
            ref_or_rev,
        },
    })
}

fn parse_git_ref(input: &str) -> Result<FlakeRef, FlakeRefError> {
    let url_part = input.strip_prefix("git+").unwrap_or(input);
    let (url, params) = split_query_params(url_part);
    if url.is_empty() {
        return Err(bad("empty git url"));
    }

    Ok(FlakeRef::Git {
        url: url.to_string(),
        params,
    })
}

fn parse_indirect_ref(input: &str) -> Result<FlakeRef, FlakeRefError> {
    // Format: id[/ref-or-rev]
    let (path_part, _params) = split_query_params(input);

    if path_part.contains(':') {
        return Err(bad("invalid ':' in registry reference"));
    }

    let parts: Vec<&str> = path_part.split('/').collect();
    let id = parts[0].to_string();
    if !valid_flake_id(&id) {
        return Err(bad(format!("invalid flake id '{}'", id)));
    }
    let ref_or_rev = (parts.len() > 1).then(|| parts[1..].join("/"));

    Ok(FlakeRef::Indirect { id, ref_or_rev })
}

fn is_tarball_url(input: &str) -> bool {
    let lower = input.to_lowercase();
    [".tar.gz", ".tar.xz", ".tar.bz2", ".tar", ".zip", ".tgz"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

fn split_query_params(input: &str) -> (&str, BTreeMap<String, String>) {
    let Some(pos) = input.find('?') else {
        return (input, BTreeMap::new());
    };
    let mut params = BTreeMap::new();
    for part in input[pos + 1..].split('&') {
        if let Some(eq) = part.find('=') {
            params.insert(part[..eq].to_string(), part[eq + 1..].to_string());
        } else if !part.is_empty() {
            params.insert(part.to_string(), String::new());
        }
    }
    (&input[..pos], params)
}

impl FlakeRef {
    /// Whether this reference names a local, never-fetched tree.
    pub fn is_local(&self) -> bool {
        matches!(self, FlakeRef::Path { .. } | FlakeRef::File { .. })
    }
}

impl std::fmt::Display for FlakeRef {
    /// Canonical string form; re-parses to an equal reference.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlakeRef::Path { path } => write!(f, "{}", path),
            FlakeRef::GitHub {
                owner,
                repo,
                ref_or_rev,
            } => {
                write!(f, "github:{}/{}", owner, repo)?;
                if let Some(r) = ref_or_rev {
                    write!(f, "/{}", r)?;
                }
                Ok(())
            }
            FlakeRef::GitLab {
                owner,
                repo,
                ref_or_rev,
            } => {
                write!(f, "gitlab:{}/{}", owner, repo)?;
                if let Some(r) = ref_or_rev {
                    write!(f, "/{}", r)?;
                }
                Ok(())
            }
            FlakeRef::Sourcehut {
                owner,
                repo,
                ref_or_rev,
            } => {
                write!(f, "sourcehut:{}/{}", owner, repo)?;
                if let Some(r) = ref_or_rev {
                    write!(f, "/{}", r)?;
                }
                Ok(())
            }
            FlakeRef::Git { url, params } => {
                write!(f, "git+{}", url)?;
                let mut sep = '?';
                for (k, v) in params {
                    if v.is_empty() {
                        write!(f, "{}{}", sep, k)?;
                    } else {
                        write!(f, "{}{}={}", sep, k, v)?;
                    }
                    sep = '&';
                }
                Ok(())
            }
            FlakeRef::Tarball { url } => write!(f, "{}", url),
            FlakeRef::Indirect { id, ref_or_rev } => {
                write!(f, "{}", id)?;
                if let Some(r) = ref_or_rev {
                    write!(f, "/{}", r)?;
                }
                Ok(())
            }
            FlakeRef::File { path } => write!(f, "file://{}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn flake_dir() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("flake.nix"),
            r#"{ outputs = { self }: { }; }"#,
        )
        .unwrap();
        tmp
    }

    // ==================== Syntax-only parsing ====================

    #[test]
    fn parse_current_dir() {
        assert_eq!(
            parse_flake_ref(".").unwrap(),
            FlakeRef::Path { path: ".".into() }
        );
    }

    #[test]
    fn parse_relative_and_absolute_paths() {
        assert_eq!(
            parse_flake_ref("./subdir").unwrap(),
            FlakeRef::Path {
                path: "./subdir".into()
            }
        );
        assert_eq!(
            parse_flake_ref("../other").unwrap(),
            FlakeRef::Path {
                path: "../other".into()
            }
        );
        assert_eq!(
            parse_flake_ref("/home/user/project").unwrap(),
            FlakeRef::Path {
                path: "/home/user/project".into()
            }
        );
        assert_eq!(
            parse_flake_ref("path:./relative").unwrap(),
            FlakeRef::Path {
                path: "./relative".into()
            }
        );
    }

    #[test]
    fn parse_github_basic() {
        assert_eq!(
            parse_flake_ref("github:NixOS/nixpkgs").unwrap(),
            FlakeRef::GitHub {
                owner: "NixOS".into(),
                repo: "nixpkgs".into(),
                ref_or_rev: None,
            }
        );
    }

    #[test]
    fn parse_github_with_ref() {
        assert_eq!(
            parse_flake_ref("github:NixOS/nixpkgs/nixos-23.11").unwrap(),
            FlakeRef::GitHub {
                owner: "NixOS".into(),
                repo: "nixpkgs".into(),
                ref_or_rev: Some("nixos-23.11".into()),
            }
        );
    }

    #[test]
    fn parse_github_deep_ref() {
        assert_eq!(
            parse_flake_ref("github:owner/repo/feature/branch").unwrap(),
            FlakeRef::GitHub {
                owner: "owner".into(),
                repo: "repo".into(),
                ref_or_rev: Some("feature/branch".into()),
            }
        );
    }

    #[test]
    fn parse_github_errors() {
        assert!(matches!(
            parse_flake_ref("github:owner"),
            Err(FlakeRefError::Bad(_))
        ));
        assert!(matches!(
            parse_flake_ref("github:"),
            Err(FlakeRefError::Bad(_))
        ));
    }

    #[test]
    fn parse_gitlab_and_sourcehut() {
        assert_eq!(
            parse_flake_ref("gitlab:inkscape/inkscape").unwrap(),
            FlakeRef::GitLab {
                owner: "inkscape".into(),
                repo: "inkscape".into(),
                ref_or_rev: None,
            }
        );
        assert_eq!(
            parse_flake_ref("sourcehut:~sircmpwn/aerc").unwrap(),
            FlakeRef::Sourcehut {
                owner: "~sircmpwn".into(),
                repo: "aerc".into(),
                ref_or_rev: None,
            }
        );
    }

    #[test]
    fn parse_git_with_params() {
        let FlakeRef::Git { url, params } =
            parse_flake_ref("git+https://example.com/repo?ref=main&rev=abc123").unwrap()
        else {
            panic!("expected Git ref");
        };
        assert_eq!(url, "https://example.com/repo");
        assert_eq!(params.get("ref"), Some(&"main".to_string()));
        assert_eq!(params.get("rev"), Some(&"abc123".to_string()));
    }

    #[test]
    fn parse_tarball() {
        assert_eq!(
            parse_flake_ref("https://example.com/flake.tar.gz").unwrap(),
            FlakeRef::Tarball {
                url: "https://example.com/flake.tar.gz".into()
            }
        );
        assert_eq!(
            parse_flake_ref("tarball+https://example.com/a.zip").unwrap(),
            FlakeRef::Tarball {
                url: "https://example.com/a.zip".into()
            }
        );
    }

    #[test]
    fn parse_indirect() {
        assert_eq!(
            parse_flake_ref("nixpkgs").unwrap(),
            FlakeRef::Indirect {
                id: "nixpkgs".into(),
                ref_or_rev: None,
            }
        );
        assert_eq!(
            parse_flake_ref("nixpkgs/nixos-23.11").unwrap(),
            FlakeRef::Indirect {
                id: "nixpkgs".into(),
                ref_or_rev: Some("nixos-23.11".into()),
            }
        );
        assert_eq!(
            parse_flake_ref("flake:home-manager").unwrap(),
            FlakeRef::Indirect {
                id: "home-manager".into(),
                ref_or_rev: None,
            }
        );
    }

    #[test]
    fn parse_indirect_rejects_non_identifiers() {
        assert!(matches!(
            parse_flake_ref("hello.txt"),
            Err(FlakeRefError::Bad(_))
        ));
        assert!(matches!(
            parse_flake_ref("1password"),
            Err(FlakeRefError::Bad(_))
        ));
        assert!(matches!(parse_flake_ref(""), Err(FlakeRefError::Bad(_))));
    }

    #[test]
    fn split_fragment_forms() {
        assert_eq!(split_fragment("nixpkgs#hello"), ("nixpkgs", Some("hello".into())));
        assert_eq!(split_fragment(".#"), (".", None));
        assert_eq!(split_fragment("."), (".", None));
        assert_eq!(
            split_fragment("github:o/r#packages.x86_64-linux.default"),
            ("github:o/r", Some("packages.x86_64-linux.default".into()))
        );
    }

    #[test]
    fn is_local_refs() {
        assert!(parse_flake_ref(".").unwrap().is_local());
        assert!(parse_flake_ref("path:./foo").unwrap().is_local());
        assert!(parse_flake_ref("file:///foo").unwrap().is_local());
        assert!(!parse_flake_ref("github:o/r").unwrap().is_local());
        assert!(!parse_flake_ref("nixpkgs").unwrap().is_local());
    }

    #[test]
    fn display_roundtrip() {
        for case in [
            "github:NixOS/nixpkgs",
            "github:owner/repo/branch",
            "gitlab:owner/repo",
            "sourcehut:~owner/repo",
            "nixpkgs",
            "nixpkgs/nixos-23.11",
            "https://example.com/flake.tar.gz",
        ] {
            let parsed = parse_flake_ref(case).unwrap();
            assert_eq!(parse_flake_ref(&parsed.to_string()).unwrap(), parsed);
        }
    }

    // ==================== Allow-relative mode ====================

    #[test]
    fn allow_relative_resolves_flake_dir() {
        let tmp = flake_dir();
        let parsed = parse_flake_ref_at(".", tmp.path()).unwrap();
        let FlakeRef::Path { path } = parsed else {
            panic!("expected path ref");
        };
        assert_eq!(
            PathBuf::from(path),
            tmp.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn allow_relative_accepts_flake_nix_file() {
        let tmp = flake_dir();
        let file = tmp.path().join("flake.nix");
        let parsed = parse_flake_ref_at(file.to_str().unwrap(), tmp.path()).unwrap();
        let FlakeRef::Path { path } = parsed else {
            panic!("expected path ref");
        };
        assert_eq!(PathBuf::from(path), tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn allow_relative_missing_flake() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("plain")).unwrap();
        let err = parse_flake_ref_at("./plain", tmp.path()).unwrap_err();
        assert!(matches!(err, FlakeRefError::MissingFlake(_)), "{:?}", err);
    }

    #[test]
    fn allow_relative_nonexistent_path_is_bad() {
        let tmp = TempDir::new().unwrap();
        let err = parse_flake_ref_at("./nope", tmp.path()).unwrap_err();
        assert!(matches!(err, FlakeRefError::Bad(_)), "{:?}", err);
    }

    #[test]
    fn allow_relative_leaves_remote_refs_alone() {
        let tmp = TempDir::new().unwrap();
        let parsed = parse_flake_ref_at("github:NixOS/nixpkgs", tmp.path()).unwrap();
        assert!(matches!(parsed, FlakeRef::GitHub { .. }));
    }
}
