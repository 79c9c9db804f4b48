//! Lock-file model.
//!
//! The pinned input graph of a resolved flake, in the recursive (version 4)
//! format: every input carries its locked source plus its own nested inputs.
//! Parsing and writing the on-disk file belongs to the flake resolver; this
//! module only models the graph, computes input store paths, and serializes
//! deterministically so fingerprints are stable.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::hash;

pub const LOCK_FILE_VERSION: u32 = 4;

fn default_version() -> u32 {
    LOCK_FILE_VERSION
}

/// The resolved, transitively-locked inputs of a flake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub inputs: BTreeMap<String, LockedInput>,
}

/// One locked input: its pinned source and its own nested inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedInput {
    pub locked: LockedRef,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, LockedInput>,
}

/// A pinned source, as recorded in the lock file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedRef {
    #[serde(rename = "type", default)]
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "narHash", skip_serializing_if = "Option::is_none")]
    pub nar_hash: Option<String>,
    #[serde(rename = "lastModified", skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

impl LockFile {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse lock file")
    }

    /// Deterministic serialization; inputs are kept in name order at every
    /// level, so equal graphs serialize identically.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("lock file serialization cannot fail")
    }
}

impl LockedRef {
    /// Display form with pinned revision and date, e.g.
    /// `github:NixOS/nixpkgs/1234abcd (2024-01-31)`.
    pub fn describe(&self) -> String {
        let url = match self.source_type.as_str() {
            "github" | "gitlab" | "sourcehut" => format!(
                "{}:{}/{}/{}",
                self.source_type,
                self.owner.as_deref().unwrap_or(""),
                self.repo.as_deref().unwrap_or(""),
                self.rev.as_deref().unwrap_or("")
            ),
            "git" => format!(
                "git+{}?rev={}",
                self.url.as_deref().unwrap_or(""),
                self.rev.as_deref().unwrap_or("")
            ),
            "path" => format!("path:{}", self.path.as_deref().unwrap_or("")),
            _ => self
                .url
                .clone()
                .unwrap_or_else(|| self.source_type.clone()),
        };

        if let Some(last_modified) = self.last_modified {
            if let Some(dt) = DateTime::from_timestamp(last_modified, 0) {
                return format!("{} ({})", url, dt.format("%Y-%m-%d"));
            }
        }
        url
    }

    /// Store path this input unpacks to, derived from its NAR hash.
    ///
    /// The input may not be fetched yet; the path is computable regardless.
    /// `None` when the entry carries no usable hash (e.g. path inputs).
    pub fn compute_store_path(&self, store_dir: &str) -> Option<String> {
        let digest = nar_hash_bytes(self.nar_hash.as_deref()?)?;
        Some(hash::make_fixed_output_path(store_dir, &digest, "source"))
    }
}

/// Decode a `sha256:` NAR hash in base32 or hex form.
fn nar_hash_bytes(nar_hash: &str) -> Option<[u8; 32]> {
    let rest = nar_hash.strip_prefix("sha256:")?;
    let bytes = match rest.len() {
        52 => hash::from_nix_base32(rest).ok()?,
        64 => (0..32)
            .map(|i| u8::from_str_radix(&rest[2 * i..2 * i + 2], 16).ok())
            .collect::<Option<Vec<u8>>>()?,
        _ => return None,
    };
    bytes.try_into().ok()
}
