//! Storage repository discovery.
//!
//! An OVS storage repository is a mounted filesystem carrying an
//! `.ovsrepo` marker file at its root. Repositories are discovered by
//! walking the mount table and keeping entries with a readable marker;
//! per-disk metadata comes from the `.ovsmeta` JSON file next to it.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{ExporterError, ExporterResult};

/// Mount table consulted for repository discovery.
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Marker file identifying a repository root.
pub const REPO_MARKER: &str = ".ovsrepo";

/// Per-repository disk metadata file.
pub const REPO_META: &str = ".ovsmeta";

/// A single storage repository.
#[derive(Debug, Clone, PartialEq)]
pub struct Repo {
    pub id: String,
    pub mount_point: PathBuf,
    pub filesystem: String,
    pub alias: Option<String>,
}

/// One item of repository disk metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoMetaItem {
    #[serde(rename = "OBJECT_TYPE")]
    pub object_type: Option<String>,
    #[serde(rename = "SIMPLE_NAME")]
    pub simple_name: Option<String>,
}

impl Repo {
    /// Returns the repository disk metadata, keyed by disk name. Not all
    /// repositories carry a metadata file; that is reported as an error
    /// the caller is expected to tolerate.
    pub fn meta(&self) -> ExporterResult<HashMap<String, RepoMetaItem>> {
        let meta_file = self.mount_point.join(REPO_META);
        let data = fs::read(&meta_file)
            .map_err(|e| ExporterError::io(format!("reading {}", meta_file.display()), e))?;
        serde_json::from_slice(&data)
            .map_err(|e| ExporterError::io("unmarshaling ovsmeta", e.into()))
    }
}

/// Scans the mount table and returns every mounted repository.
pub fn scan_repos() -> ExporterResult<Vec<Repo>> {
    let content = fs::read_to_string(PROC_MOUNTS)
        .map_err(|e| ExporterError::io(format!("reading {PROC_MOUNTS}"), e))?;
    let mut ret = Vec::new();
    for (mount_point, filesystem) in parse_mounts(&content) {
        if !mount_point.join(REPO_MARKER).is_file() {
            continue;
        }
        ret.push(load_repo(mount_point, filesystem));
    }
    Ok(ret)
}

/// Parses mount table lines into (mount point, filesystem type) pairs.
fn parse_mounts(content: &str) -> Vec<(PathBuf, String)> {
    let mut ret = Vec::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let (Some(mount), Some(fstype)) = (fields.next(), fields.next()) else {
            continue;
        };
        ret.push((PathBuf::from(unescape_mount(mount)), fstype.to_string()));
    }
    ret
}

/// Reverses the octal escaping applied to mount points in /proc/mounts
/// (spaces appear as \040, tabs as \011).
fn unescape_mount(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    out
}

fn load_repo(mount_point: PathBuf, filesystem: String) -> Repo {
    let marker = mount_point.join(REPO_MARKER);
    let mut id = None;
    let mut alias = None;
    if let Ok(content) = fs::read_to_string(&marker) {
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "OVS_REPO_UUID" => id = Some(value.trim().to_string()),
                "OVS_REPO_ALIAS" => alias = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    let id = id.unwrap_or_else(|| {
        mount_point
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| mount_point.to_string_lossy().into_owned())
    });
    Repo {
        id,
        mount_point,
        filesystem,
        alias,
    }
}
