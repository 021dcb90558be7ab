//! Manifest loading and target resolution.
//!
//! A manifest is a YAML document with an optional top-level `terrallel`
//! settings object and a `targets` map. Imports are glob patterns resolved
//! relative to the main manifest's directory; every imported file
//! contributes its own `targets` map. Named targets may reference one
//! another through `group`; resolution materialises each name into an
//! owned [`Target`] tree and rejects duplicates, unknown references and
//! cycles before anything runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ManifestError;

/// The optional `terrallel` settings block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Directory under which every workspace directory lives.
    #[serde(default)]
    pub basedir: String,
    /// Glob patterns naming additional manifest files.
    #[serde(default)]
    pub import: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    terrallel: Option<Settings>,
    #[serde(default)]
    targets: BTreeMap<String, RawTarget>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    #[serde(default)]
    workspaces: Vec<String>,
    #[serde(default)]
    group: Vec<String>,
    next: Option<Box<RawTarget>>,
}

/// A fully-resolved target: group members are embedded trees, not names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub group: Vec<Target>,
    pub workspaces: Vec<String>,
    pub next: Option<Box<Target>>,
}

/// A loaded manifest: settings plus every resolvable target by name.
#[derive(Debug)]
pub struct Manifest {
    pub settings: Settings,
    pub targets: BTreeMap<String, Target>,
}

/// Load the manifest at `path`, expand its imports, and resolve every
/// target.
pub fn load(path: &Path) -> Result<Manifest, ManifestError> {
    let main = read_manifest(path)?;
    let settings = main.terrallel.unwrap_or_default();
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut pool = BTreeMap::new();
    for pattern in &settings.import {
        for file in expand_import(base, pattern)? {
            let imported = read_manifest(&file)?;
            merge(&mut pool, imported.targets, &file)?;
        }
    }
    merge(&mut pool, main.targets, path)?;
    tracing::debug!(targets = pool.len(), "manifest loaded");

    let targets = resolve(&pool)?;
    Ok(Manifest { settings, targets })
}

fn read_manifest(path: &Path) -> Result<RawManifest, ManifestError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml_bw::from_str(&raw).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn merge(
    pool: &mut BTreeMap<String, RawTarget>,
    targets: BTreeMap<String, RawTarget>,
    source: &Path,
) -> Result<(), ManifestError> {
    for (name, target) in targets {
        if pool.contains_key(&name) {
            return Err(ManifestError::Duplicate {
                name,
                path: source.to_path_buf(),
            });
        }
        pool.insert(name, target);
    }
    Ok(())
}

/// Expand one import pattern relative to the manifest directory. A pattern
/// without glob metacharacters that matches nothing is kept as a literal
/// path, so a missing import file surfaces as a read error instead of
/// silently vanishing.
fn expand_import(base: &Path, pattern: &str) -> Result<Vec<PathBuf>, ManifestError> {
    let full = base.join(pattern);
    let walk = glob::glob(&full.to_string_lossy()).map_err(|source| ManifestError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in walk {
        match entry {
            Ok(path) => files.push(path),
            Err(err) => {
                let path = err.path().to_path_buf();
                return Err(ManifestError::Read {
                    path,
                    source: err.into_error(),
                });
            }
        }
    }
    if files.is_empty() && !contains_glob(pattern) {
        files.push(full);
    }
    Ok(files)
}

fn contains_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?') || pattern.contains('[')
}

fn resolve(pool: &BTreeMap<String, RawTarget>) -> Result<BTreeMap<String, Target>, ManifestError> {
    let mut resolved = BTreeMap::new();
    let mut stack = Vec::new();
    for (name, raw) in pool {
        if resolved.contains_key(name) {
            continue;
        }
        stack.push(name.clone());
        let target = build(name, raw, pool, &mut resolved, &mut stack)?;
        stack.pop();
        resolved.insert(name.clone(), target);
    }
    Ok(resolved)
}

fn build(
    name: &str,
    raw: &RawTarget,
    pool: &BTreeMap<String, RawTarget>,
    resolved: &mut BTreeMap<String, Target>,
    stack: &mut Vec<String>,
) -> Result<Target, ManifestError> {
    if !raw.workspaces.is_empty() && !raw.group.is_empty() {
        return Err(ManifestError::MixedNode {
            name: name.to_string(),
        });
    }
    let mut group = Vec::new();
    for member in &raw.group {
        if let Some(done) = resolved.get(member) {
            group.push(done.clone());
            continue;
        }
        if stack.iter().any(|n| n == member) {
            let mut chain = stack.clone();
            chain.push(member.clone());
            return Err(ManifestError::Cycle { chain });
        }
        let raw_member = pool
            .get(member)
            .ok_or_else(|| ManifestError::UnknownTarget {
                name: member.clone(),
            })?;
        stack.push(member.clone());
        let built = build(member, raw_member, pool, resolved, stack)?;
        stack.pop();
        resolved.insert(member.clone(), built.clone());
        group.push(built);
    }
    let next = match &raw.next {
        Some(raw_next) => Some(Box::new(build("next", raw_next, pool, resolved, stack)?)),
        None => None,
    };
    Ok(Target {
        name: name.to_string(),
        group,
        workspaces: raw.workspaces.clone(),
        next,
    })
}
