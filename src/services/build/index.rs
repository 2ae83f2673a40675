//! Package indexes consulted by the dependency-install step

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::domain::manifest::{normalize_name, ManifestError, Requirement};

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("no package named '{0}' in the index")]
    UnknownPackage(String),
    #[error("version {requested} is not available (available: {available})")]
    UnknownVersion { requested: String, available: String },
}

/// Source of installable package versions.
pub trait PackageIndex {
    fn resolve(&self, requirement: &Requirement) -> Result<(), ResolveError>;
}

/// Accepts every exactly pinned requirement. Used when no index file is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct PinnedIndex;

impl PackageIndex for PinnedIndex {
    fn resolve(&self, _requirement: &Requirement) -> Result<(), ResolveError> {
        Ok(())
    }
}

/// Fixed set of available `name==version` pairs; a package may list several versions.
#[derive(Debug, Default, Clone)]
pub struct StaticIndex {
    packages: HashMap<String, BTreeSet<String>>,
}

impl StaticIndex {
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut packages: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (name, version) = line
                .split_once("==")
                .map(|(n, v)| (n.trim(), v.trim()))
                .filter(|(n, v)| !n.is_empty() && !v.is_empty())
                .ok_or_else(|| ManifestError::Malformed {
                    line: idx + 1,
                    text: line.to_string(),
                })?;
            packages
                .entry(normalize_name(name))
                .or_default()
                .insert(version.to_string());
        }
        Ok(Self { packages })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read package index {}: {}", path.display(), e))?;
        Ok(Self::parse(&text)?)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

impl PackageIndex for StaticIndex {
    fn resolve(&self, requirement: &Requirement) -> Result<(), ResolveError> {
        let versions = self
            .packages
            .get(&requirement.normalized_name())
            .ok_or_else(|| ResolveError::UnknownPackage(requirement.name.clone()))?;
        if versions.contains(&requirement.version) {
            Ok(())
        } else {
            Err(ResolveError::UnknownVersion {
                requested: requirement.version.clone(),
                available: versions.iter().cloned().collect::<Vec<_>>().join(", "),
            })
        }
    }
}
