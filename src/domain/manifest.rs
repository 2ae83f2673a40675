//! Dependency manifest: a flat list of exactly pinned `name==version` lines.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Version operators that constrain a range instead of pinning.
const RANGE_OPERATORS: &[&str] = &["===", "~=", ">=", "<=", "!=", ">", "<"];

#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("line {line}: '{name}' is not pinned to an exact version")]
    Unpinned { line: usize, name: String },
    #[error("line {line}: '{spec}' uses a version range; pin it with ==")]
    RangeConstraint { line: usize, spec: String },
    #[error("line {line}: cannot parse '{text}'")]
    Malformed { line: usize, text: String },
    #[error("line {line}: '{name}' already declared on line {first_line}")]
    Duplicate {
        name: String,
        first_line: usize,
        line: usize,
    },
}

/// A single pinned requirement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Requirement {
    pub name: String,
    pub version: String,
    /// 1-based line in the manifest file
    #[serde(skip)]
    pub line: usize,
}

impl Requirement {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            line: 0,
        }
    }

    /// Name compared case-insensitively with `-`, `_` and `.` treated alike.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=={}", self.name, self.version)
    }
}

pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DependencyManifest {
    pub requirements: Vec<Requirement>,
}

impl DependencyManifest {
    /// Parse manifest text. Order is preserved so rendering is deterministic.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut requirements: Vec<Requirement> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let content = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if content.is_empty() {
                continue;
            }

            let requirement = parse_line(content, line)?;
            let normalized = requirement.normalized_name();
            if let Some(first) = requirements
                .iter()
                .find(|r| r.normalized_name() == normalized)
            {
                return Err(ManifestError::Duplicate {
                    name: requirement.name,
                    first_line: first.line,
                    line,
                });
            }
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Requirement> {
        let wanted = normalize_name(name);
        self.requirements
            .iter()
            .find(|r| r.normalized_name() == wanted)
    }
}

impl fmt::Display for DependencyManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for req in &self.requirements {
            writeln!(f, "{}", req)?;
        }
        Ok(())
    }
}

fn parse_line(content: &str, line: usize) -> Result<Requirement, ManifestError> {
    // `===` contains `==`, so ranges are rejected before the pin split
    if RANGE_OPERATORS.iter().any(|op| content.contains(op)) {
        return Err(ManifestError::RangeConstraint {
            line,
            spec: content.to_string(),
        });
    }

    let Some((name, version)) = content.split_once("==") else {
        return if is_valid_name(content) {
            Err(ManifestError::Unpinned {
                line,
                name: content.to_string(),
            })
        } else {
            Err(ManifestError::Malformed {
                line,
                text: content.to_string(),
            })
        };
    };

    let name = name.trim();
    let version = version.trim();

    if version.contains('*') || version.contains(',') {
        return Err(ManifestError::RangeConstraint {
            line,
            spec: content.to_string(),
        });
    }
    if !is_valid_name(name) || !is_valid_version(version) {
        return Err(ManifestError::Malformed {
            line,
            text: content.to_string(),
        });
    }

    Ok(Requirement {
        name: name.to_string(),
        version: version.to_string(),
        line,
    })
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+' | '!'))
}
