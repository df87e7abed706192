//! Software-version requirements declared by registry entries.
//!
//! A requirement is either a bare package name (`"bitsandbytes"`) or a name
//! followed by a comparison against a dotted version (`"auto_gptq>=0.4.2"`).
//! Installed versions are declared by the caller in a [`PackageVersions`]
//! table, since the packages themselves live outside this process.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ResolveError, ResolveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
    Ne,
}

impl Op {
    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            Op::Ge => ord != Ordering::Less,
            Op::Gt => ord == Ordering::Greater,
            Op::Le => ord != Ordering::Greater,
            Op::Lt => ord == Ordering::Less,
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
        }
    }
}

// Two-character operators come first so `>=` is not read as `>`.
const OPERATORS: &[(&str, Op)] = &[
    (">=", Op::Ge),
    ("<=", Op::Le),
    ("==", Op::Eq),
    ("!=", Op::Ne),
    (">", Op::Gt),
    ("<", Op::Lt),
];

/// A parsed `name[op version]` requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    constraint: Option<(Op, String)>,
    raw: String,
}

impl Requirement {
    pub fn parse(raw: &str) -> ResolveResult<Self> {
        let raw = raw.trim();
        let split = raw.find(|c| matches!(c, '<' | '>' | '=' | '!'));
        let (name, constraint) = match split {
            None => (raw, None),
            Some(idx) => {
                let (name, rest) = raw.split_at(idx);
                let (sym, op) = OPERATORS
                    .iter()
                    .find(|(sym, _)| rest.starts_with(sym))
                    .ok_or_else(|| ResolveError::validation("requires", format!("bad operator in '{raw}'")))?;
                let version = rest[sym.len()..].trim();
                if version.is_empty() {
                    return Err(ResolveError::validation("requires", format!("missing version in '{raw}'")));
                }
                (name, Some((*op, version.to_string())))
            }
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(ResolveError::validation("requires", format!("missing package name in '{raw}'")));
        }
        Ok(Self {
            name: name.to_string(),
            constraint,
            raw: raw.to_string(),
        })
    }

    /// Check this requirement against the declared installed versions.
    pub fn check(&self, installed: &PackageVersions) -> ResolveResult<()> {
        let Some(version) = installed.get(&self.name) else {
            return Err(ResolveError::DependencyVersion {
                requirement: self.raw.clone(),
                reason: format!("package '{}' is not installed", self.name),
            });
        };
        if let Some((op, wanted)) = &self.constraint {
            if !op.accepts(compare_versions(version, wanted)) {
                return Err(ResolveError::DependencyVersion {
                    requirement: self.raw.clone(),
                    reason: format!("found {} {}", self.name, version),
                });
            }
        }
        Ok(())
    }
}

/// Compare dotted versions numerically, padding the shorter one with zeros.
/// Non-numeric suffixes on a segment (`"1rc2"`) are ignored.
fn compare_versions(a: &str, b: &str) -> Ordering {
    fn segments(v: &str) -> Vec<u64> {
        v.split('.')
            .map(|seg| {
                let digits: String = seg.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }
    let (a, b) = (segments(a), segments(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).copied().unwrap_or(0).cmp(&b.get(i).copied().unwrap_or(0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Declared versions of external packages, keyed by package name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageVersions(BTreeMap<String, String>);

impl PackageVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, version: &str) -> Self {
        self.0.insert(name.to_string(), version.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Check every requirement string, failing on the first unmet one.
    pub fn require_all<S: AsRef<str>>(&self, requirements: &[S]) -> ResolveResult<()> {
        for raw in requirements {
            Requirement::parse(raw.as_ref())?.check(self)?;
        }
        Ok(())
    }
}
