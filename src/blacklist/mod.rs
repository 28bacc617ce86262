//! Data-driven rules for kernels that must not be built.
//!
//! The rule document is YAML:
//!
//! ```yaml
//! matchers:
//!   redhat: '^(?P<version>[0-9]\.[0-9]+\.[0-9]+)-(?P<rpmrelver>[0-9]+)...$'
//! blacklists:            # `ignorelist` is accepted as well
//!   - description: "RHEL 8.8 kernels break the kmod"
//!     probe_versions: [12.16.0, 12.16.1]
//!     probe_kinds: [kmod]   # empty or missing = every kind
//!     matcher: redhat
//!     skip_if: "{{ version == '4.18.0' and (rpmrelver|int) <= 500 }}"
//! ```
//!
//! Rules apply only to the probe versions they list. They are checked in
//! order and the first one whose predicate holds supplies the skip reason.
//! Everything is compiled when the document is loaded; an invalid regex,
//! unknown matcher or malformed predicate fails the load.

pub mod expr;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use crate::probe::ProbeKind;
use expr::Predicate;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDocument {
    #[serde(default)]
    matchers: BTreeMap<String, String>,
    #[serde(default, alias = "ignorelist")]
    blacklists: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    description: String,
    #[serde(default)]
    probe_versions: Vec<serde_yaml::Value>,
    #[serde(default)]
    probe_kinds: Vec<String>,
    matcher: String,
    skip_if: String,
}

/// One compiled rule.
#[derive(Debug, Clone)]
pub struct BlacklistRule {
    pub description: String,
    probe_versions: BTreeSet<String>,
    probe_kinds: BTreeSet<ProbeKind>,
    matcher: Regex,
    skip_if: Predicate,
}

impl BlacklistRule {
    fn applies_to(&self, probe_version: &str, kind: ProbeKind) -> bool {
        self.probe_versions.contains(probe_version)
            && (self.probe_kinds.is_empty() || self.probe_kinds.contains(&kind))
    }

    /// Whether the rule skips `kernel_release`. Evaluation errors count as
    /// "does not apply" and are logged.
    fn skips(&self, kernel_release: &str) -> bool {
        let Some(caps) = self.matcher.captures(kernel_release) else {
            return false;
        };
        let groups: HashMap<String, String> = self
            .matcher
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();

        match self.skip_if.is_satisfied(&groups) {
            Ok(skip) => skip,
            Err(e) => {
                tracing::warn!(
                    rule = %self.description,
                    kernel = %kernel_release,
                    predicate = %self.skip_if.source(),
                    error = %e,
                    "skip rule could not be evaluated"
                );
                false
            }
        }
    }
}

/// Version scalars are written unquoted (`12.16.0`, sometimes `12.16`), so
/// YAML may hand them over as strings or numbers.
fn version_string(value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => bail!("probe version must be a scalar, got {:?}", other),
    }
}

/// The rule set in effect for one probe version.
#[derive(Debug, Clone)]
pub struct Blacklist {
    probe_version: String,
    rules: Vec<BlacklistRule>,
}

impl Blacklist {
    /// A blacklist that never skips anything.
    pub fn empty(probe_version: impl Into<String>) -> Self {
        Self {
            probe_version: probe_version.into(),
            rules: Vec::new(),
        }
    }

    pub fn load(path: &Path, probe_version: impl Into<String>) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading blacklist {}", path.display()))?;
        Self::from_yaml(&text, probe_version).with_context(|| format!("loading blacklist {}", path.display()))
    }

    pub fn from_yaml(text: &str, probe_version: impl Into<String>) -> Result<Self> {
        let doc: RuleDocument = serde_yaml::from_str(text).context("parsing blacklist document")?;

        let mut matchers = HashMap::new();
        for (name, pattern) in &doc.matchers {
            let regex = Regex::new(pattern).with_context(|| format!("compiling matcher `{}`", name))?;
            matchers.insert(name.as_str(), regex);
        }

        let mut rules = Vec::with_capacity(doc.blacklists.len());
        for entry in doc.blacklists {
            let matcher = matchers
                .get(entry.matcher.as_str())
                .with_context(|| format!("rule `{}` uses unknown matcher `{}`", entry.description, entry.matcher))?
                .clone();
            let skip_if = Predicate::parse(&entry.skip_if)
                .with_context(|| format!("compiling skip_if of rule `{}`", entry.description))?;
            let probe_versions = entry
                .probe_versions
                .iter()
                .map(version_string)
                .collect::<Result<BTreeSet<_>>>()
                .with_context(|| format!("probe_versions of rule `{}`", entry.description))?;
            let probe_kinds = entry
                .probe_kinds
                .iter()
                .map(|k| k.parse())
                .collect::<Result<BTreeSet<ProbeKind>>>()
                .with_context(|| format!("probe_kinds of rule `{}`", entry.description))?;

            rules.push(BlacklistRule {
                description: entry.description,
                probe_versions,
                probe_kinds,
                matcher,
                skip_if,
            });
        }

        Ok(Self {
            probe_version: probe_version.into(),
            rules,
        })
    }

    pub fn rules(&self) -> &[BlacklistRule] {
        &self.rules
    }

    /// Reason `kernel_release` must not be built for `kind`, if any.
    pub fn reason(&self, kind: ProbeKind, kernel_release: &str) -> Option<String> {
        self.rules
            .iter()
            .filter(|rule| rule.applies_to(&self.probe_version, kind))
            .find(|rule| rule.skips(kernel_release))
            .map(|rule| rule.description.clone())
    }
}
