//! Summary of a build run: a table for the terminal and a JSON document.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::builder::{KernelBuildResult, ProbeBuildResult};
use crate::probe::ProbeKind;

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub generated_at: String,
    pub kernel_type: String,
    pub probe_name: String,
    pub probe_version: String,
    pub kernels: Vec<KernelBuildResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub built: usize,
    pub existing: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BuildReport {
    pub fn new(
        kernel_type: impl Into<String>,
        probe_name: impl Into<String>,
        probe_version: impl Into<String>,
        kernels: Vec<KernelBuildResult>,
    ) -> Self {
        let generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            generated_at,
            kernel_type: kernel_type.into(),
            probe_name: probe_name.into(),
            probe_version: probe_version.into(),
            kernels,
        }
    }

    /// Kernels with at least one failed probe.
    pub fn failed(&self) -> impl Iterator<Item = &KernelBuildResult> {
        self.kernels.iter().filter(|k| k.failed())
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    /// Per-probe counts over both kinds.
    pub fn totals(&self) -> Totals {
        let mut totals = Totals::default();
        for kernel in &self.kernels {
            for kind in ProbeKind::ALL {
                match kernel.result(kind) {
                    ProbeBuildResult::Built { .. } => totals.built += 1,
                    ProbeBuildResult::AlreadyExisting => totals.existing += 1,
                    ProbeBuildResult::Skipped { .. } => totals.skipped += 1,
                    ProbeBuildResult::Failed { .. } => totals.failed += 1,
                }
            }
        }
        totals
    }

    /// One row per kernel, then a totals line.
    pub fn render_table(&self) -> String {
        let rows: Vec<[String; 4]> = self
            .kernels
            .iter()
            .map(|k| {
                [
                    k.release.to_string(),
                    k.config_hash.clone().unwrap_or_else(|| "-".to_string()),
                    k.kmod.status().to_string(),
                    k.ebpf.status().to_string(),
                ]
            })
            .collect();
        let header = ["RELEASE", "HASH", "KMOD", "EBPF"];
        let mut widths = header.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }

        let mut out = String::new();
        let line = |out: &mut String, cells: [&str; 4]| {
            let _ = writeln!(
                out,
                "{:<w0$}  {:<w1$}  {:<w2$}  {}",
                cells[0],
                cells[1],
                cells[2],
                cells[3],
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2]
            );
        };
        line(&mut out, header);
        for row in &rows {
            line(&mut out, [row[0].as_str(), row[1].as_str(), row[2].as_str(), row[3].as_str()]);
        }

        let t = self.totals();
        let _ = writeln!(
            out,
            "\n{} kernels: {} built, {} existing, {} skipped, {} failed",
            self.kernels.len(),
            t.built,
            t.existing,
            t.skipped,
            t.failed
        );
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serializing build report")?;
        fs::write(path, json).with_context(|| format!("writing report {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::ReleaseKey;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    fn report() -> BuildReport {
        BuildReport::new(
            "CentOS",
            "sysdig-probe",
            "0.29.3",
            vec![
                KernelBuildResult {
                    release: ReleaseKey::new("4.18.0-80.el8.x86_64"),
                    kernel_release: "4.18.0-80.el8.x86_64".to_string(),
                    config_hash: Some("abc".to_string()),
                    kmod: ProbeBuildResult::Built {
                        elapsed: Duration::from_secs(3),
                    },
                    ebpf: ProbeBuildResult::AlreadyExisting,
                },
                KernelBuildResult {
                    release: ReleaseKey::new("3.10.0-1160.el7.x86_64"),
                    kernel_release: "3.10.0-1160.el7.x86_64".to_string(),
                    config_hash: None,
                    kmod: ProbeBuildResult::Failed {
                        elapsed: Duration::from_secs(1),
                        output: "error".to_string(),
                    },
                    ebpf: ProbeBuildResult::Skipped {
                        reason: "too old".to_string(),
                    },
                },
            ],
        )
    }

    #[test]
    fn test_totals_and_failures() {
        let report = report();
        assert_eq!(
            report.totals(),
            Totals {
                built: 1,
                existing: 1,
                skipped: 1,
                failed: 1
            }
        );
        assert!(report.has_failures());
        assert_eq!(report.failed().count(), 1);
    }

    #[test]
    fn test_table() {
        let table = report().render_table();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "RELEASE                 HASH  KMOD    EBPF");
        assert_eq!(lines[1], "4.18.0-80.el8.x86_64    abc   built   existing");
        assert_eq!(lines[2], "3.10.0-1160.el7.x86_64  -     failed  skipped");
        assert_eq!(lines[4], "2 kernels: 1 built, 1 existing, 1 skipped, 1 failed");
    }

    #[test]
    fn test_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("report.json");
        report().write_json(&path).unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["kernel_type"], "CentOS");
        assert_eq!(value["kernels"][0]["kmod"]["status"], "built");
        assert_eq!(value["kernels"][1]["ebpf"]["reason"], "too old");
        assert_eq!(value["kernels"][0]["release"]["kernel_release"], "4.18.0-80.el8.x86_64");
        assert!(OffsetDateTime::parse(value["generated_at"].as_str().unwrap(), &Rfc3339).is_ok());
    }
}
