//! Host tool checks, run before any crawling or unpacking.
//!
//! # Example
//!
//! ```rust
//! use probe_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("dpkg-deb") {
//!     println!("dpkg not installed");
//! }
//!
//! let tools = &[("rpm2cpio", "rpm2cpio"), ("cpio", "cpio")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::builder::BuilderFamily;

/// Check if a command exists in `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Needed by every build: the container runtime.
pub const BASE_TOOLS: &[(&str, &str)] = &[("docker", "docker")];

/// Needed when the probe sources are cloned rather than given.
pub const SOURCE_TOOLS: &[(&str, &str)] = &[("git", "git")];

/// Check that specific tools are available.
///
/// Each tuple is `(command, package)`; the error lists every missing tool.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools.iter().filter(|(tool, _)| !command_exists(tool)).collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Tools a build for `family` needs.
pub fn build_tools(family: BuilderFamily, clone_sources: bool) -> Vec<(&'static str, &'static str)> {
    let mut tools = BASE_TOOLS.to_vec();
    tools.extend_from_slice(family.builder().required_tools());
    if clone_sources {
        tools.extend_from_slice(SOURCE_TOOLS);
    }
    tools
}

/// Check every tool a build for `family` needs.
pub fn check_build_tools(family: BuilderFamily, clone_sources: bool) -> Result<()> {
    check_required_tools(&build_tools(family, clone_sources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure_lists_all() {
        let tools = &[("sh", "dash"), ("nonexistent_command_xyz", "fake-package"), ("nonexistent_abc", "other")];
        let err = check_required_tools(tools).unwrap_err().to_string();
        assert!(err.contains("nonexistent_command_xyz (install: fake-package)"));
        assert!(err.contains("nonexistent_abc (install: other)"));
        assert!(!err.contains("dash"));
    }

    #[test]
    fn test_build_tools_per_family() {
        assert_eq!(
            build_tools(BuilderFamily::Debian, false),
            vec![("docker", "docker"), ("dpkg-deb", "dpkg")]
        );
        assert_eq!(
            build_tools(BuilderFamily::Centos, true),
            vec![("docker", "docker"), ("rpm2cpio", "rpm2cpio"), ("cpio", "cpio"), ("git", "git")]
        );
        assert!(build_tools(BuilderFamily::Flatcar, false).contains(&("mount", "util-linux")));
    }
}
