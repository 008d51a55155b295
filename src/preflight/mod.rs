//! Preflight checks for build validation.
//!
//! Validates that the host has the tools a pipeline will invoke before any
//! stage starts, instead of failing halfway through a build.
//!
//! # Example
//!
//! ```rust
//! use sandbox_assembler::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("git") {
//!     println!("git not installed");
//! }
//!
//! let tools = &[("git", "git"), ("docker", "docker.io")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::error::{AssemblyError, Result};
use crate::pipeline::plan::StagePlan;

/// Check if a command exists on the host's `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools the plan will call, as (command, package) pairs.
pub fn required_tools(plan: &StagePlan) -> Vec<(&'static str, &'static str)> {
    let mut tools = Vec::new();
    if plan.needs_git() {
        tools.push(("git", "git"));
    }
    if plan.needs_docker() {
        tools.push(("docker", "docker"));
    }
    tools
}

/// Check that specific tools are available.
///
/// Returns a configuration error listing every missing tool and the package
/// that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {tool} (install: {package})"))
        .collect();

    if !missing.is_empty() {
        return Err(AssemblyError::Config(format!(
            "Missing required host tools:\n{}",
            missing.join("\n")
        )));
    }
    Ok(())
}

/// Check every tool the plan needs, plus the installer program if any.
pub fn check_plan(plan: &StagePlan) -> Result<()> {
    check_required_tools(&required_tools(plan))?;
    if let Some(program) = plan.install.as_ref().and_then(|install| install.program.first()) {
        if !program.contains('/') && !command_exists(program) {
            return Err(AssemblyError::Config(format!(
                "installer program '{program}' not found on PATH"
            )));
        }
    }
    Ok(())
}
