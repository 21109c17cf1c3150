//! Dependency installation: synthesizes a package.json and runs `bun install`.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::npm::parse_package_spec;

/// Install `packages` into `deps_dir` using the given Bun binary.
///
/// The directory is not rolled back on failure: a later cache-miss retry
/// observes whatever partial state `bun install` left behind.
pub fn install(bun_path: &Path, deps_dir: &Path, packages: &[String], quiet: bool) -> Result<()> {
    fs::create_dir_all(deps_dir)
        .with_context(|| format!("failed to create {}", deps_dir.display()))?;

    let manifest = build_manifest(packages);
    let manifest_path = deps_dir.join("package.json");
    fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;

    let mut cmd = Command::new(bun_path);
    cmd.arg("install").current_dir(deps_dir);
    if quiet {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let status = cmd
        .status()
        .with_context(|| format!("failed to run {} install", bun_path.display()))?;

    if !status.success() {
        bail!("bun install exited with {}", status.code().unwrap_or(-1));
    }

    Ok(())
}

/// Minimal project manifest declaring each package as a dependency.
/// Duplicate names collapse to one entry; an empty constraint becomes `*`.
fn build_manifest(packages: &[String]) -> serde_json::Value {
    let mut deps = BTreeMap::new();
    for spec in packages {
        let (name, constraint) = parse_package_spec(spec);
        let constraint = if constraint.is_empty() { "*".to_string() } else { constraint };
        deps.insert(name, constraint);
    }

    serde_json::json!({
        "name": "buns-deps",
        "private": true,
        "dependencies": deps,
    })
}
