//! npm registry client: resolves package specs to concrete versions.
//!
//! Not on the script-execution hot path (`bun install` resolves packages
//! itself); used for pre-flight validation and tooling.

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::resolver::{parse_constraint, NoMatchingVersion};

const REGISTRY_URL: &str = "https://registry.npmjs.org";

#[derive(Debug, Error)]
#[error("package not found: {0}")]
pub struct PackageNotFound(pub String);

/// npm package metadata (subset).
#[derive(Debug, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: HashMap<String, String>,
    #[serde(default)]
    pub versions: HashMap<String, PackageVersion>,
}

#[derive(Debug, Deserialize)]
pub struct PackageVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// npm registry lookups.
pub struct Registry {
    base_url: String,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let base_url = std::env::var("BUNS_NPM_REGISTRY")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| REGISTRY_URL.to_string());
        Self { base_url }
    }

    /// Resolve `name@constraint` to `(name, concrete version)`.
    pub fn resolve_version(&self, spec: &str) -> Result<(String, String)> {
        let (name, constraint) = parse_package_spec(spec);

        let info = self.fetch_package(&name)?;
        let version = resolve_constraint(&info, &constraint)?;

        Ok((name, version))
    }

    /// Existence pre-flight for a package name.
    pub fn validate_package(&self, name: &str) -> Result<()> {
        self.fetch_package(name).map(|_| ())
    }

    fn fetch_package(&self, name: &str) -> Result<PackageInfo> {
        let url = format!("{}/{}", self.base_url, name);

        let response = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(30))
            .build()
            .get(&url)
            .set("User-Agent", "buns-cli")
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(404, _) => anyhow!(PackageNotFound(name.to_string())),
                ureq::Error::Status(code, _) => {
                    anyhow!("npm registry returned {code} for {name}")
                }
                ureq::Error::Transport(t) => {
                    anyhow!("failed to fetch package {name}: {t}")
                }
            })?;

        response
            .into_json()
            .with_context(|| format!("failed to parse package info for {name}"))
    }
}

/// Pick the version of `info` matching `constraint`.
fn resolve_constraint(info: &PackageInfo, constraint: &str) -> Result<String> {
    if constraint.is_empty() {
        return info
            .dist_tags
            .get("latest")
            .cloned()
            .ok_or_else(|| anyhow!("no latest version found for {}", info.name));
    }

    let req = match parse_constraint(constraint) {
        Ok(req) => req,
        Err(e) => {
            // Not a semver range; a literal key in `versions` is a pin
            // (dist tags and odd-but-published version strings).
            if info.versions.contains_key(constraint) {
                return Ok(constraint.to_string());
            }
            return Err(e);
        }
    };

    let allow_prerelease = constraint.contains('-');
    let mut candidates: Vec<Version> = info
        .versions
        .keys()
        .filter_map(|s| Version::parse(s).ok())
        .filter(|v| allow_prerelease || v.pre.is_empty())
        .collect();

    candidates.sort_by(|a, b| b.cmp(a));

    candidates
        .into_iter()
        .find(|v| req.matches(v))
        .map(|v| v.to_string())
        .ok_or_else(|| {
            anyhow!(NoMatchingVersion(constraint.to_string()))
                .context(format!("no version of {} satisfies '{constraint}'", info.name))
        })
}

/// Split `name@constraint` into name and constraint. Scoped packages keep
/// their leading `@`, so the separator is the last `@` for those and the
/// first otherwise.
pub fn parse_package_spec(spec: &str) -> (String, String) {
    if let Some(rest) = spec.strip_prefix('@') {
        if let Some(idx) = rest.rfind('@') {
            let split = idx + 1;
            return (spec[..split].to_string(), spec[split + 1..].to_string());
        }
        return (spec.to_string(), String::new());
    }

    match spec.find('@') {
        Some(idx) if idx > 0 => (spec[..idx].to_string(), spec[idx + 1..].to_string()),
        _ => (spec.to_string(), String::new()),
    }
}
