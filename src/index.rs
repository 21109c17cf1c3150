//! Cached index of available Bun versions, refreshed from GitHub releases.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use semver::Version;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use crate::resolver::VersionSource;

const GITHUB_RELEASES_URL: &str = "https://api.github.com/repos/oven-sh/bun/releases";

/// How long the cached version list stays fresh.
fn cache_ttl() -> chrono::Duration {
    chrono::Duration::hours(24)
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^bun-v(\d+\.\d+\.\d+)$").expect("version regex is valid"))
}

/// A release entry from the GitHub API.
#[derive(Debug, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
}

/// Manages the cached Bun version index.
pub struct Index {
    cache_dir: PathBuf,
    releases_url: String,
}

impl Index {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let releases_url = std::env::var("BUNS_RELEASES_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| GITHUB_RELEASES_URL.to_string());
        Self { cache_dir: cache_dir.into(), releases_url }
    }

    #[cfg(test)]
    fn with_releases_url(cache_dir: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self { cache_dir: cache_dir.into(), releases_url: url.into() }
    }

    /// Available Bun versions, descending. Uses the cached list when it is
    /// younger than 24 hours, refreshing from GitHub otherwise. A failed
    /// refresh falls back to any cached list.
    pub fn versions(&self) -> Result<Vec<Version>> {
        if let Ok(cached) = self.load_cached_versions() {
            if !self.is_cache_stale() {
                return Ok(cached);
            }
        }

        match self.fetch_versions() {
            Ok(versions) => {
                // Persisting the refreshed index is best-effort.
                if let Err(e) = self.cache_versions(&versions) {
                    tracing::debug!("failed to persist version index: {e:#}");
                }
                Ok(versions)
            }
            Err(fetch_err) => {
                if let Ok(cached) = self.load_cached_versions() {
                    tracing::warn!("index refresh failed, using cached versions: {fetch_err:#}");
                    return Ok(cached);
                }
                Err(fetch_err.context(
                    "failed to fetch Bun index from GitHub; run with network access to initialize the index cache",
                ))
            }
        }
    }

    fn fetch_versions(&self) -> Result<Vec<Version>> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(30))
            .build();

        let response = agent
            .get(&self.releases_url)
            .set("Accept", "application/vnd.github.v3+json")
            .set("User-Agent", "buns-cli")
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => anyhow!("GitHub API returned {code}"),
                ureq::Error::Transport(t) => anyhow!("cannot reach GitHub: {t}"),
            })?;

        let releases: Vec<Release> = response
            .into_json()
            .context("failed to parse GitHub releases response")?;

        Ok(versions_from_releases(&releases))
    }

    fn load_cached_versions(&self) -> Result<Vec<Version>> {
        let data = fs::read(self.versions_file()).context("no cached index available")?;
        let strings: Vec<String> =
            serde_json::from_slice(&data).context("corrupt version index cache")?;

        Ok(strings
            .iter()
            .filter_map(|s| Version::parse(s).ok())
            .collect())
    }

    fn cache_versions(&self, versions: &[Version]) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;

        let strings: Vec<String> = versions.iter().map(Version::to_string).collect();
        fs::write(self.versions_file(), serde_json::to_vec(&strings)?)?;
        fs::write(self.timestamp_file(), Utc::now().to_rfc3339())?;
        Ok(())
    }

    fn is_cache_stale(&self) -> bool {
        let Ok(data) = fs::read_to_string(self.timestamp_file()) else {
            return true;
        };
        let Ok(fetched_at) = DateTime::parse_from_rfc3339(data.trim()) else {
            return true;
        };
        Utc::now().signed_duration_since(fetched_at) > cache_ttl()
    }

    fn versions_file(&self) -> PathBuf {
        self.cache_dir.join("bun-versions.json")
    }

    fn timestamp_file(&self) -> PathBuf {
        self.cache_dir.join("fetched_at")
    }
}

impl VersionSource for Index {
    fn versions(&self) -> Result<Vec<Version>> {
        Index::versions(self)
    }
}

/// Extract stable versions from a release listing, sorted descending.
///
/// Draft and prerelease entries are skipped, and the tag must match the
/// stable form exactly: canary tags like `bun-v1.2.0-canary.1` carry a
/// suffix the expression rejects, which is why prerelease filtering works
/// on the tag rather than the semver prerelease field.
fn versions_from_releases(releases: &[Release]) -> Vec<Version> {
    let mut versions: Vec<Version> = releases
        .iter()
        .filter(|r| !r.draft && !r.prerelease)
        .filter_map(|r| {
            let caps = version_regex().captures(&r.tag_name)?;
            Version::parse(&caps[1]).ok()
        })
        .collect();

    versions.sort_by(|a, b| b.cmp(a));
    versions
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn release(tag: &str, prerelease: bool, draft: bool) -> Release {
        Release { tag_name: tag.to_string(), prerelease, draft }
    }

    #[test]
    fn tag_regex_matches_stable_tags_only() {
        struct Case {
            tag: &'static str,
            want: Option<&'static str>,
        }

        let cases = [
            Case { tag: "bun-v1.1.34", want: Some("1.1.34") },
            Case { tag: "bun-v1.0.0", want: Some("1.0.0") },
            Case { tag: "bun-v2.0.0", want: Some("2.0.0") },
            Case { tag: "bun-v1.2.0-canary.1", want: None },
            Case { tag: "v1.1.34", want: None },
            Case { tag: "bun-1.1.34", want: None },
            Case { tag: "bun-v1.1", want: None },
        ];

        for case in cases {
            let got = version_regex()
                .captures(case.tag)
                .map(|c| c[1].to_string());
            assert_eq!(got.as_deref(), case.want, "{}", case.tag);
        }
    }

    #[test]
    fn filters_and_sorts_releases() {
        let releases = [
            release("bun-v1.1.33", false, false),
            release("bun-v1.2.0-canary.1", true, false),
            release("bun-v1.1.34", false, false),
            release("bun-v9.9.9", false, true),
            release("bun-v1.0.0", false, false),
            release("not-a-bun-tag", false, false),
        ];

        let versions = versions_from_releases(&releases);
        let strings: Vec<String> = versions.iter().map(Version::to_string).collect();
        assert_eq!(strings, vec!["1.1.34", "1.1.33", "1.0.0"]);
    }

    #[test]
    fn cache_round_trips() {
        let tmp = TempDir::new().unwrap();
        let idx = Index::with_releases_url(tmp.path(), "http://unused.invalid");

        let versions = vec![
            Version::parse("1.1.34").unwrap(),
            Version::parse("1.1.33").unwrap(),
        ];
        idx.cache_versions(&versions).unwrap();

        let loaded = idx.load_cached_versions().unwrap();
        assert_eq!(loaded, versions);
        assert!(!idx.is_cache_stale());
    }

    #[test]
    fn fresh_cache_short_circuits_fetch() {
        let tmp = TempDir::new().unwrap();
        // The URL is unreachable; a fresh cache must keep us off the network.
        let idx = Index::with_releases_url(tmp.path(), "http://127.0.0.1:1/releases");

        let versions = vec![Version::parse("1.1.34").unwrap()];
        idx.cache_versions(&versions).unwrap();

        assert_eq!(idx.versions().unwrap(), versions);
    }

    #[test]
    fn stale_cache_survives_fetch_failure() {
        let tmp = TempDir::new().unwrap();
        let idx = Index::with_releases_url(tmp.path(), "http://127.0.0.1:1/releases");

        let versions = vec![Version::parse("1.1.34").unwrap()];
        idx.cache_versions(&versions).unwrap();

        // Age the timestamp past the TTL.
        let old = (Utc::now() - chrono::Duration::hours(25)).to_rfc3339();
        fs::write(idx.timestamp_file(), old).unwrap();
        assert!(idx.is_cache_stale());

        assert_eq!(idx.versions().unwrap(), versions);
    }

    #[test]
    fn no_cache_and_no_network_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let idx = Index::with_releases_url(tmp.path(), "http://127.0.0.1:1/releases");
        assert!(idx.versions().is_err());
    }

    #[test]
    fn staleness_edges() {
        let tmp = TempDir::new().unwrap();
        let idx = Index::with_releases_url(tmp.path(), "http://unused.invalid");

        assert!(idx.is_cache_stale(), "missing timestamp is stale");

        fs::create_dir_all(tmp.path()).unwrap();
        fs::write(idx.timestamp_file(), Utc::now().to_rfc3339()).unwrap();
        assert!(!idx.is_cache_stale(), "fresh timestamp is not stale");

        let old = (Utc::now() - chrono::Duration::hours(25)).to_rfc3339();
        fs::write(idx.timestamp_file(), old).unwrap();
        assert!(idx.is_cache_stale(), "old timestamp is stale");

        fs::write(idx.timestamp_file(), "not-a-timestamp").unwrap();
        assert!(idx.is_cache_stale(), "garbage timestamp is stale");
    }
}
