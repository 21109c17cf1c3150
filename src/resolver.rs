//! Bun version resolution over a version source.

use anyhow::{bail, Context, Result};
use semver::{Version, VersionReq};
use thiserror::Error;

/// Returned when a constraint parses but nothing in the index satisfies it.
#[derive(Debug, Error)]
#[error("no Bun version satisfies constraint '{0}'")]
pub struct NoMatchingVersion(pub String);

/// Provides available Bun versions, sorted descending.
pub trait VersionSource {
    fn versions(&self) -> Result<Vec<Version>>;
}

/// Resolves semver constraints against a version source.
pub struct Resolver<S: VersionSource> {
    source: S,
}

impl<S: VersionSource> Resolver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Highest version matching `constraint`. An empty constraint returns
    /// the latest version.
    pub fn resolve(&self, constraint: &str) -> Result<Version> {
        let versions = self.source.versions()?;

        if versions.is_empty() {
            bail!("no Bun versions available");
        }

        if constraint.is_empty() {
            return Ok(versions[0].clone());
        }

        let req = parse_constraint(constraint)?;

        // Versions are sorted descending, so the first match is the highest.
        versions
            .into_iter()
            .find(|v| req.matches(v))
            .ok_or_else(|| NoMatchingVersion(constraint.to_string()).into())
    }

    /// Exact version lookup: succeeds only when `version` is present.
    pub fn resolve_exact(&self, version: &str) -> Result<Version> {
        let wanted = Version::parse(version)
            .with_context(|| format!("invalid version '{version}'"))?;

        let versions = self.source.versions()?;
        versions
            .into_iter()
            .find(|v| *v == wanted)
            .ok_or_else(|| NoMatchingVersion(version.to_string()).into())
    }
}

/// Parse an npm-style constraint. A bare version (`1.1.33`) pins exactly,
/// unlike `VersionReq`'s default caret interpretation.
pub fn parse_constraint(constraint: &str) -> Result<VersionReq> {
    let trimmed = constraint.trim();

    if Version::parse(trimmed).is_ok() {
        return VersionReq::parse(&format!("={trimmed}"))
            .with_context(|| format!("invalid version constraint '{constraint}'"));
    }

    VersionReq::parse(trimmed)
        .with_context(|| format!("invalid version constraint '{constraint}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSource {
        versions: Vec<Version>,
        fail: bool,
    }

    impl VersionSource for StubSource {
        fn versions(&self) -> Result<Vec<Version>> {
            if self.fail {
                bail!("network error");
            }
            Ok(self.versions.clone())
        }
    }

    fn stub() -> Resolver<StubSource> {
        let versions = ["1.1.34", "1.1.33", "1.1.32", "1.1.0", "1.0.0"]
            .iter()
            .map(|s| Version::parse(s).unwrap())
            .collect();
        Resolver::new(StubSource { versions, fail: false })
    }

    #[test]
    fn resolves_constraints() {
        struct Case {
            name: &'static str,
            constraint: &'static str,
            want: Option<&'static str>,
        }

        let cases = [
            Case { name: "empty constraint returns latest", constraint: "", want: Some("1.1.34") },
            Case { name: "bare version pins exactly", constraint: "1.1.33", want: Some("1.1.33") },
            Case { name: "caret takes highest compatible", constraint: "^1.1.0", want: Some("1.1.34") },
            Case { name: "tilde takes highest patch", constraint: "~1.1.32", want: Some("1.1.34") },
            Case { name: "greater or equal", constraint: ">=1.1.0", want: Some("1.1.34") },
            Case { name: "strictly greater", constraint: ">1.1.32", want: Some("1.1.34") },
            Case { name: "less than", constraint: "<1.1.0", want: Some("1.0.0") },
            Case { name: "range takes highest in range", constraint: ">=1.1.0, <1.1.34", want: Some("1.1.33") },
            Case { name: "unsatisfiable range", constraint: ">=2.0.0", want: None },
            Case { name: "invalid constraint", constraint: "not-a-version", want: None },
        ];

        let resolver = stub();
        for case in cases {
            let got = resolver.resolve(case.constraint);
            match case.want {
                Some(want) => {
                    assert_eq!(got.unwrap().to_string(), want, "{}", case.name);
                }
                None => assert!(got.is_err(), "{}: expected error", case.name),
            }
        }
    }

    #[test]
    fn unsatisfiable_constraint_carries_typed_error() {
        let err = stub().resolve(">=2.0.0").unwrap_err();
        let no_match = err
            .downcast_ref::<NoMatchingVersion>()
            .expect("expected NoMatchingVersion");
        assert_eq!(no_match.0, ">=2.0.0");
    }

    #[test]
    fn source_failure_propagates() {
        let resolver = Resolver::new(StubSource { versions: vec![], fail: true });
        assert!(resolver.resolve("").is_err());
    }

    #[test]
    fn empty_version_list_is_fatal() {
        let resolver = Resolver::new(StubSource { versions: vec![], fail: false });
        assert!(resolver.resolve("").is_err());
    }

    #[test]
    fn resolve_exact_requires_presence() {
        let resolver = stub();
        assert_eq!(resolver.resolve_exact("1.1.33").unwrap().to_string(), "1.1.33");
        assert!(resolver.resolve_exact("1.1.99").is_err());
        assert!(resolver.resolve_exact("nonsense").is_err());
    }
}
