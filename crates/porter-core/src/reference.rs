//! # OCI References
//!
//! Parsing, validation and normalisation of bundle and image coordinates.
//!
//! A reference is normalised on parse (`alpine` becomes
//! `docker.io/library/alpine`) and printed in its familiar form, so
//! `parse(r.to_string()) == r` holds for every parsed reference.
//!
//! ## Shapes
//!
//! | Shape | Example |
//! |-------|---------|
//! | repository-only | `getporter/mysql` |
//! | tagged | `getporter/mysql:v0.1.0` |
//! | digested | `getporter/mysql@sha256:…` |
//! | tagged+digested | `getporter/mysql:v0.1.0@sha256:…` |
//!
//! A tag that parses as semver, with or without a leading `v`, is also a
//! version.

use crate::types::{PorterError, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Registry used when the reference does not name one.
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Legacy alias of the default registry.
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";

/// Namespace prefixed onto single-component Docker Hub repositories.
const OFFICIAL_REPO_PREFIX: &str = "library/";

/// Longest accepted repository name.
const MAX_NAME_LENGTH: usize = 255;

/// Compile `pattern` once into `cell`.
///
/// Patterns are literals, so a compile failure is reported as a validation
/// error instead of aborting the process.
pub(crate) fn cached_regex(
    cell: &'static OnceLock<std::result::Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| PorterError::Validation(format!("invalid pattern {pattern:?}: {e}")))
}

fn domain_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    cached_regex(
        &RE,
        r"^(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*(?::[0-9]+)?$",
    )
}

fn path_component_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    cached_regex(&RE, r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$")
}

fn tag_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    cached_regex(&RE, r"^[\w][\w.-]{0,127}$")
}

fn digest_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    cached_regex(
        &RE,
        r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$",
    )
}

// =============================================================================
// OCI REFERENCE
// =============================================================================

/// A parsed, normalised OCI reference.
///
/// Value-semantic: `with_tag`, `with_digest` and `with_version` return a new
/// reference and leave the receiver untouched.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OCIReference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl OCIReference {
    /// Parse and normalise a reference string.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| PorterError::InvalidReference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid("reference is empty"));
        }

        let (remainder, digest) = match trimmed.split_once('@') {
            Some((name, digest)) => {
                validate_digest(s, digest)?;
                (name, Some(digest.to_string()))
            }
            None => (trimmed, None),
        };

        // The tag is whatever follows the last colon after the last slash.
        let last_slash = remainder.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], Some(remainder[split + 1..].to_string()))
            }
            None => (remainder, None),
        };

        if let Some(t) = &tag
            && !tag_regex()?.is_match(t)
        {
            return Err(invalid(&format!("invalid tag {t:?}")));
        }

        if name.is_empty() {
            return Err(invalid("repository name is empty"));
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(invalid("repository name must not be more than 255 characters"));
        }

        let (mut domain, mut path) = split_docker_domain(name);
        if domain == LEGACY_DEFAULT_DOMAIN {
            domain = DEFAULT_DOMAIN.to_string();
        }
        if domain == DEFAULT_DOMAIN && !path.contains('/') {
            path = format!("{OFFICIAL_REPO_PREFIX}{path}");
        }

        if !domain_regex()?.is_match(&domain) {
            return Err(invalid(&format!("invalid registry {domain:?}")));
        }
        if path.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("repository name must be lowercase"));
        }
        for component in path.split('/') {
            if !path_component_regex()?.is_match(component) {
                return Err(invalid(&format!("invalid repository component {component:?}")));
            }
        }

        Ok(Self {
            domain,
            path,
            tag,
            digest,
        })
    }

    /// The registry host, e.g. `docker.io` or `localhost:5000`.
    pub fn registry(&self) -> &str {
        &self.domain
    }

    /// The repository in familiar form, e.g. `getporter/mysql` or `alpine`.
    pub fn repository(&self) -> String {
        familiar_name(&self.domain, &self.path)
    }

    /// The repository path without the registry, normalised (`library/alpine`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, if any.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn has_tag(&self) -> bool {
        self.tag.is_some()
    }

    pub fn has_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// True when the reference carries neither tag nor digest.
    pub fn is_repository_only(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// True when the tag parses as a semantic version.
    pub fn has_version(&self) -> bool {
        self.version().is_some()
    }

    /// The semantic version encoded in the tag.
    pub fn version(&self) -> Option<semver::Version> {
        self.tag.as_deref().and_then(parse_semver)
    }

    /// A copy of the reference carrying `tag`, replacing any previous tag.
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        if !tag_regex()?.is_match(tag) {
            return Err(PorterError::InvalidReference {
                reference: format!("{}:{}", self.repository(), tag),
                reason: format!("invalid tag {tag:?}"),
            });
        }
        let mut next = self.clone();
        next.tag = Some(tag.to_string());
        Ok(next)
    }

    /// A copy of the reference pinned to `digest`.
    pub fn with_digest(&self, digest: &str) -> Result<Self> {
        validate_digest(&format!("{}@{}", self.repository(), digest), digest)?;
        let mut next = self.clone();
        next.digest = Some(digest.to_string());
        Ok(next)
    }

    /// A copy of the reference tagged `v<version>`.
    pub fn with_version(&self, version: &str) -> Result<Self> {
        let version = version.trim_start_matches('v');
        if parse_semver(version).is_none() {
            return Err(PorterError::InvalidReference {
                reference: self.to_string(),
                reason: format!("{version:?} is not a semantic version"),
            });
        }
        self.with_tag(&format!("v{version}"))
    }

    /// The repository without tag or digest.
    pub fn repository_only(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            path: self.path.clone(),
            tag: None,
            digest: None,
        }
    }
}

impl fmt::Display for OCIReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", familiar_name(&self.domain, &self.path))?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for OCIReference {
    type Err = PorterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for OCIReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OCIReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Split a name into registry and path the way the Docker CLI does.
fn split_docker_domain(name: &str) -> (String, String) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.')
                || first.contains(':')
                || first == "localhost"
                || first.chars().any(|c| c.is_ascii_uppercase()) =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    }
}

fn familiar_name(domain: &str, path: &str) -> String {
    if domain == DEFAULT_DOMAIN {
        let short = path.strip_prefix(OFFICIAL_REPO_PREFIX).unwrap_or(path);
        if short.contains('/') {
            path.to_string()
        } else {
            short.to_string()
        }
    } else {
        format!("{domain}/{path}")
    }
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    let invalid = |reason: String| PorterError::InvalidDigest {
        reference: reference.to_string(),
        reason,
    };
    if !digest_regex()?.is_match(digest) {
        return Err(invalid(format!("{digest:?} is not a valid digest")));
    }
    if let Some(hexpart) = digest.strip_prefix("sha256:")
        && hexpart.len() != 64
    {
        return Err(invalid(format!(
            "sha256 digest must be 64 hex characters, got {}",
            hexpart.len()
        )));
    }
    Ok(())
}

/// Parse a semantic version leniently: an optional leading `v` and missing
/// minor or patch components are accepted (`v1.2` is `1.2.0`).
pub fn parse_semver(s: &str) -> Option<semver::Version> {
    let s = s.strip_prefix('v').unwrap_or(s);
    if let Ok(v) = semver::Version::parse(s) {
        return Some(v);
    }

    let split = s.find(['-', '+']).unwrap_or(s.len());
    let (core, suffix) = s.split_at(split);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }
    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    semver::Version::parse(&format!("{padded}{suffix}")).ok()
}

/// A set of alternative semver constraints joined by `||`.
///
/// A bare version (`1.0.0`) is an exact match. Prerelease versions only
/// match when `allow_prereleases` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRanges {
    alternatives: Vec<semver::VersionReq>,
}

impl VersionRanges {
    pub fn parse(ranges: &str) -> Result<Self> {
        let mut alternatives = Vec::new();
        for alt in ranges.split("||").map(str::trim).filter(|a| !a.is_empty()) {
            let exact = alt.starts_with(|c: char| c.is_ascii_digit())
                && !alt.contains(['x', 'X', '*', ',', ' ']);
            let normalized = if exact { format!("={alt}") } else { alt.to_string() };
            let req = semver::VersionReq::parse(&normalized).map_err(|e| {
                PorterError::Validation(format!("invalid version constraint {alt:?}: {e}"))
            })?;
            alternatives.push(req);
        }
        if alternatives.is_empty() {
            return Err(PorterError::Validation(format!(
                "invalid version constraint {ranges:?}: no ranges"
            )));
        }
        Ok(Self { alternatives })
    }

    pub fn matches(&self, version: &semver::Version, allow_prereleases: bool) -> bool {
        if !version.pre.is_empty() && !allow_prereleases {
            return false;
        }
        let release = semver::Version::new(version.major, version.minor, version.patch);
        self.alternatives
            .iter()
            .any(|req| req.matches(version) || (allow_prereleases && req.matches(&release)))
    }

    /// True when any alternative names a prerelease explicitly.
    pub fn mentions_prerelease(&self) -> bool {
        self.alternatives
            .iter()
            .any(|req| req.comparators.iter().any(|c| !c.pre.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:8b06c3da72dc9fa7002b9bc1f73a7421b4287c9cf0d3b08633287473707f9a63";

    #[test]
    fn official_image_is_normalised() {
        let r = OCIReference::parse("alpine").expect("parse");
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.path(), "library/alpine");
        assert_eq!(r.repository(), "alpine");
        assert_eq!(r.to_string(), "alpine");
        assert!(r.is_repository_only());
    }

    #[test]
    fn familiar_form_drops_default_registry() {
        let r = OCIReference::parse("docker.io/getporter/mysql:v0.1.0").expect("parse");
        assert_eq!(r.to_string(), "getporter/mysql:v0.1.0");
        let legacy = OCIReference::parse("index.docker.io/library/alpine:3").expect("parse");
        assert_eq!(legacy.to_string(), "alpine:3");
    }

    #[test]
    fn custom_registry_with_port() {
        let r = OCIReference::parse("localhost:5000/myorg/app:1.0").expect("parse");
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "localhost:5000/myorg/app");
        assert_eq!(r.tag(), Some("1.0"));
    }

    #[test]
    fn tagged_and_digested() {
        let s = format!("ghcr.io/getporter/hello:v1.0.0@{DIGEST}");
        let r = OCIReference::parse(&s).expect("parse");
        assert_eq!(r.tag(), Some("v1.0.0"));
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(r.to_string(), s);
    }

    #[test]
    fn malformed_digest_is_distinguished() {
        let err = OCIReference::parse("getporter/hello@sha256:abc").expect_err("bad digest");
        assert!(matches!(err, PorterError::InvalidDigest { .. }));
    }

    #[test]
    fn malformed_name_is_invalid_reference() {
        for bad in ["", "Getporter/Hello", "getporter/hello:", "getporter//hello"] {
            let err = OCIReference::parse(bad).expect_err(bad);
            assert!(matches!(err, PorterError::InvalidReference { .. }), "{bad}");
        }
    }

    #[test]
    fn versions() {
        let r = OCIReference::parse("getporter/mysql:v1.2.3").expect("parse");
        assert_eq!(r.version(), Some(semver::Version::new(1, 2, 3)));
        let latest = OCIReference::parse("getporter/mysql:latest").expect("parse");
        assert!(!latest.has_version());
        let pinned = latest.with_version("0.2.0").expect("version");
        assert_eq!(pinned.tag(), Some("v0.2.0"));
        assert_eq!(latest.tag(), Some("latest"));
    }

    #[test]
    fn lenient_semver() {
        assert_eq!(parse_semver("v1.2"), Some(semver::Version::new(1, 2, 0)));
        assert_eq!(parse_semver("3"), Some(semver::Version::new(3, 0, 0)));
        assert!(parse_semver("1.2.0-beta.1").is_some_and(|v| !v.pre.is_empty()));
        assert_eq!(parse_semver("latest"), None);
    }

    #[test]
    fn version_ranges() {
        let ranges = VersionRanges::parse("1.0.0-alpha.1 || 1.0.0").expect("ranges");
        assert!(ranges.matches(&semver::Version::new(1, 0, 0), false));
        assert!(!ranges.matches(&semver::Version::new(1, 0, 1), false));
        assert!(ranges.mentions_prerelease());
        let pre = parse_semver("1.0.0-alpha.1").expect("pre");
        assert!(ranges.matches(&pre, true));
        assert!(!ranges.matches(&pre, false));

        let caret = VersionRanges::parse("^5.7").expect("caret");
        assert!(caret.matches(&semver::Version::new(5, 9, 1), false));
        assert!(!caret.matches(&semver::Version::new(6, 0, 0), false));
        assert!(VersionRanges::parse("").is_err());
    }

    #[test]
    fn with_digest_validates() {
        let r = OCIReference::parse("getporter/hello:v1").expect("parse");
        assert!(r.with_digest("nope").is_err());
        let pinned = r.with_digest(DIGEST).expect("digest");
        assert!(pinned.has_digest());
        assert!(!r.has_digest());
    }

    #[test]
    fn json_round_trip() {
        let r = OCIReference::parse("getporter/hello:v1.0.0").expect("parse");
        let json = serde_json::to_string(&r).expect("encode");
        assert_eq!(json, "\"getporter/hello:v1.0.0\"");
        let back: OCIReference = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, r);
    }
}
