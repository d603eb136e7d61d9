//! Tag selection for dependency references.

use crate::reference::{OCIReference, VersionRanges, parse_semver};
use crate::registry::Registry;
use crate::types::{PorterError, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The highest tag satisfying `ranges`. Tags that are not semver are ignored.
pub fn highest_matching_tag(
    tags: &[String],
    ranges: &VersionRanges,
    allow_prereleases: bool,
) -> Option<String> {
    tags.iter()
        .filter_map(|t| parse_semver(t).map(|v| (v, t)))
        .filter(|(v, _)| ranges.matches(v, allow_prereleases))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, t)| t.clone())
}

/// Tag used when a reference names only a repository: the highest release
/// tag, else `latest`.
pub fn default_tag(reference: &OCIReference, tags: &[String]) -> Result<String> {
    let highest = tags
        .iter()
        .filter_map(|t| parse_semver(t).map(|v| (v, t)))
        .filter(|(v, _)| v.pre.is_empty())
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, t)| t.clone());
    if let Some(tag) = highest {
        return Ok(tag);
    }
    if tags.iter().any(|t| t == "latest") {
        return Ok("latest".to_string());
    }
    Err(PorterError::UnresolvedDependency(format!(
        "no tag was specified for {reference} and none of the tags defined in the registry \
         meet the criteria: semver formatted or 'latest'"
    )))
}

/// List the repository's tags, honoring `cancel`.
pub async fn list_tags(
    registry: &dyn Registry,
    reference: &OCIReference,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let tags = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(PorterError::Canceled),
        tags = registry.list_tags(reference) => tags?,
    };
    debug!(repository = %reference.repository_only(), count = tags.len(), "listed tags");
    Ok(tags)
}

/// Pin a repository-only reference to its default tag; anything more
/// specific is returned as is.
pub async fn pin_reference(
    registry: &dyn Registry,
    reference: &OCIReference,
    cancel: &CancellationToken,
) -> Result<OCIReference> {
    if !reference.is_repository_only() {
        return Ok(reference.clone());
    }
    let tags = list_tags(registry, reference, cancel).await?;
    let tag = default_tag(reference, &tags)?;
    reference.with_tag(&tag)
}
