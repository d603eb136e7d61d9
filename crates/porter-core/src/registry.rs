//! # Registry Access
//!
//! Pulls bundles published in the CNAB-to-OCI layout and lists repository
//! tags.
//!
//! A published bundle is an image index. The entry annotated
//! `io.cnab.manifest.type=config` points at an image manifest whose config
//! blob is the `bundle.json` descriptor. Images the bundle references are
//! copied into the bundle's repository, so the relocation map sends each
//! original image to `<bundle repository>@<content digest>`.
//!
//! `BundleResolver` puts the bundle cache in front of a registry.

use crate::bundle::ExtendedBundle;
use crate::cache::{BundleCache, BundleReference, CachedBundle, RelocationMapping};
use crate::reference::OCIReference;
use crate::types::{PorterError, Result};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Annotation naming the role of each manifest in a bundle's image index.
pub const CNAB_MANIFEST_TYPE_ANNOTATION: &str = "io.cnab.manifest.type";
/// Role of the manifest carrying `bundle.json` as its config blob.
pub const CNAB_MANIFEST_TYPE_CONFIG: &str = "config";

/// Tags requested per page when listing a repository.
pub const TAG_PAGE_SIZE: usize = 100;

/// Every tag of a paginated listing.
///
/// `fetch` receives the last tag seen so far and returns the next page.
/// Listing stops at a short or empty page, or when the registry repeats
/// the previous page.
pub async fn collect_tag_pages<F, Fut>(page_size: usize, mut fetch: F) -> Result<Vec<String>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<String>>>,
{
    let mut tags = Vec::new();
    let mut last: Option<String> = None;
    loop {
        let page = fetch(last.clone()).await?;
        let Some(next) = page.last().cloned() else {
            break;
        };
        if last.as_ref() == Some(&next) {
            break;
        }
        let full = page.len() >= page_size;
        tags.extend(page);
        if !full {
            break;
        }
        last = Some(next);
    }
    Ok(tags)
}

/// A registry holding published bundles.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Every tag of the reference's repository.
    async fn list_tags(&self, reference: &OCIReference) -> Result<Vec<String>>;

    /// Pull the bundle descriptor and its relocation map.
    async fn pull_bundle(&self, reference: &OCIReference) -> Result<BundleReference>;
}

// =============================================================================
// OCI REGISTRY
// =============================================================================

/// Registry client over the OCI distribution API.
pub struct OciRegistry {
    client: Client,
    auth: RegistryAuth,
}

impl std::fmt::Debug for OciRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciRegistry").finish_non_exhaustive()
    }
}

impl Default for OciRegistry {
    fn default() -> Self {
        Self::new(false)
    }
}

impl OciRegistry {
    /// A client with anonymous auth. `insecure` talks plain HTTP.
    pub fn new(insecure: bool) -> Self {
        let protocol = if insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        Self {
            client: Client::new(ClientConfig {
                protocol,
                ..Default::default()
            }),
            auth: RegistryAuth::Anonymous,
        }
    }

    /// A client using basic auth.
    pub fn with_auth(insecure: bool, username: &str, password: &str) -> Self {
        Self {
            auth: RegistryAuth::Basic(username.to_string(), password.to_string()),
            ..Self::new(insecure)
        }
    }

    fn registry_err(reference: &OCIReference, reason: impl std::fmt::Display) -> PorterError {
        PorterError::Registry {
            reference: reference.to_string(),
            reason: reason.to_string(),
        }
    }

    fn to_oci(reference: &OCIReference) -> Result<Reference> {
        reference
            .to_string()
            .parse::<Reference>()
            .map_err(|e| PorterError::InvalidReference {
                reference: reference.to_string(),
                reason: e.to_string(),
            })
    }

    /// The digest reference for a manifest in the same repository.
    fn pinned(reference: &OCIReference, digest: &str) -> Result<Reference> {
        Self::to_oci(&reference.repository_only().with_digest(digest)?)
    }

    async fn pull_config_blob(
        &self,
        reference: &OCIReference,
        image: &Reference,
        config: &OciDescriptor,
    ) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.client
            .pull_blob(image, config, &mut data)
            .await
            .map_err(|e| Self::registry_err(reference, format!("unable to pull bundle.json: {e}")))?;
        Ok(data)
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn list_tags(&self, reference: &OCIReference) -> Result<Vec<String>> {
        let image = Self::to_oci(&reference.repository_only())?;
        let (image, client, auth) = (&image, &self.client, &self.auth);
        let tags = collect_tag_pages(TAG_PAGE_SIZE, move |last: Option<String>| async move {
            client
                .list_tags(image, auth, Some(TAG_PAGE_SIZE), last.as_deref())
                .await
                .map(|response| response.tags)
                .map_err(|e| Self::registry_err(reference, format!("unable to list tags: {e}")))
        })
        .await?;
        debug!(reference = %reference, tags = tags.len(), "listed tags");
        Ok(tags)
    }

    async fn pull_bundle(&self, reference: &OCIReference) -> Result<BundleReference> {
        info!(reference = %reference, "pulling bundle");
        let image = Self::to_oci(reference)?;
        let (manifest, digest) = self
            .client
            .pull_manifest(&image, &self.auth)
            .await
            .map_err(|e| Self::registry_err(reference, format!("unable to pull manifest: {e}")))?;

        let data = match manifest {
            OciManifest::Image(m) => self.pull_config_blob(reference, &image, &m.config).await?,
            OciManifest::ImageIndex(index) => {
                let entry = index
                    .manifests
                    .iter()
                    .find(|m| {
                        m.annotations.as_ref().is_some_and(|a| {
                            a.get(CNAB_MANIFEST_TYPE_ANNOTATION).map(String::as_str)
                                == Some(CNAB_MANIFEST_TYPE_CONFIG)
                        })
                    })
                    .ok_or_else(|| {
                        Self::registry_err(reference, "image index has no bundle config manifest")
                    })?;
                let config_ref = Self::pinned(reference, &entry.digest)?;
                let (config_manifest, _) = self
                    .client
                    .pull_manifest(&config_ref, &self.auth)
                    .await
                    .map_err(|e| {
                        Self::registry_err(reference, format!("unable to pull config manifest: {e}"))
                    })?;
                let OciManifest::Image(m) = config_manifest else {
                    return Err(Self::registry_err(reference, "nested image index not supported"));
                };
                self.pull_config_blob(reference, &config_ref, &m.config).await?
            }
        };

        let definition = ExtendedBundle::from_json(&data)
            .map_err(|e| e.context(format!("invalid bundle.json in {reference}")))?;
        let relocation_map = relocation_map(reference, &definition);
        Ok(BundleReference {
            reference: reference.clone(),
            digest: Some(digest),
            definition,
            relocation_map,
        })
    }
}

/// Map each image with a content digest to its copy in the bundle repository.
pub fn relocation_map(reference: &OCIReference, bundle: &ExtendedBundle) -> RelocationMapping {
    let repository = reference.repository_only();
    bundle
        .invocation_images
        .iter()
        .chain(bundle.images.values())
        .filter_map(|img| {
            let digest = img.digest.as_deref().filter(|d| !d.is_empty())?;
            let relocated = repository.with_digest(digest).ok()?;
            Some((img.image.clone(), relocated.to_string()))
        })
        .collect()
}

// =============================================================================
// IN-MEMORY REGISTRY
// =============================================================================

/// A registry held in memory, keyed by reference string.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    bundles: Mutex<BTreeMap<String, BundleReference>>,
    pulls: Mutex<usize>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a bundle at `reference`.
    pub fn publish(&self, reference: &OCIReference, definition: ExtendedBundle) -> Result<()> {
        let relocation_map = relocation_map(reference, &definition);
        let mut bundles = self.lock_bundles()?;
        bundles.insert(
            reference.to_string(),
            BundleReference {
                reference: reference.clone(),
                digest: None,
                definition,
                relocation_map,
            },
        );
        Ok(())
    }

    /// Number of successful pulls served.
    pub fn pull_count(&self) -> usize {
        self.pulls.lock().map(|p| *p).unwrap_or(0)
    }

    fn lock_bundles(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, BundleReference>>> {
        self.bundles
            .lock()
            .map_err(|_| PorterError::Registry {
                reference: String::new(),
                reason: "registry lock poisoned".into(),
            })
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn list_tags(&self, reference: &OCIReference) -> Result<Vec<String>> {
        let repository = reference.repository_only();
        let bundles = self.lock_bundles()?;
        Ok(bundles
            .values()
            .filter(|b| b.reference.repository_only() == repository)
            .filter_map(|b| b.reference.tag().map(str::to_string))
            .collect())
    }

    async fn pull_bundle(&self, reference: &OCIReference) -> Result<BundleReference> {
        let found = self.lock_bundles()?.get(&reference.to_string()).cloned();
        match found {
            Some(b) => {
                if let Ok(mut p) = self.pulls.lock() {
                    *p += 1;
                }
                Ok(b)
            }
            None => Err(PorterError::not_found("bundle", reference.to_string())),
        }
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

/// Fetches bundles through the cache.
#[derive(Clone)]
pub struct BundleResolver {
    cache: BundleCache,
    registry: Arc<dyn Registry>,
}

impl std::fmt::Debug for BundleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleResolver")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl BundleResolver {
    pub fn new(cache: BundleCache, registry: Arc<dyn Registry>) -> Self {
        Self { cache, registry }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Return the cached bundle, pulling it first on a miss or with `force`.
    pub async fn resolve(
        &self,
        reference: &OCIReference,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<CachedBundle> {
        if !force && let Some(cached) = self.cache.find_bundle(reference)? {
            debug!(reference = %reference, "bundle cache hit");
            return Ok(cached);
        }
        let pulled = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PorterError::Canceled),
            pulled = self.registry.pull_bundle(reference) => pulled?,
        };
        self.cache.store_bundle(&pulled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::sample_bundle;
    use tempfile::TempDir;

    fn reference(s: &str) -> OCIReference {
        OCIReference::parse(s).expect("reference")
    }

    #[test]
    fn relocation_map_uses_content_digests() {
        let mut bundle = sample_bundle();
        bundle.bundle.invocation_images[0].digest = Some(format!("sha256:{}", "a".repeat(64)));
        let map = relocation_map(&reference("example.com/mybun:v0.1.0"), &bundle);
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get("localhost:5000/mybun:porter-abc").map(String::as_str),
            Some(format!("example.com/mybun@sha256:{}", "a".repeat(64)).as_str())
        );
    }

    /// Serves `tags` in sorted pages after `last`, like a distribution registry.
    fn paged(tags: &[String], page_size: usize, last: Option<&str>) -> Vec<String> {
        tags.iter()
            .filter(|t| last.is_none_or(|l| t.as_str() > l))
            .take(page_size)
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn tag_listing_follows_every_page() {
        // Registries page through tags in lexical order.
        let mut all: Vec<String> = (0..=150).map(|i| format!("1.0.{i}")).collect();
        all.sort();
        let calls = std::cell::Cell::new(0);
        let tags = collect_tag_pages(100, |last| {
            calls.set(calls.get() + 1);
            let page = paged(&all, 100, last.as_deref());
            async move { Ok(page) }
        })
        .await
        .expect("tags");
        assert_eq!(tags, all);
        assert_eq!(calls.get(), 2);
        let latest = crate::dependencies::solver::default_tag(&reference("getporter/app"), &tags)
            .expect("default tag");
        assert_eq!(latest, "1.0.150");
    }

    #[tokio::test]
    async fn tag_listing_stops_on_exact_page_boundary() {
        let all: Vec<String> = (0..4).map(|i| format!("v{i}")).collect();
        let tags = collect_tag_pages(2, |last| {
            let page = paged(&all, 2, last.as_deref());
            async move { Ok(page) }
        })
        .await
        .expect("tags");
        assert_eq!(tags, all);
    }

    #[tokio::test]
    async fn tag_listing_stops_when_registry_ignores_last() {
        let page: Vec<String> = vec!["a".into(), "b".into()];
        let tags = collect_tag_pages(2, |_| {
            let page = page.clone();
            async move { Ok(page) }
        })
        .await
        .expect("tags");
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn resolver_uses_cache_unless_forced() {
        let dir = TempDir::new().expect("tempdir");
        let registry = Arc::new(InMemoryRegistry::new());
        let r = reference("getporter/mybun:v0.1.0");
        registry.publish(&r, sample_bundle()).expect("publish");
        let resolver = BundleResolver::new(BundleCache::new(dir.path()), registry.clone());
        let cancel = CancellationToken::new();

        let first = resolver.resolve(&r, false, &cancel).await.expect("pull");
        assert_eq!(first.definition().name, "mybun");
        resolver.resolve(&r, false, &cancel).await.expect("cached");
        assert_eq!(registry.pull_count(), 1);

        resolver.resolve(&r, true, &cancel).await.expect("forced");
        assert_eq!(registry.pull_count(), 2);
    }

    #[tokio::test]
    async fn canceled_pull_returns_canceled() {
        let dir = TempDir::new().expect("tempdir");
        let registry = Arc::new(InMemoryRegistry::new());
        let resolver = BundleResolver::new(BundleCache::new(dir.path()), registry);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = resolver
            .resolve(&reference("getporter/missing:v1"), false, &cancel)
            .await
            .expect_err("canceled");
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn lists_tags_of_repository() {
        let registry = InMemoryRegistry::new();
        registry
            .publish(&reference("getporter/mysql:v5.7.0"), sample_bundle())
            .expect("publish");
        registry
            .publish(&reference("getporter/mysql:v5.8.0"), sample_bundle())
            .expect("publish");
        registry
            .publish(&reference("getporter/other:v1.0.0"), sample_bundle())
            .expect("publish");
        let tags = registry
            .list_tags(&reference("getporter/mysql"))
            .await
            .expect("tags");
        assert_eq!(tags, vec!["v5.7.0".to_string(), "v5.8.0".to_string()]);
    }
}
