//! # Bundle Cache
//!
//! Local filesystem cache of pulled bundles.
//!
//! Each entry lives under `<root>/<md5(reference)>/`:
//!
//! ```text
//! cnab/bundle.json
//! cnab/relocation-mapping.json   (optional)
//! porter.yaml                    (optional, embedded manifest)
//! metadata.json
//! ```
//!
//! `store_bundle` is a refresh: files under the entry that were not written
//! by the current call are removed, so companions from an earlier pull of
//! the same reference cannot leak into the new entry.

use crate::bundle::ExtendedBundle;
use crate::reference::OCIReference;
use crate::types::{PorterError, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BUNDLE_FILE: &str = "bundle.json";
const RELOCATION_FILE: &str = "relocation-mapping.json";
const MANIFEST_FILE: &str = "porter.yaml";
const METADATA_FILE: &str = "metadata.json";
const CNAB_DIR: &str = "cnab";

/// Original image reference to its relocated form.
pub type RelocationMapping = BTreeMap<String, String>;

/// A bundle as pulled from a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleReference {
    pub reference: OCIReference,
    pub digest: Option<String>,
    pub definition: ExtendedBundle,
    pub relocation_map: RelocationMapping,
}

/// The `metadata.json` companion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CacheMetadata {
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// A bundle laid out in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBundle {
    pub bundle_reference: BundleReference,
    pub cache_dir: PathBuf,
    pub bundle_path: PathBuf,
    pub relocation_file_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
}

impl CachedBundle {
    pub fn definition(&self) -> &ExtendedBundle {
        &self.bundle_reference.definition
    }
}

/// Content-addressed bundle cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct BundleCache {
    root: PathBuf,
}

impl BundleCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hex MD5 of the reference's string form.
    pub fn cache_id(reference: &OCIReference) -> String {
        let digest = Md5::digest(reference.to_string().as_bytes());
        hex::encode(digest)
    }

    pub fn entry_dir(&self, reference: &OCIReference) -> PathBuf {
        self.root.join(Self::cache_id(reference))
    }

    /// Write (or refresh) the cache entry for a pulled bundle.
    pub fn store_bundle(&self, bundle_ref: &BundleReference) -> Result<CachedBundle> {
        let entry = self.entry_dir(&bundle_ref.reference);
        let cnab_dir = entry.join(CNAB_DIR);
        fs::create_dir_all(&cnab_dir).map_err(|e| {
            PorterError::Io(format!("unable to create cache directory {}: {e}", cnab_dir.display()))
        })?;

        let mut written = BTreeSet::new();

        let bundle_path = cnab_dir.join(BUNDLE_FILE);
        write_file(&bundle_path, &bundle_ref.definition.to_json()?)?;
        written.insert(bundle_path.clone());

        let relocation_file_path = if bundle_ref.relocation_map.is_empty() {
            None
        } else {
            let path = cnab_dir.join(RELOCATION_FILE);
            write_file(&path, &serde_json::to_vec_pretty(&bundle_ref.relocation_map)?)?;
            written.insert(path.clone());
            Some(path)
        };

        let metadata = CacheMetadata {
            reference: bundle_ref.reference.to_string(),
            digest: bundle_ref.digest.clone(),
        };
        let metadata_path = entry.join(METADATA_FILE);
        write_file(&metadata_path, &serde_json::to_vec_pretty(&metadata)?)?;
        written.insert(metadata_path);

        let manifest_path = match bundle_ref.definition.embedded_manifest()? {
            Some(manifest) => {
                let path = entry.join(MANIFEST_FILE);
                write_file(&path, &manifest)?;
                written.insert(path.clone());
                Some(path)
            }
            None => None,
        };

        purge_unwritten(&entry, &written)?;
        debug!(
            reference = %bundle_ref.reference,
            dir = %entry.display(),
            "stored bundle in cache"
        );

        Ok(CachedBundle {
            bundle_reference: bundle_ref.clone(),
            cache_dir: entry,
            bundle_path,
            relocation_file_path,
            manifest_path,
        })
    }

    /// Load a cached bundle. A missing or unparseable `bundle.json` is a miss.
    pub fn find_bundle(&self, reference: &OCIReference) -> Result<Option<CachedBundle>> {
        let entry = self.entry_dir(reference);
        let bundle_path = entry.join(CNAB_DIR).join(BUNDLE_FILE);
        let data = match fs::read(&bundle_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PorterError::Io(format!(
                    "unable to read cached bundle {}: {e}",
                    bundle_path.display()
                )));
            }
        };
        let definition = match ExtendedBundle::from_json(&data) {
            Ok(b) => b,
            Err(e) => {
                debug!(reference = %reference, error = %e, "ignoring corrupt cache entry");
                return Ok(None);
            }
        };

        let mut bundle_ref = BundleReference {
            reference: reference.clone(),
            digest: None,
            definition,
            relocation_map: RelocationMapping::new(),
        };

        let relocation_path = entry.join(CNAB_DIR).join(RELOCATION_FILE);
        let relocation_file_path = if relocation_path.exists() {
            match read_json::<RelocationMapping>(&relocation_path) {
                Ok(map) => {
                    bundle_ref.relocation_map = map;
                    Some(relocation_path)
                }
                Err(e) => {
                    warn!(path = %relocation_path.display(), error = %e, "ignoring unreadable relocation mapping");
                    None
                }
            }
        } else {
            None
        };

        let metadata_path = entry.join(METADATA_FILE);
        if metadata_path.exists() {
            match read_json::<CacheMetadata>(&metadata_path) {
                Ok(meta) => bundle_ref.digest = meta.digest,
                Err(e) => {
                    warn!(path = %metadata_path.display(), error = %e, "ignoring unreadable cache metadata");
                }
            }
        }

        let manifest = entry.join(MANIFEST_FILE);
        let manifest_path = manifest.exists().then_some(manifest);

        Ok(Some(CachedBundle {
            bundle_reference: bundle_ref,
            cache_dir: entry,
            bundle_path,
            relocation_file_path,
            manifest_path,
        }))
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)
        .map_err(|e| PorterError::Io(format!("unable to write {}: {e}", path.display())))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Remove every file under `dir` not in `keep`, then any emptied directories.
fn purge_unwritten(dir: &Path, keep: &BTreeSet<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .map_err(|e| PorterError::Io(format!("unable to list {}: {e}", dir.display())))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            purge_unwritten(&path, keep)?;
            if fs::read_dir(&path)?.next().is_none() {
                fs::remove_dir(&path)?;
            }
        } else if !keep.contains(&path) {
            debug!(path = %path.display(), "removing stale cache file");
            fs::remove_file(&path).map_err(|e| {
                PorterError::Io(format!("unable to remove stale {}: {e}", path.display()))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;
    use crate::primitives::PORTER_CUSTOM_KEY;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde_json::json;
    use tempfile::TempDir;

    fn kubekahn(with_companions: bool) -> BundleReference {
        let mut bundle = Bundle {
            schema_version: "1.2.0".into(),
            name: "kubekahn".into(),
            version: "1.0.0".into(),
            ..Bundle::default()
        };
        let mut relocation_map = RelocationMapping::new();
        if with_companions {
            bundle.custom.insert(
                PORTER_CUSTOM_KEY.into(),
                json!({"manifestDigest": "abc", "manifest": BASE64.encode("name: kubekahn\n")}),
            );
            relocation_map.insert(
                "deislabs/kubekahn-installer:1.0".into(),
                "localhost:5000/kubekahn@sha256:aaaa".into(),
            );
        }
        BundleReference {
            reference: OCIReference::parse("deislabs/kubekahn:1.0").expect("ref"),
            digest: Some(format!("sha256:{}", "a".repeat(64))),
            definition: ExtendedBundle::new(bundle),
            relocation_map,
        }
    }

    #[test]
    fn cache_id_is_md5_hex() {
        let r = OCIReference::parse("deislabs/kubekahn:1.0").expect("ref");
        let id = BundleCache::cache_id(&r);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn store_then_find() {
        let dir = TempDir::new().expect("tempdir");
        let cache = BundleCache::new(dir.path());
        let bundle_ref = kubekahn(true);
        let stored = cache.store_bundle(&bundle_ref).expect("store");
        assert!(stored.relocation_file_path.is_some());
        assert!(stored.manifest_path.is_some());

        let found = cache
            .find_bundle(&bundle_ref.reference)
            .expect("find")
            .expect("cache hit");
        assert_eq!(found.bundle_reference, bundle_ref);
        assert_eq!(found.manifest_path, stored.manifest_path);
    }

    #[test]
    fn miss_when_absent() {
        let dir = TempDir::new().expect("tempdir");
        let cache = BundleCache::new(dir.path());
        let r = OCIReference::parse("getporter/nope:v1").expect("ref");
        assert!(cache.find_bundle(&r).expect("find").is_none());
    }

    #[test]
    fn corrupt_bundle_is_a_miss() {
        let dir = TempDir::new().expect("tempdir");
        let cache = BundleCache::new(dir.path());
        let stored = cache.store_bundle(&kubekahn(false)).expect("store");
        fs::write(&stored.bundle_path, b"{\"name\": ").expect("truncate");
        assert!(
            cache
                .find_bundle(&stored.bundle_reference.reference)
                .expect("find")
                .is_none()
        );
    }

    #[test]
    fn unreadable_companion_is_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let cache = BundleCache::new(dir.path());
        let stored = cache.store_bundle(&kubekahn(true)).expect("store");
        let reloc = stored.relocation_file_path.clone().expect("reloc");
        fs::write(&reloc, b"not json").expect("corrupt");
        let found = cache
            .find_bundle(&stored.bundle_reference.reference)
            .expect("find")
            .expect("hit");
        assert!(found.bundle_reference.relocation_map.is_empty());
        assert!(found.relocation_file_path.is_none());
    }

    #[test]
    fn refresh_purges_stale_companions() {
        let dir = TempDir::new().expect("tempdir");
        let cache = BundleCache::new(dir.path());
        let first = cache.store_bundle(&kubekahn(true)).expect("store");
        let reloc = first.relocation_file_path.clone().expect("reloc");
        let manifest = first.manifest_path.clone().expect("manifest");

        let second = cache.store_bundle(&kubekahn(false)).expect("restore");
        assert!(second.bundle_path.exists());
        assert!(!reloc.exists());
        assert!(!manifest.exists());
    }
}
