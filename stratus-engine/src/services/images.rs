//! Marketplace image versions, cached per process.
//!
//! Listing image versions is slow and the answer rarely changes, so results
//! are kept in a bounded LRU keyed by location, publisher, offer and SKU. An
//! empty listing is an error rather than a cached empty answer.
//!
//! Resource documents name images through `spec.imageReference`. Before any
//! service runs, [`resolve_image_references`] pins `latest` (or a missing
//! version) to the newest published one, so the written document carries the
//! same concrete version the cloud reports back.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use lru::LruCache;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::cloud::CloudError;

/// Version alias that resolves to the newest available version.
pub const LATEST: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub location: String,
    pub publisher: String,
    pub offer: String,
    pub sku: String,
}

impl ImageKey {
    pub fn new(location: &str, publisher: &str, offer: &str, sku: &str) -> Self {
        Self {
            location: location.to_string(),
            publisher: publisher.to_string(),
            offer: offer.to_string(),
            sku: sku.to_string(),
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.location, self.publisher, self.offer, self.sku)
    }
}

/// Lists the versions published for an image.
#[async_trait]
pub trait ImageLister: Send + Sync {
    async fn list_versions(&self, key: &ImageKey) -> Result<Vec<String>, CloudError>;
}

#[async_trait]
impl<L: ImageLister + ?Sized> ImageLister for Arc<L> {
    async fn list_versions(&self, key: &ImageKey) -> Result<Vec<String>, CloudError> {
        (**self).list_versions(key).await
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to refresh cache for {key}: {source}")]
    Refresh {
        key: ImageKey,
        #[source]
        source: CloudError,
    },

    #[error("failed to refresh cache for {key}: no image versions found")]
    Empty { key: ImageKey },

    #[error("image version {version} not found for {key}")]
    VersionNotFound { key: ImageKey, version: String },

    #[error("invalid image reference at {location}: {message}")]
    InvalidReference { location: String, message: String },
}

impl ImageError {
    /// Whether asking again later can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ImageError::Refresh { source, .. } if source.is_retriable())
    }
}

/// Compare dotted versions numerically where both parts are numbers.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

/// Turns a requested image version into a published one.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve(&self, key: &ImageKey, version: &str) -> Result<String, ImageError>;
}

type Flight = Arc<tokio::sync::Mutex<()>>;

pub struct ImageCache<L> {
    lister: L,
    entries: Mutex<LruCache<ImageKey, Arc<Vec<String>>>>,
    /// One refresh at a time per key; other keys are never blocked.
    flights: Mutex<HashMap<ImageKey, Flight>>,
}

impl<L: ImageLister> ImageCache<L> {
    pub fn new(lister: L, capacity: NonZeroUsize) -> Self {
        Self {
            lister,
            entries: Mutex::new(LruCache::new(capacity)),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Capacity from configuration; zero falls back to a single entry.
    pub fn with_capacity(lister: L, capacity: usize) -> Self {
        Self::new(lister, NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
    }

    pub fn lister(&self) -> &L {
        &self.lister
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<ImageKey, Arc<Vec<String>>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<ImageKey, Flight>> {
        self.flights.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached(&self, key: &ImageKey) -> Option<Arc<Vec<String>>> {
        self.entries().get(key).cloned()
    }

    /// Versions for `key`, oldest first.
    ///
    /// Concurrent misses on the same key list the versions once; misses on
    /// other keys and hits proceed while a listing is running.
    pub async fn get(&self, key: &ImageKey) -> Result<Arc<Vec<String>>, ImageError> {
        if let Some(versions) = self.cached(key) {
            return Ok(versions);
        }

        let flight = self.flights().entry(key.clone()).or_default().clone();
        let _refreshing = flight.lock().await;
        if let Some(versions) = self.cached(key) {
            return Ok(versions);
        }

        let result = self.refresh(key).await;
        self.flights().remove(key);
        result
    }

    async fn refresh(&self, key: &ImageKey) -> Result<Arc<Vec<String>>, ImageError> {
        debug!(image = %key, "Refreshing image version cache");
        let mut versions = self
            .lister
            .list_versions(key)
            .await
            .map_err(|source| ImageError::Refresh {
                key: key.clone(),
                source,
            })?;
        if versions.is_empty() {
            return Err(ImageError::Empty { key: key.clone() });
        }
        versions.sort_by(|a, b| compare_versions(a, b));
        versions.dedup();

        let versions = Arc::new(versions);
        self.entries().put(key.clone(), versions.clone());
        Ok(versions)
    }

    /// Resolve `version` for `key`, mapping `latest` to the newest one.
    pub async fn resolve(&self, key: &ImageKey, version: &str) -> Result<String, ImageError> {
        let versions = self.get(key).await?;
        let found = if version == LATEST {
            versions.last()
        } else {
            versions.iter().find(|v| v.as_str() == version)
        };
        found.cloned().ok_or_else(|| ImageError::VersionNotFound {
            key: key.clone(),
            version: version.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<L: ImageLister> ImageResolver for ImageCache<L> {
    async fn resolve(&self, key: &ImageKey, version: &str) -> Result<String, ImageError> {
        ImageCache::resolve(self, key, version).await
    }
}

/// Pin every `spec.imageReference` in `resources` to a published version.
///
/// References are looked up in the document's `spec.location`, or in
/// `default_location` when it has none. Returns how many references changed.
pub async fn resolve_image_references(
    resolver: &dyn ImageResolver,
    default_location: &str,
    resources: &mut [Value],
) -> Result<usize, ImageError> {
    let mut pinned = 0;
    for (index, document) in resources.iter_mut().enumerate() {
        let location = document
            .pointer("/spec/location")
            .and_then(Value::as_str)
            .unwrap_or(default_location)
            .to_string();
        let Some(reference) = document.pointer_mut("/spec/imageReference") else {
            continue;
        };
        let path = format!("spec.resources[{index}].spec.imageReference");
        let (key, requested) = image_key(reference, &location, &path)?;

        let version = resolver.resolve(&key, &requested).await?;
        if version != requested {
            info!(image = %key, requested = %requested, version = %version, "Pinned image version");
            reference["version"] = Value::String(version);
            pinned += 1;
        }
    }
    Ok(pinned)
}

fn image_key(reference: &Value, location: &str, path: &str) -> Result<(ImageKey, String), ImageError> {
    let key = ImageKey::new(
        location,
        required_str(reference, "publisher", path)?,
        required_str(reference, "offer", path)?,
        required_str(reference, "sku", path)?,
    );
    let version = match reference.get("version") {
        None | Some(Value::Null) => LATEST.to_string(),
        Some(Value::String(version)) => version.clone(),
        Some(_) => {
            return Err(ImageError::InvalidReference {
                location: path.to_string(),
                message: "version must be a string".to_string(),
            })
        }
    };
    Ok((key, version))
}

fn required_str<'a>(reference: &'a Value, name: &str, path: &str) -> Result<&'a str, ImageError> {
    reference
        .get(name)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ImageError::InvalidReference {
            location: path.to_string(),
            message: format!("{name} must be a non-empty string"),
        })
}
