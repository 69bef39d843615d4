//! Image metadata cache.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::file::{self, CacheLayout};
use crate::cache::{Cache, CacheError, Loader};
use crate::provider::{CloudClient, Image};

use super::{QUERY_MAX_WORKERS, QUERY_RETRIES};

/// Tag on an image that names the login account to use.
pub const DEFAULT_USER_TAG: &str = "default_user";

/// Coalescing cache for [`Image`] records, layered over the file cache.
#[derive(Clone)]
pub struct ImageCache {
    cache: Cache<Image>,
}

impl ImageCache {
    /// Creates the cache. Loads consult the file cache first (unless
    /// `no_cache` is set), then the provider, persisting fresh records
    /// back to disk.
    #[must_use]
    pub fn new(
        client: Arc<dyn CloudClient>,
        layout: CacheLayout,
        ttl: Duration,
        no_cache: bool,
    ) -> Self {
        let loader: Loader<Image> = Arc::new(move |id: String| {
            let client = Arc::clone(&client);
            let path = layout.image(&id);
            Box::pin(async move {
                if !no_cache && let Ok(image) = file::read_json::<Image>(&path, ttl) {
                    return Ok(image);
                }
                let image = client.get_image(&id).await.map_err(CacheError::from)?;
                if let Err(err) = file::write_json(&path, &image) {
                    debug!(image = %id, error = %err, "failed to persist image record");
                }
                Ok(image)
            })
        });
        Self {
            cache: Cache::new(loader, QUERY_RETRIES, true, QUERY_MAX_WORKERS),
        }
    }

    /// Resolves the image for `id`, waiting for any in-flight load.
    ///
    /// # Errors
    ///
    /// Returns the loader's final [`CacheError`] for the identifier.
    pub async fn get(&self, id: &str) -> Result<Image, CacheError> {
        self.cache.get(id).await
    }

    /// Fire-and-forget warm-up for `id`.
    pub async fn prepare(&self, id: &str) {
        self.cache.prepare(id).await;
    }

    /// Reports whether `id` is already resolved.
    pub async fn peek(&self, id: &str) -> bool {
        self.cache.peek(id).await
    }

    /// Shuts the underlying cache session down.
    pub async fn close(&self) {
        self.cache.close().await;
    }
}

/// Returns the login user an image advertises via its `default_user` tag,
/// falling back to `fallback` when the tag or the image itself is absent.
#[must_use]
pub fn default_user(image: Option<&Image>, fallback: &str) -> String {
    image
        .and_then(|image| image.tags.get(DEFAULT_USER_TAG))
        .cloned()
        .unwrap_or_else(|| fallback.to_owned())
}
