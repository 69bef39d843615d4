//! Instance enumeration and prefetch pipeline.
//!
//! Pages the provider's listing API, caching each page on disk by its
//! `(limit, offset)` coordinates, and streams instances to the consumer.
//! Before an instance is emitted its image and network records are warmed
//! in the metadata caches, so filter evaluation and SSH dialing overlap
//! with the lookups.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::cache::file::{self, CacheLayout};
use crate::metadata::{ImageCache, NetworkCache};
use crate::provider::{CloudClient, Instance, MAX_LIST_LIMIT, ProviderError};

/// Errors that terminate the instance stream.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PipelineError {
    /// The provider's listing call failed.
    #[error("instance listing failed at offset {offset}: {source}")]
    List {
        /// Offset of the failing page.
        offset: u16,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
}

/// Handle on a running enumeration: the instance stream plus the task that
/// drives it. The task resolves once every page has been emitted, carrying
/// any terminal listing error.
pub struct InstanceStream {
    receiver: mpsc::Receiver<Instance>,
    driver: JoinHandle<Result<(), PipelineError>>,
}

impl InstanceStream {
    /// Receives the next instance, or `None` when the fleet is exhausted
    /// or the listing failed.
    pub async fn recv(&mut self) -> Option<Instance> {
        self.receiver.recv().await
    }

    /// Waits for the paging task and surfaces its terminal result.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::List`] when a page could not be fetched.
    pub async fn finish(self) -> Result<(), PipelineError> {
        drop(self.receiver);
        match self.driver.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

/// Settings for [`stream_instances`].
#[derive(Clone)]
pub struct PipelineConfig {
    /// On-disk cache layout for page records.
    pub layout: CacheLayout,
    /// TTL applied to cached pages.
    pub page_ttl: Duration,
    /// Skip the on-disk page cache entirely.
    pub no_cache: bool,
}

/// Starts enumerating the fleet, prefetching metadata for every emitted
/// instance. Paging stops at the first short page.
#[must_use]
pub fn stream_instances(
    client: Arc<dyn CloudClient>,
    images: ImageCache,
    networks: NetworkCache,
    config: PipelineConfig,
) -> InstanceStream {
    let (tx, rx) = mpsc::channel(1);
    let driver = tokio::spawn(async move {
        let limit = MAX_LIST_LIMIT;
        let mut offset: u16 = 0;
        loop {
            let page = load_page(client.as_ref(), &config, offset, limit).await?;
            let short_page = page.len() < usize::from(limit);
            debug!(offset, count = page.len(), "instance page loaded");

            for instance in page {
                images.prepare(&instance.image).await;
                for network in &instance.networks {
                    networks.prepare(network).await;
                }
                trace!(instance = %instance.id, "emitting instance");
                if tx.send(instance).await.is_err() {
                    // Consumer went away; stop paging.
                    return Ok(());
                }
            }

            if short_page {
                return Ok(());
            }
            let Some(next) = offset.checked_add(limit) else {
                return Ok(());
            };
            offset = next;
        }
    });

    InstanceStream {
        receiver: rx,
        driver,
    }
}

async fn load_page(
    client: &dyn CloudClient,
    config: &PipelineConfig,
    offset: u16,
    limit: u16,
) -> Result<Vec<Instance>, PipelineError> {
    let path = config.layout.instances(limit, offset);
    if !config.no_cache
        && let Ok(page) = file::read_json::<Vec<Instance>>(&path, config.page_ttl)
    {
        debug!(offset, "using cached instance page");
        return Ok(page);
    }

    let page = client
        .list_instances(offset, limit)
        .await
        .map_err(|source| PipelineError::List { offset, source })?;

    if !config.no_cache
        && let Err(err) = file::write_json(&path, &page)
    {
        debug!(offset, error = %err, "failed to persist instance page");
    }
    Ok(page)
}
