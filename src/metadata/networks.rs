//! Network metadata cache and public-network helpers.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::file::{self, CacheLayout};
use crate::cache::{Cache, CacheError, Loader};
use crate::expr::{EvalError, FilterFn, Value};
use crate::provider::{CloudClient, Instance, Network};

use super::{QUERY_MAX_WORKERS, QUERY_RETRIES};

/// Coalescing cache for [`Network`] records, layered over the file cache.
#[derive(Clone)]
pub struct NetworkCache {
    cache: Cache<Network>,
}

impl NetworkCache {
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
        let loader: Loader<Network> = Arc::new(move |id: String| {
            let client = Arc::clone(&client);
            let path = layout.network(&id);
            Box::pin(async move {
                if !no_cache && let Ok(network) = file::read_json::<Network>(&path, ttl) {
                    return Ok(network);
                }
                let network = client.get_network(&id).await.map_err(CacheError::from)?;
                if let Err(err) = file::write_json(&path, &network) {
                    debug!(network = %id, error = %err, "failed to persist network record");
                }
                Ok(network)
            })
        });
        Self {
            cache: Cache::new(loader, QUERY_RETRIES, true, QUERY_MAX_WORKERS),
        }
    }

    /// Resolves the network for `id`, waiting for any in-flight load.
    ///
    /// # Errors
    ///
    /// Returns the loader's final [`CacheError`] for the identifier.
    pub async fn get(&self, id: &str) -> Result<Network, CacheError> {
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

    /// Reports whether the network is publicly routable. Lookup failures
    /// count as not public.
    pub async fn is_public(&self, id: &str) -> bool {
        match self.get(id).await {
            Ok(network) => network.public,
            Err(_) => false,
        }
    }

    /// Reports whether any of the instance's networks is public.
    pub async fn has_public(&self, instance: &Instance) -> bool {
        for id in &instance.networks {
            if self.is_public(id).await {
                return true;
            }
        }
        false
    }

    /// Builds the `ispublic(netid, …)` filter function for the expression
    /// evaluator: true when any listed network identifier is public.
    #[must_use]
    pub fn is_public_filter(&self) -> FilterFn {
        let networks = self.clone();
        Arc::new(move |args: Vec<Value>| {
            let networks = networks.clone();
            Box::pin(async move {
                for arg in &args {
                    let Value::Str(id) = arg else {
                        return Err(EvalError::Function {
                            name: String::from("ispublic"),
                            message: format!(
                                "string network id required, found {}",
                                arg.type_name()
                            ),
                        });
                    };
                    if networks.is_public(id).await {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            })
        })
    }

    /// Shuts the underlying cache session down.
    pub async fn close(&self) {
        self.cache.close().await;
    }
}
