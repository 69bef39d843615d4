//! Type-specialised metadata caches.
//!
//! Two thin wrappers bind the generic coalescing [`crate::cache::Cache`] to
//! the provider client and the on-disk cache layout: one for images, one
//! for networks. Both cache negative outcomes so an irrecoverably missing
//! record does not re-hit the provider within a session.

mod images;
mod networks;

pub use images::{ImageCache, default_user};
pub use networks::NetworkCache;

/// Loader parallelism per metadata cache.
pub(crate) const QUERY_MAX_WORKERS: usize = 4;

/// Additional loader attempts after the first failure.
pub(crate) const QUERY_RETRIES: usize = 1;
