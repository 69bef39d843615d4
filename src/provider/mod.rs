//! Provider data model and client interface.
//!
//! The compute provider is consumed through three operations: paged
//! instance listing, image lookup, and network lookup. Concrete transports
//! implement [`CloudClient`]; the rest of the crate only sees the trait.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http;

pub use http::RestClient;

/// A compute instance as reported by the provider.
///
/// Field names serialise to the provider's wire names so that the filter
/// evaluation context sees the same keys a raw API response would carry.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub state: String,
    /// Identifier of the boot image.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub disk: i64,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub updated: String,
    #[serde(default)]
    pub docker: bool,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(rename = "primaryIp", default)]
    pub primary_ip: String,
    #[serde(default)]
    pub firewall_enabled: bool,
    #[serde(default)]
    pub compute_node: String,
    #[serde(default)]
    pub package: String,
    #[serde(default)]
    pub tags: BTreeMap<String, serde_json::Value>,
    /// Identifiers of the networks the instance is attached to.
    #[serde(default)]
    pub networks: Vec<String>,
}

impl Instance {
    /// Reports whether the instance is a Docker container.
    ///
    /// The provider marks containers with an `sdc_docker` tag whose value
    /// may be a boolean or a stringified boolean.
    #[must_use]
    pub fn is_docker_container(&self) -> bool {
        match self.tags.get("sdc_docker") {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.parse::<bool>().unwrap_or(false),
            _ => false,
        }
    }
}

/// A machine image.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub os: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub published_at: String,
    /// Free-form tags; `default_user` selects the login account.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// A provider network.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Whether addresses on this network are publicly routable.
    #[serde(default)]
    pub public: bool,
}

/// Errors raised by provider clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when the requested resource does not exist.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Resource kind, for example `image`.
        resource: &'static str,
        /// Identifier that could not be resolved.
        id: String,
    },
    /// Raised for transport and server-side failures; retried by callers.
    #[error("provider request failed: {message}")]
    Transport {
        /// Human-readable description of the failure.
        message: String,
    },
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Largest page the listing endpoint accepts.
pub const MAX_LIST_LIMIT: u16 = 1000;

/// Minimal interface implemented by compute providers.
pub trait CloudClient: Send + Sync {
    /// Lists instances starting at `offset`, returning at most `limit`
    /// entries. A short page signals the end of the fleet.
    fn list_instances(&self, offset: u16, limit: u16) -> ProviderFuture<'_, Vec<Instance>>;

    /// Fetches a single image by identifier.
    fn get_image(&self, id: &str) -> ProviderFuture<'_, Image>;

    /// Fetches a single network by identifier.
    fn get_network(&self, id: &str) -> ProviderFuture<'_, Network>;
}
