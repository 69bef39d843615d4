//! Shared test doubles for unit and behavioural tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::provider::{CloudClient, Image, Instance, Network, ProviderError, ProviderFuture};

/// In-memory provider with call counters.
#[derive(Default)]
pub struct FakeCloud {
    instances: Vec<Instance>,
    images: HashMap<String, Image>,
    networks: HashMap<String, Network>,
    list_calls: AtomicUsize,
    image_calls: AtomicUsize,
    network_calls: AtomicUsize,
}

impl FakeCloud {
    /// Creates an empty fleet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the instance listing.
    #[must_use]
    pub fn with_instances(mut self, instances: Vec<Instance>) -> Self {
        self.instances = instances;
        self
    }

    /// Adds a resolvable image.
    #[must_use]
    pub fn with_image(mut self, image: Image) -> Self {
        self.images.insert(image.id.clone(), image);
        self
    }

    /// Adds a resolvable network.
    #[must_use]
    pub fn with_network(mut self, network: Network) -> Self {
        self.networks.insert(network.id.clone(), network);
        self
    }

    /// Number of `list_instances` calls observed.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_image` calls observed.
    #[must_use]
    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_network` calls observed.
    #[must_use]
    pub fn network_calls(&self) -> usize {
        self.network_calls.load(Ordering::SeqCst)
    }
}

impl CloudClient for FakeCloud {
    fn list_instances(&self, offset: u16, limit: u16) -> ProviderFuture<'_, Vec<Instance>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let start = usize::from(offset).min(self.instances.len());
        let end = start
            .saturating_add(usize::from(limit))
            .min(self.instances.len());
        let page = self.instances[start..end].to_vec();
        Box::pin(async move { Ok(page) })
    }

    fn get_image(&self, id: &str) -> ProviderFuture<'_, Image> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        let found = self.images.get(id).cloned();
        let id = id.to_owned();
        Box::pin(async move {
            found.ok_or(ProviderError::NotFound {
                resource: "image",
                id,
            })
        })
    }

    fn get_network(&self, id: &str) -> ProviderFuture<'_, Network> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        let found = self.networks.get(id).cloned();
        let id = id.to_owned();
        Box::pin(async move {
            found.ok_or(ProviderError::NotFound {
                resource: "network",
                id,
            })
        })
    }
}

/// Builds an instance with the identifiers that matter to the pipeline.
#[must_use]
pub fn instance(id: &str, name: &str, image: &str, networks: &[&str]) -> Instance {
    Instance {
        id: id.to_owned(),
        name: name.to_owned(),
        image: image.to_owned(),
        primary_ip: String::from("192.0.2.10"),
        networks: networks.iter().map(|net| (*net).to_owned()).collect(),
        ..Instance::default()
    }
}

/// Builds an image carrying a `default_user` tag.
#[must_use]
pub fn image_with_user(id: &str, user: &str) -> Image {
    let mut image = Image {
        id: id.to_owned(),
        ..Image::default()
    };
    image
        .tags
        .insert(String::from("default_user"), user.to_owned());
    image
}

/// Builds a network record.
#[must_use]
pub fn network(id: &str, public: bool) -> Network {
    Network {
        id: id.to_owned(),
        name: format!("{id}-name"),
        public,
    }
}
