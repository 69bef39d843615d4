//! REST transport for the provider interface.
//!
//! Speaks the CloudAPI read endpoints (`/my/machines`, `/my/images/:id`,
//! `/my/networks/:id`). Request signing is not performed here; the caller
//! supplies a pre-built `Authorization` header value, keeping credential
//! handling outside the core.

use std::sync::LazyLock;
use std::time::Duration;

use serde::de::DeserializeOwned;

use super::{CloudClient, Image, Instance, Network, ProviderError, ProviderFuture};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Provider client backed by the CloudAPI REST interface.
#[derive(Clone, Debug)]
pub struct RestClient {
    base_url: String,
    authorization: String,
}

impl RestClient {
    /// Creates a client for `base_url` using the given pre-built
    /// `Authorization` header value.
    #[must_use]
    pub fn new(base_url: impl Into<String>, authorization: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            authorization: authorization.into(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        resource: &'static str,
        id: &str,
    ) -> Result<T, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        let response = HTTP_CLIENT
            .get(&url)
            .header("Authorization", &self.authorization)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|err| ProviderError::Transport {
                message: err.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                resource,
                id: id.to_owned(),
            });
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Transport {
                message: format!("{url} returned {status}: {body}"),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|err| ProviderError::Transport {
                message: err.to_string(),
            })
    }
}

impl CloudClient for RestClient {
    fn list_instances(&self, offset: u16, limit: u16) -> ProviderFuture<'_, Vec<Instance>> {
        Box::pin(async move {
            self.get_json(
                &format!("/my/machines?limit={limit}&offset={offset}"),
                "instances",
                "page",
            )
            .await
        })
    }

    fn get_image(&self, id: &str) -> ProviderFuture<'_, Image> {
        let id = id.to_owned();
        Box::pin(async move {
            self.get_json(&format!("/my/images/{id}"), "image", &id).await
        })
    }

    fn get_network(&self, id: &str) -> ProviderFuture<'_, Network> {
        let id = id.to_owned();
        Box::pin(async move {
            self.get_json(&format!("/my/networks/{id}"), "network", &id)
                .await
        })
    }
}
