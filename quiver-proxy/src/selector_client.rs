//! Client for the selector tier: in-process for single-node deployments and
//! tests, HTTP for a remote selector.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use quiver_core::error::{Error, Result};
use quiver_core::Context;
use quiver_selector::service::{Selection, SelectorService};

#[async_trait]
pub trait SelectorClient: Send + Sync {
    async fn select(&self, experiment_id: &str, context: &Context) -> Result<Selection>;
    /// Best-effort cache eviction after a catalog change.
    async fn invalidate(&self, experiment_id: &str) -> Result<()>;
    async fn health(&self) -> bool;
}

pub struct LocalSelectorClient {
    service: Arc<SelectorService>,
}

impl LocalSelectorClient {
    pub fn new(service: Arc<SelectorService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl SelectorClient for LocalSelectorClient {
    async fn select(&self, experiment_id: &str, context: &Context) -> Result<Selection> {
        self.service.select(experiment_id, context).await
    }

    async fn invalidate(&self, experiment_id: &str) -> Result<()> {
        self.service.invalidate(experiment_id);
        Ok(())
    }

    async fn health(&self) -> bool {
        true
    }
}

pub struct HttpSelectorClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SelectBody<'a> {
    experiment_id: &'a str,
    context: &'a Context,
}

impl HttpSelectorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SelectorClient for HttpSelectorClient {
    async fn select(&self, experiment_id: &str, context: &Context) -> Result<Selection> {
        let response = self
            .client
            .post(format!("{}/internal/v1/select", self.base_url))
            .json(&SelectBody {
                experiment_id,
                context,
            })
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("selector unreachable: {e}")))?;

        match response.status() {
            status if status.is_success() => response
                .json::<Selection>()
                .await
                .map_err(|e| Error::Internal(format!("selector reply: {e}"))),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!(
                "experiment not found: {experiment_id}"
            ))),
            StatusCode::BAD_REQUEST => Err(Error::InvalidArgument(format!(
                "selector rejected request for {experiment_id}"
            ))),
            status => Err(Error::Internal(format!(
                "selector returned status {status}"
            ))),
        }
    }

    async fn invalidate(&self, experiment_id: &str) -> Result<()> {
        self.client
            .post(format!(
                "{}/internal/v1/invalidate/{experiment_id}",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("selector unreachable: {e}")))?;
        Ok(())
    }

    async fn health(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
