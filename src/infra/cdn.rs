//! HTTP invalidation client for the distribution layer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::application::purge::{Distribution, InvalidationError, InvalidationRequest};

use super::error::InfraError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct InvalidationBody<'a> {
    paths: Vec<String>,
    caller_reference: &'a Uuid,
}

/// Posts invalidation batches to a CDN webhook as JSON.
pub struct HttpDistribution {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpDistribution {
    pub fn new(endpoint: Url, token: Option<String>) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| InfraError::configuration(format!("invalid CDN client: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("social-cards/", env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl Distribution for HttpDistribution {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn invalidate(&self, request: &InvalidationRequest) -> Result<(), InvalidationError> {
        let body = InvalidationBody {
            paths: request.scope.paths(),
            caller_reference: &request.caller_reference,
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder
            .send()
            .await
            .map_err(|err| InvalidationError::Transport(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(InvalidationError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        info!(
            target = "infra::cdn",
            op = "invalidate",
            result = "accepted",
            status = status.as_u16(),
            caller_reference = %request.caller_reference,
            paths = ?body.paths,
            "Distribution accepted invalidation"
        );
        Ok(())
    }
}
