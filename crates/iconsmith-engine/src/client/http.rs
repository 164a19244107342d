use std::time::Duration;

use async_trait::async_trait;
use iconsmith_contracts::errors::ProviderError;
use iconsmith_contracts::providers::ProviderId;
use iconsmith_contracts::quota::Quota;
use iconsmith_contracts::task::{RemoteTaskHandle, ResultRef};
use iconsmith_contracts::wire::{StatusResponse, SubmitRequest, SubmitResponse};
use reqwest::{Method, RequestBuilder};
use tracing::debug;

use super::{
    decode_data_url, response_bytes_or_error, response_json_or_error, transport_error,
    ProviderClient,
};
use crate::config::{EndpointPaths, ProviderEndpoint};

/// REST client for a backend exposing `submit`, `status/{taskId}` and `quota` endpoints.
pub struct HttpTaskClient {
    id: ProviderId,
    api_base: String,
    api_key: Option<String>,
    model: Option<String>,
    paths: EndpointPaths,
    http: reqwest::Client,
}

impl HttpTaskClient {
    pub fn new(endpoint: &ProviderEndpoint, request_timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| ProviderError::network(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            id: endpoint.id.clone(),
            api_base: endpoint.api_base.trim_end_matches('/').to_string(),
            api_key: endpoint.api_key.clone(),
            model: endpoint.model.clone(),
            paths: endpoint.paths.clone(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    fn status_url(&self, handle: &RemoteTaskHandle) -> String {
        self.url(&self.paths.status.replace("{taskId}", handle.as_str()))
    }

    /// True when `url` lives under this provider's `api_base`.
    fn is_own_url(&self, url: &str) -> bool {
        url.strip_prefix(&self.api_base)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?']))
    }

    /// Builds a request, attaching the API key only for this provider's own host.
    /// Result URLs may point at a CDN or a presigned link that must not see it.
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match self.api_key.as_deref() {
            Some(key) if self.is_own_url(url) => builder.bearer_auth(key),
            _ => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        builder
            .send()
            .await
            .map_err(|err| transport_error(&self.id, err))
    }
}

#[async_trait]
impl ProviderClient for HttpTaskClient {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<RemoteTaskHandle, ProviderError> {
        let endpoint = self.url(&self.paths.submit);
        debug!(provider = %self.id, endpoint = %endpoint, "submitting generation");
        let response = self.send(self.request(Method::POST, &endpoint).json(request)).await?;
        let parsed: SubmitResponse = response_json_or_error(&self.id, response).await?;
        let task_id = parsed.task_id.trim();
        if task_id.is_empty() {
            return Err(ProviderError::invalid_response(format!(
                "{} returned an empty task id",
                self.id
            )));
        }
        Ok(RemoteTaskHandle::new(task_id))
    }

    async fn status(&self, handle: &RemoteTaskHandle) -> Result<StatusResponse, ProviderError> {
        let response = self.send(self.request(Method::GET, &self.status_url(handle))).await?;
        let parsed: StatusResponse = response_json_or_error(&self.id, response).await?;
        if !parsed.task_id.is_empty() && parsed.task_id != handle.as_str() {
            return Err(ProviderError::invalid_response(format!(
                "{} answered status for task {} while polling {handle}",
                self.id, parsed.task_id
            )));
        }
        Ok(parsed)
    }

    async fn fetch_result(&self, result: &ResultRef) -> Result<Vec<u8>, ProviderError> {
        if let Some(decoded) = decode_data_url(result.as_str()) {
            return decoded;
        }
        let response = self.send(self.request(Method::GET, &self.url(result.as_str()))).await?;
        response_bytes_or_error(&self.id, response).await
    }

    async fn quota(&self) -> Result<Quota, ProviderError> {
        let response = self.send(self.request(Method::GET, &self.url(&self.paths.quota))).await?;
        response_json_or_error(&self.id, response).await
    }

    async fn cancel(&self, handle: &RemoteTaskHandle) -> Result<(), ProviderError> {
        let response = self.send(self.request(Method::DELETE, &self.status_url(handle))).await?;
        response_bytes_or_error(&self.id, response).await.map(|_| ())
    }
}
