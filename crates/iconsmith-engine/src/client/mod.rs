mod dryrun;
mod http;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use iconsmith_contracts::errors::{ProviderError, ProviderErrorKind};
use iconsmith_contracts::providers::ProviderId;
use iconsmith_contracts::quota::Quota;
use iconsmith_contracts::task::{RemoteTaskHandle, ResultRef};
use iconsmith_contracts::wire::{StatusResponse, SubmitRequest};
use serde::de::DeserializeOwned;

pub use dryrun::DryrunClient;
pub use http::HttpTaskClient;

/// One remote image-generation backend speaking the submit/poll/fetch contract.
///
/// Implementations hold no task state between calls; the orchestrator owns the handle.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn id(&self) -> &ProviderId;

    fn model(&self) -> Option<&str> {
        None
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<RemoteTaskHandle, ProviderError>;

    async fn status(&self, handle: &RemoteTaskHandle) -> Result<StatusResponse, ProviderError>;

    async fn fetch_result(&self, result: &ResultRef) -> Result<Vec<u8>, ProviderError>;

    async fn quota(&self) -> Result<Quota, ProviderError>;

    /// Best-effort remote cancellation of an abandoned task.
    async fn cancel(&self, _handle: &RemoteTaskHandle) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct ProviderClientRegistry {
    clients: BTreeMap<ProviderId, Arc<dyn ProviderClient>>,
}

impl ProviderClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: ProviderClient + 'static>(&mut self, client: C) {
        self.register_arc(Arc::new(client));
    }

    pub fn register_arc(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.id().clone(), client);
    }

    pub fn get(&self, id: &ProviderId) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        self.clients.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

pub(crate) async fn response_json_or_error<T: DeserializeOwned>(
    provider: &ProviderId,
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let bytes = response_bytes_or_error(provider, response).await?;
    serde_json::from_slice(&bytes).map_err(|err| {
        ProviderError::invalid_response(format!(
            "{provider} returned invalid JSON payload: {err}; body: {}",
            truncate_text(&String::from_utf8_lossy(&bytes), 256)
        ))
    })
}

pub(crate) async fn response_bytes_or_error(
    provider: &ProviderId,
    response: reqwest::Response,
) -> Result<Vec<u8>, ProviderError> {
    let code = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| transport_error(provider, err))?;
    if let Some(kind) = ProviderErrorKind::from_status(code) {
        return Err(ProviderError::new(
            kind,
            format!(
                "{provider} request failed ({code}): {}",
                truncate_text(&String::from_utf8_lossy(&bytes), 512)
            ),
        ));
    }
    Ok(bytes.to_vec())
}

pub(crate) fn transport_error(provider: &ProviderId, err: reqwest::Error) -> ProviderError {
    let message = format!("{provider} transport error: {err}");
    if err.is_decode() {
        return ProviderError::invalid_response(message);
    }
    if let Some(kind) = err.status().and_then(|status| ProviderErrorKind::from_status(status.as_u16())) {
        return ProviderError::new(kind, message);
    }
    // timeouts, refused connections and broken requests are all worth another poll
    ProviderError::network(message)
}

/// Decodes a `data:<mime>;base64,<payload>` reference. `None` when `raw` is not a data URL.
pub(crate) fn decode_data_url(raw: &str) -> Option<Result<Vec<u8>, ProviderError>> {
    let rest = raw.trim().strip_prefix("data:")?;
    let decoded = match rest.split_once(',') {
        Some((meta, payload)) if meta.ends_with(";base64") => BASE64
            .decode(payload.trim())
            .map_err(|err| ProviderError::invalid_response(format!("invalid base64 result: {err}"))),
        Some(_) => Err(ProviderError::invalid_response(
            "only base64 data URLs are supported",
        )),
        None => Err(ProviderError::invalid_response("malformed data URL")),
    };
    Some(decoded)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
