use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use iconsmith_contracts::errors::ProviderError;
use iconsmith_contracts::providers::{ProviderId, ProviderSelector};
use iconsmith_contracts::quota::{PolicyOverride, Quota};
use iconsmith_contracts::task::{RemoteTaskHandle, ResultRef};
use iconsmith_contracts::wire::{StatusResponse, SubmitRequest};
use image::{ImageFormat, Rgb, RgbImage};

use crate::client::{ProviderClient, ProviderClientRegistry};
use crate::context::GenerationContext;
use crate::quota::QuotaGate;

pub(crate) fn png_bytes(size: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(size, size, Rgb([40, 120, 200]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode test png");
    out.into_inner()
}

#[derive(Clone, Copy)]
pub(crate) enum WhenDrained {
    Complete,
    Pending,
}

/// Backend double that replays queued status answers and counts every call.
pub(crate) struct ScriptedClient {
    id: ProviderId,
    remaining: i64,
    quota_error: Option<ProviderError>,
    submit_error: Option<ProviderError>,
    statuses: Mutex<VecDeque<Result<StatusResponse, ProviderError>>>,
    when_drained: WhenDrained,
    status_delay: Duration,
    fetch: Result<Vec<u8>, ProviderError>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl ScriptedClient {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: ProviderId::new(id),
            remaining: 10,
            quota_error: None,
            submit_error: None,
            statuses: Mutex::new(VecDeque::new()),
            when_drained: WhenDrained::Complete,
            status_delay: Duration::ZERO,
            fetch: Ok(png_bytes(8)),
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_remaining(mut self, remaining: i64) -> Self {
        self.remaining = remaining;
        self
    }

    pub(crate) fn with_quota_error(mut self, err: ProviderError) -> Self {
        self.quota_error = Some(err);
        self
    }

    pub(crate) fn with_submit_error(mut self, err: ProviderError) -> Self {
        self.submit_error = Some(err);
        self
    }

    pub(crate) fn with_statuses<I>(self, statuses: I) -> Self
    where
        I: IntoIterator<Item = Result<StatusResponse, ProviderError>>,
    {
        if let Ok(mut queue) = self.statuses.lock() {
            queue.extend(statuses);
        }
        self
    }

    pub(crate) fn pending_forever(mut self) -> Self {
        self.when_drained = WhenDrained::Pending;
        self
    }

    pub(crate) fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    pub(crate) fn with_fetch(mut self, fetch: Result<Vec<u8>, ProviderError>) -> Self {
        self.fetch = fetch;
        self
    }

    pub(crate) fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn model(&self) -> Option<&str> {
        Some("scripted-model")
    }

    async fn submit(&self, _request: &SubmitRequest) -> Result<RemoteTaskHandle, ProviderError> {
        let call = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.submit_error {
            Some(err) => Err(err.clone()),
            None => Ok(RemoteTaskHandle::new(format!("{}-{call}", self.id))),
        }
    }

    async fn status(&self, handle: &RemoteTaskHandle) -> Result<StatusResponse, ProviderError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }
        let next = self.statuses.lock().ok().and_then(|mut queue| queue.pop_front());
        match next {
            Some(status) => status,
            None => Ok(match self.when_drained {
                WhenDrained::Complete => {
                    StatusResponse::completed(handle.as_str(), format!("https://x/{handle}.png"))
                }
                WhenDrained::Pending => StatusResponse::pending(handle.as_str(), None),
            }),
        }
    }

    async fn fetch_result(&self, _result: &ResultRef) -> Result<Vec<u8>, ProviderError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch.clone()
    }

    async fn quota(&self) -> Result<Quota, ProviderError> {
        if let Some(err) = &self.quota_error {
            return Err(err.clone());
        }
        Ok(Quota {
            remaining: self.remaining,
            plan: "pro".to_string(),
            limit: Some(100),
            reset_at: None,
        })
    }

    async fn cancel(&self, _handle: &RemoteTaskHandle) -> Result<(), ProviderError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Context where the first client answers quota and is the default provider.
pub(crate) fn context_with(clients: &[Arc<ScriptedClient>]) -> GenerationContext {
    let mut registry = ProviderClientRegistry::new();
    for client in clients {
        registry.register_arc(Arc::clone(client) as Arc<dyn ProviderClient>);
    }
    let primary: Arc<dyn ProviderClient> = Arc::clone(&clients[0]) as Arc<dyn ProviderClient>;
    let default_provider = primary.id().clone();
    GenerationContext::new(registry, QuotaGate::new(primary, PolicyOverride::none()))
        .with_selector(ProviderSelector::new(None, Some(default_provider)))
}
