use std::sync::Arc;

use anyhow::{bail, Context, Result};
use iconsmith_contracts::prompt::PromptComposer;
use iconsmith_contracts::providers::{ProviderId, ProviderSelector};

use crate::client::{DryrunClient, HttpTaskClient, ProviderClient, ProviderClientRegistry};
use crate::config::{BatchMode, EngineConfig, PollConfig, ProgressConfig};
use crate::materialize::ResultMaterializer;
use crate::quota::QuotaGate;

/// Everything a generation task needs, shared read-only between tasks.
#[derive(Clone)]
pub struct GenerationContext {
    clients: ProviderClientRegistry,
    selector: ProviderSelector,
    composer: PromptComposer,
    quota: QuotaGate,
    materializer: ResultMaterializer,
    poll: PollConfig,
    progress: ProgressConfig,
    batch: BatchMode,
}

impl GenerationContext {
    pub fn new(clients: ProviderClientRegistry, quota: QuotaGate) -> Self {
        Self {
            clients,
            selector: ProviderSelector::default(),
            composer: PromptComposer::new(),
            quota,
            materializer: ResultMaterializer::new(),
            poll: PollConfig::default(),
            progress: ProgressConfig::default(),
            batch: BatchMode::Sequential,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut clients = ProviderClientRegistry::new();
        let selector = if config.dry_run {
            clients.register(DryrunClient::new());
            ProviderSelector::pinned(ProviderId::dryrun())
        } else {
            for endpoint in &config.providers {
                let client = HttpTaskClient::new(endpoint, config.request_timeout)
                    .with_context(|| format!("failed to initialize provider '{}'", endpoint.id))?;
                clients.register(client);
            }
            if clients.is_empty() {
                bail!("no provider endpoints configured; set ICONSMITH_API_BASE or use dry-run mode");
            }
            ProviderSelector::new(config.routes.clone(), Some(config.default_provider.clone()))
        };

        let quota_id = if config.dry_run {
            ProviderId::dryrun()
        } else {
            config
                .quota_provider
                .clone()
                .unwrap_or_else(|| selector.default_provider().clone())
        };
        let source = clients
            .get(&quota_id)
            .with_context(|| format!("quota provider '{quota_id}' is not configured"))?;

        Ok(Self::new(clients, QuotaGate::new(source, config.policy.clone()))
            .with_selector(selector)
            .with_poll_config(config.poll.clone())
            .with_progress_config(config.progress.clone())
            .with_batch_mode(config.batch))
    }

    pub fn with_selector(mut self, selector: ProviderSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_materializer(mut self, materializer: ResultMaterializer) -> Self {
        self.materializer = materializer;
        self
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_progress_config(mut self, progress: ProgressConfig) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_batch_mode(mut self, batch: BatchMode) -> Self {
        self.batch = batch;
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn client(&self, id: &ProviderId) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(id)
    }

    pub fn clients(&self) -> &ProviderClientRegistry {
        &self.clients
    }

    pub fn selector(&self) -> &ProviderSelector {
        &self.selector
    }

    pub fn composer(&self) -> &PromptComposer {
        &self.composer
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    pub fn materializer(&self) -> &ResultMaterializer {
        &self.materializer
    }

    pub fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    pub fn progress_config(&self) -> &ProgressConfig {
        &self.progress
    }

    pub fn batch_mode(&self) -> BatchMode {
        self.batch
    }
}
