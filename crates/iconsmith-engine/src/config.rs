use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use iconsmith_contracts::providers::{ProviderId, DEFAULT_PROVIDER};
use iconsmith_contracts::quota::PolicyOverride;
use indexmap::IndexMap;
use serde::Deserialize;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(350);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const KNOWN_PROVIDERS: &[&str] = &["openai", "flux", "stability"];
/// Non-final progress must stay strictly below 1.0.
const MAX_PROGRESS_CEILING: f64 = 0.999;

/// Delay policy applied while the poll loop is absorbing transient errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    Fixed,
    Exponential { multiplier: f64, max_interval: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Fixed
    }
}

impl BackoffPolicy {
    pub fn exponential() -> Self {
        Self::Exponential {
            multiplier: 2.0,
            max_interval: Duration::from_secs(5),
        }
    }

    /// Wait before the next poll given how many transient errors happened in a row.
    pub fn delay(&self, base: Duration, consecutive_transient: u32) -> Duration {
        match self {
            Self::Fixed => base,
            Self::Exponential {
                multiplier,
                max_interval,
            } => {
                if consecutive_transient == 0 {
                    return base;
                }
                let factor = multiplier.max(1.0).powi(consecutive_transient.min(32) as i32);
                let next_ms = (base.as_millis() as f64 * factor).min(u64::MAX as f64) as u64;
                Duration::from_millis(next_ms).min((*max_interval).max(base))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_polls: u32,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_polls: polls_within(DEFAULT_POLL_TIMEOUT, DEFAULT_POLL_INTERVAL),
            timeout: DEFAULT_POLL_TIMEOUT,
            backoff: BackoffPolicy::Fixed,
        }
    }
}

/// Constants of the synthesized progress curve.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressConfig {
    pub quota_checked: f64,
    pub submitted: f64,
    pub window: f64,
    pub floor_step: f64,
    pub floor_cap: f64,
    pub ceiling: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            quota_checked: 0.05,
            submitted: 0.10,
            window: 0.65,
            floor_step: 0.03,
            floor_cap: 0.85,
            ceiling: 0.99,
        }
    }
}

impl ProgressConfig {
    /// Applies overrides, clamping each to `[0, 1]` and keeping
    /// `quota_checked <= submitted <= floor_cap <= ceiling < 1`.
    fn apply(&mut self, overrides: ProgressFile) {
        let unit = |value: Option<f64>, current: f64| {
            value
                .filter(|value| value.is_finite())
                .map(|value| value.clamp(0.0, 1.0))
                .unwrap_or(current)
        };
        self.quota_checked = unit(overrides.quota_checked, self.quota_checked);
        self.submitted = unit(overrides.submitted, self.submitted);
        self.window = unit(overrides.window, self.window);
        self.floor_step = unit(overrides.floor_step, self.floor_step);
        self.floor_cap = unit(overrides.floor_cap, self.floor_cap);
        self.ceiling = unit(overrides.ceiling, self.ceiling).min(MAX_PROGRESS_CEILING);

        self.floor_cap = self.floor_cap.min(self.ceiling);
        self.submitted = self.submitted.min(self.floor_cap);
        self.quota_checked = self.quota_checked.min(self.submitted);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchMode {
    #[default]
    Sequential,
    Concurrent { max_parallel: usize },
}

impl BatchMode {
    pub fn with_parallelism(parallel: usize) -> Self {
        if parallel <= 1 {
            Self::Sequential
        } else {
            Self::Concurrent {
                max_parallel: parallel,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointPaths {
    #[serde(default = "default_submit_path")]
    pub submit: String,
    #[serde(default = "default_status_path")]
    pub status: String,
    #[serde(default = "default_quota_path")]
    pub quota: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            submit: default_submit_path(),
            status: default_status_path(),
            quota: default_quota_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub id: ProviderId,
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub paths: EndpointPaths,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub poll: PollConfig,
    pub progress: ProgressConfig,
    pub batch: BatchMode,
    pub policy: PolicyOverride,
    pub providers: Vec<ProviderEndpoint>,
    pub routes: Option<IndexMap<String, ProviderId>>,
    pub default_provider: ProviderId,
    pub quota_provider: Option<ProviderId>,
    pub request_timeout: Duration,
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            progress: ProgressConfig::default(),
            batch: BatchMode::Sequential,
            policy: PolicyOverride::none(),
            providers: Vec::new(),
            routes: None,
            default_provider: ProviderId::new(DEFAULT_PROVIDER),
            quota_provider: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dry_run: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    /// Defaults overlaid with `ICONSMITH_*` values produced by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = lookup("ICONSMITH_POLL_INTERVAL_MS").and_then(|raw| raw.parse::<u64>().ok()) {
            config.poll.interval = Duration::from_millis(ms.clamp(100, 5_000));
        }
        if let Some(secs) = lookup("ICONSMITH_POLL_TIMEOUT_S").and_then(|raw| raw.parse::<f64>().ok()) {
            config.poll.timeout = Duration::from_secs_f64(secs.clamp(10.0, 600.0));
        }
        config.poll.max_polls = lookup("ICONSMITH_MAX_POLLS")
            .and_then(|raw| raw.parse::<u32>().ok())
            .map(|value| value.clamp(1, 10_000))
            .unwrap_or_else(|| polls_within(config.poll.timeout, config.poll.interval));
        if let Some(policy) = lookup("ICONSMITH_BACKOFF") {
            config.poll.backoff = match policy.to_ascii_lowercase().as_str() {
                "exponential" | "exp" => BackoffPolicy::exponential(),
                _ => BackoffPolicy::Fixed,
            };
        }
        if let Some(parallel) = lookup("ICONSMITH_BATCH_PARALLELISM").and_then(|raw| raw.parse::<usize>().ok()) {
            config.batch = BatchMode::with_parallelism(parallel.min(16));
        }
        if lookup("ICONSMITH_BYPASS_QUOTA")
            .map(|raw| is_truthy(&raw))
            .unwrap_or(false)
        {
            config.policy = PolicyOverride::bypass_quota(
                lookup("ICONSMITH_BYPASS_QUOTA_REASON").unwrap_or_default(),
            );
        }
        if let Some(secs) = lookup("ICONSMITH_REQUEST_TIMEOUT_S").and_then(|raw| raw.parse::<u64>().ok()) {
            config.request_timeout = request_timeout(secs);
        }
        let fraction = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<f64>().ok());
        config.progress.apply(ProgressFile {
            quota_checked: fraction("ICONSMITH_PROGRESS_QUOTA_CHECKED"),
            submitted: fraction("ICONSMITH_PROGRESS_SUBMITTED"),
            window: fraction("ICONSMITH_PROGRESS_WINDOW"),
            floor_step: fraction("ICONSMITH_PROGRESS_FLOOR_STEP"),
            floor_cap: fraction("ICONSMITH_PROGRESS_FLOOR_CAP"),
            ceiling: fraction("ICONSMITH_PROGRESS_CEILING"),
        });
        if let Some(provider) = lookup("ICONSMITH_DEFAULT_PROVIDER") {
            config.default_provider = ProviderId::new(provider);
        }
        config.quota_provider = lookup("ICONSMITH_QUOTA_PROVIDER").map(ProviderId::new);
        config.dry_run = lookup("ICONSMITH_DRY_RUN")
            .map(|raw| is_truthy(&raw))
            .unwrap_or(false);

        let shared_base = lookup("ICONSMITH_API_BASE");
        let shared_key = lookup("ICONSMITH_API_KEY");
        for name in KNOWN_PROVIDERS {
            let prefix = format!("ICONSMITH_{}", name.to_ascii_uppercase());
            let Some(api_base) = lookup(&format!("{prefix}_API_BASE")).or_else(|| shared_base.clone())
            else {
                continue;
            };
            config.providers.push(ProviderEndpoint {
                id: ProviderId::new(name),
                api_base: api_base.trim_end_matches('/').to_string(),
                api_key: lookup(&format!("{prefix}_API_KEY")).or_else(|| shared_key.clone()),
                model: lookup(&format!("{prefix}_MODEL")),
                paths: EndpointPaths::default(),
            });
        }
        config
    }

    /// Overlays a JSON config file on top of the current values.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        self.merge(file);
        Ok(())
    }

    fn merge(&mut self, file: ConfigFile) {
        if let Some(poll) = file.poll {
            if let Some(ms) = poll.interval_ms {
                self.poll.interval = Duration::from_millis(ms.clamp(100, 5_000));
            }
            if let Some(secs) = poll.timeout_s {
                self.poll.timeout = Duration::from_secs_f64(secs.clamp(10.0, 600.0));
            }
            self.poll.max_polls = poll
                .max_polls
                .map(|value| value.clamp(1, 10_000))
                .unwrap_or_else(|| polls_within(self.poll.timeout, self.poll.interval));
            if let Some(backoff) = poll.backoff {
                self.poll.backoff = match backoff {
                    BackoffFile::Fixed => BackoffPolicy::Fixed,
                    BackoffFile::Exponential {
                        multiplier,
                        max_interval_ms,
                    } => BackoffPolicy::Exponential {
                        multiplier: multiplier.unwrap_or(2.0).clamp(1.0, 10.0),
                        max_interval: Duration::from_millis(max_interval_ms.unwrap_or(5_000)),
                    },
                };
            }
        }
        if let Some(progress) = file.progress {
            self.progress.apply(progress);
        }
        if let Some(secs) = file.request_timeout_s {
            self.request_timeout = request_timeout(secs);
        }
        if let Some(parallel) = file.batch_parallelism {
            self.batch = BatchMode::with_parallelism(parallel.min(16));
        }
        if let Some(policy) = file.policy {
            self.policy = policy;
        }
        if let Some(default_provider) = file.default_provider {
            self.default_provider = ProviderId::new(default_provider);
        }
        if let Some(quota_provider) = file.quota_provider {
            self.quota_provider = Some(ProviderId::new(quota_provider));
        }
        if let Some(routes) = file.routes {
            self.routes = Some(
                routes
                    .into_iter()
                    .map(|(style, provider)| (style, ProviderId::new(provider)))
                    .collect(),
            );
        }
        for row in file.providers {
            let id = ProviderId::new(&row.id);
            let endpoint = ProviderEndpoint {
                id: id.clone(),
                api_base: row.api_base.trim_end_matches('/').to_string(),
                api_key: row.api_key.or_else(|| {
                    row.api_key_env
                        .as_deref()
                        .and_then(non_empty_env)
                }),
                model: row.model,
                paths: row.paths.unwrap_or_default(),
            };
            if let Some(existing) = self.providers.iter_mut().find(|existing| existing.id == id) {
                *existing = endpoint;
            } else {
                self.providers.push(endpoint);
            }
        }
    }

    pub fn endpoint(&self, id: &ProviderId) -> Option<&ProviderEndpoint> {
        self.providers.iter().find(|endpoint| &endpoint.id == id)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    poll: Option<PollFile>,
    progress: Option<ProgressFile>,
    request_timeout_s: Option<u64>,
    batch_parallelism: Option<usize>,
    policy: Option<PolicyOverride>,
    default_provider: Option<String>,
    quota_provider: Option<String>,
    routes: Option<IndexMap<String, String>>,
    #[serde(default)]
    providers: Vec<ProviderFile>,
}

#[derive(Debug, Default, Deserialize)]
struct PollFile {
    interval_ms: Option<u64>,
    timeout_s: Option<f64>,
    max_polls: Option<u32>,
    backoff: Option<BackoffFile>,
}

#[derive(Debug, Default, Deserialize)]
struct ProgressFile {
    quota_checked: Option<f64>,
    submitted: Option<f64>,
    window: Option<f64>,
    floor_step: Option<f64>,
    floor_cap: Option<f64>,
    ceiling: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum BackoffFile {
    Fixed,
    Exponential {
        multiplier: Option<f64>,
        max_interval_ms: Option<u64>,
    },
}

#[derive(Debug, Deserialize)]
struct ProviderFile {
    id: String,
    api_base: String,
    api_key: Option<String>,
    api_key_env: Option<String>,
    model: Option<String>,
    paths: Option<EndpointPaths>,
}

fn polls_within(timeout: Duration, interval: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    let polls = timeout.as_millis().div_ceil(interval_ms);
    u32::try_from(polls).unwrap_or(u32::MAX).max(1)
}

fn request_timeout(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(5, 300))
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_submit_path() -> String {
    "/v1/generations".to_string()
}

fn default_status_path() -> String {
    "/v1/generations/{taskId}".to_string()
}

fn default_quota_path() -> String {
    "/v1/quota".to_string()
}
