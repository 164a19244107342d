use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

use async_trait::async_trait;
use iconsmith_contracts::errors::{ProviderError, ProviderErrorKind};
use iconsmith_contracts::providers::ProviderId;
use iconsmith_contracts::quota::Quota;
use iconsmith_contracts::task::{RemoteTaskHandle, ResultRef};
use iconsmith_contracts::wire::{StatusResponse, SubmitRequest};
use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::ProviderClient;

const RESULT_SCHEME: &str = "dryrun://";
const DEFAULT_STEPS: u32 = 3;

struct DryrunJob {
    prompt: String,
    size: u32,
    polls: u32,
}

/// Offline backend: reports a few pending polls, then renders a solid PNG tinted by the prompt.
pub struct DryrunClient {
    id: ProviderId,
    steps: u32,
    remaining: i64,
    jobs: Mutex<HashMap<String, DryrunJob>>,
}

impl Default for DryrunClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DryrunClient {
    pub fn new() -> Self {
        Self {
            id: ProviderId::dryrun(),
            steps: DEFAULT_STEPS,
            remaining: i64::MAX,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps.max(1);
        self
    }

    pub fn with_remaining(mut self, remaining: i64) -> Self {
        self.remaining = remaining;
        self
    }

    #[cfg(test)]
    fn job_count(&self) -> Result<usize, ProviderError> {
        Ok(self.jobs()?.len())
    }

    fn jobs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, DryrunJob>>, ProviderError> {
        self.jobs
            .lock()
            .map_err(|_| ProviderError::new(ProviderErrorKind::ServerError(500), "dryrun state poisoned"))
    }
}

#[async_trait]
impl ProviderClient for DryrunClient {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn model(&self) -> Option<&str> {
        Some("dryrun-solid")
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<RemoteTaskHandle, ProviderError> {
        let task_id = format!("dry-{}", uuid::Uuid::new_v4().simple());
        let size = request
            .size()
            .and_then(|size| u32::try_from(size).ok())
            .unwrap_or(256)
            .clamp(16, 2048);
        self.jobs()?.insert(
            task_id.clone(),
            DryrunJob {
                prompt: request.prompt.clone(),
                size,
                polls: 0,
            },
        );
        Ok(RemoteTaskHandle::new(task_id))
    }

    async fn status(&self, handle: &RemoteTaskHandle) -> Result<StatusResponse, ProviderError> {
        let mut jobs = self.jobs()?;
        let job = jobs.get_mut(handle.as_str()).ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::ServerError(404),
                format!("unknown dryrun task {handle}"),
            )
        })?;
        job.polls += 1;
        if job.polls >= self.steps {
            return Ok(StatusResponse::completed(
                handle.as_str(),
                format!("{RESULT_SCHEME}{handle}"),
            ));
        }
        Ok(StatusResponse::pending(
            handle.as_str(),
            Some(f64::from(job.polls) / f64::from(self.steps)),
        ))
    }

    async fn fetch_result(&self, result: &ResultRef) -> Result<Vec<u8>, ProviderError> {
        let task_id = result
            .as_str()
            .strip_prefix(RESULT_SCHEME)
            .ok_or_else(|| ProviderError::invalid_response(format!("not a dryrun result: {result}")))?;
        let (prompt, size) = {
            let jobs = self.jobs()?;
            let job = jobs.get(task_id).ok_or_else(|| {
                ProviderError::new(
                    ProviderErrorKind::ServerError(404),
                    format!("unknown dryrun result {result}"),
                )
            })?;
            (job.prompt.clone(), job.size)
        };
        let bytes = render_solid_png(&prompt, size)?;
        self.jobs()?.remove(task_id);
        Ok(bytes)
    }

    async fn quota(&self) -> Result<Quota, ProviderError> {
        Ok(Quota {
            remaining: self.remaining,
            plan: "dryrun".to_string(),
            limit: None,
            reset_at: None,
        })
    }

    async fn cancel(&self, handle: &RemoteTaskHandle) -> Result<(), ProviderError> {
        self.jobs()?.remove(handle.as_str());
        Ok(())
    }
}

fn render_solid_png(prompt: &str, size: u32) -> Result<Vec<u8>, ProviderError> {
    let (r, g, b) = color_from_prompt(prompt);
    let image = RgbImage::from_pixel(size, size, Rgb([r, g, b]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|err| ProviderError::invalid_response(format!("dryrun render failed: {err}")))?;
    Ok(out.into_inner())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}
