use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use iconsmith_contracts::errors::GenerationError;
use iconsmith_contracts::providers::ProviderId;
use iconsmith_contracts::request::GenerationRequest;
use iconsmith_contracts::task::ResultRef;
use iconsmith_contracts::wire::StatusResponse;
use image::ImageFormat;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::client::ProviderClient;

/// Local image transformation applied after download, e.g. background removal.
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;
    fn remove_background(&self, bytes: Vec<u8>) -> Result<Vec<u8>, GenerationError>;
}

#[derive(Clone, Serialize)]
pub struct GenerationResult {
    pub task_id: String,
    pub provider: ProviderId,
    pub model: String,
    pub prompt: String,
    pub revised_prompt: Option<String>,
    pub result_ref: ResultRef,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub format: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub sha256: String,
    pub completed_at: DateTime<Utc>,
}

impl GenerationResult {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.task_id, self.format)
    }
}

impl fmt::Debug for GenerationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationResult")
            .field("task_id", &self.task_id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("result_ref", &self.result_ref)
            .field("bytes", &self.bytes.len())
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

pub(crate) struct MaterializeJob<'a> {
    pub task_id: &'a str,
    pub provider: &'a ProviderId,
    pub prompt: &'a str,
    pub request: &'a GenerationRequest,
    pub status: &'a StatusResponse,
}

/// Downloads a finished task's image and turns it into a validated [`GenerationResult`].
#[derive(Clone, Default)]
pub struct ResultMaterializer {
    post_processor: Option<Arc<dyn PostProcessor>>,
}

impl ResultMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(processor);
        self
    }

    pub(crate) async fn materialize(
        &self,
        client: &dyn ProviderClient,
        job: MaterializeJob<'_>,
    ) -> Result<GenerationResult, GenerationError> {
        let result_ref = job
            .status
            .result_url()
            .map(ResultRef::new)
            .ok_or_else(|| GenerationError::InvalidResponse("completed task has no result reference".to_string()))?;
        let bytes = client
            .fetch_result(&result_ref)
            .await
            .map_err(GenerationError::from_provider)?;
        if bytes.is_empty() {
            return Err(GenerationError::InvalidResponse(format!(
                "empty result body at {result_ref}"
            )));
        }

        let processor = if job.request.remove_background {
            if self.post_processor.is_none() {
                debug!("no post-processor registered; keeping backend cutout");
            }
            self.post_processor.clone()
        } else {
            None
        };
        // decoding and cutout are CPU-bound
        let (bytes, probe) = tokio::task::spawn_blocking(move || -> Result<_, GenerationError> {
            let bytes = match processor {
                Some(processor) => {
                    debug!(processor = processor.name(), "removing background");
                    processor.remove_background(bytes)?
                }
                None => bytes,
            };
            let probe = probe_image(&bytes)?;
            Ok((bytes, probe))
        })
        .await
        .map_err(|err| GenerationError::InvalidResponse(format!("result processing aborted: {err}")))??;

        let model = job
            .status
            .model
            .clone()
            .filter(|model| !model.trim().is_empty())
            .or_else(|| client.model().map(str::to_string))
            .unwrap_or_else(|| job.provider.to_string());

        Ok(GenerationResult {
            task_id: job.task_id.to_string(),
            provider: job.provider.clone(),
            model,
            prompt: job.prompt.to_string(),
            revised_prompt: job
                .status
                .revised_prompt
                .clone()
                .filter(|prompt| !prompt.trim().is_empty()),
            result_ref,
            sha256: hex::encode(Sha256::digest(&bytes)),
            bytes,
            format: probe.extension,
            mime_type: probe.mime_type,
            width: probe.width,
            height: probe.height,
            completed_at: Utc::now(),
        })
    }
}

struct ImageProbe {
    extension: String,
    mime_type: String,
    width: u32,
    height: u32,
}

fn probe_image(bytes: &[u8]) -> Result<ImageProbe, GenerationError> {
    let format = image::guess_format(bytes)
        .map_err(|err| GenerationError::InvalidResponse(format!("result is not an image: {err}")))?;
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|err| GenerationError::InvalidResponse(format!("result image is corrupt: {err}")))?;
    Ok(ImageProbe {
        extension: extension_for(format).to_string(),
        mime_type: format.to_mime_type().to_string(),
        width: decoded.width(),
        height: decoded.height(),
    })
}

fn extension_for(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("bin")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use iconsmith_contracts::errors::GenerationError;
    use iconsmith_contracts::providers::ProviderId;
    use iconsmith_contracts::request::GenerationRequest;
    use iconsmith_contracts::wire::StatusResponse;

    use super::{MaterializeJob, PostProcessor, ResultMaterializer};
    use crate::testing::{png_bytes, ScriptedClient};

    struct Shrink;

    impl PostProcessor for Shrink {
        fn name(&self) -> &str {
            "shrink"
        }

        fn remove_background(&self, _bytes: Vec<u8>) -> Result<Vec<u8>, GenerationError> {
            Ok(png_bytes(4))
        }
    }

    async fn run(
        materializer: &ResultMaterializer,
        client: &ScriptedClient,
        request: &GenerationRequest,
        status: &StatusResponse,
    ) -> Result<super::GenerationResult, GenerationError> {
        materializer
            .materialize(
                client,
                MaterializeJob {
                    task_id: "task-1",
                    provider: &ProviderId::new("openai"),
                    prompt: "flat icon of gear",
                    request,
                    status,
                },
            )
            .await
    }

    #[tokio::test]
    async fn downloads_and_describes_the_image() -> anyhow::Result<()> {
        let client = ScriptedClient::new("openai");
        let mut status = StatusResponse::completed("remote-1", "https://x/img.png");
        status.revised_prompt = Some("a friendly gear".to_string());
        let result = run(
            &ResultMaterializer::new(),
            &client,
            &GenerationRequest::new("gear"),
            &status,
        )
        .await?;
        assert!(!result.bytes.is_empty());
        assert_eq!((result.width, result.height), (8, 8));
        assert_eq!(result.format, "png");
        assert_eq!(result.mime_type, "image/png");
        assert_eq!(result.sha256.len(), 64);
        assert_eq!(result.revised_prompt.as_deref(), Some("a friendly gear"));
        assert_eq!(result.model, "scripted-model");
        assert_eq!(result.file_name(), "task-1.png");
        assert_eq!(client.fetch_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn garbage_bytes_are_rejected() {
        let client = ScriptedClient::new("openai").with_fetch(Ok(b"definitely not an image".to_vec()));
        let status = StatusResponse::completed("remote-1", "https://x/img.png");
        let err = run(&ResultMaterializer::new(), &client, &GenerationRequest::new("gear"), &status)
            .await
            .err();
        assert_eq!(err.map(|err| err.code()), Some("invalid_response"));
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let client = ScriptedClient::new("openai").with_fetch(Ok(Vec::new()));
        let status = StatusResponse::completed("remote-1", "https://x/img.png");
        let err = run(&ResultMaterializer::new(), &client, &GenerationRequest::new("gear"), &status)
            .await
            .err();
        assert!(matches!(err, Some(GenerationError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn post_processor_runs_only_for_background_removal() -> anyhow::Result<()> {
        let client = ScriptedClient::new("openai");
        let status = StatusResponse::completed("remote-1", "https://x/img.png");
        let materializer = ResultMaterializer::new().with_post_processor(Arc::new(Shrink));

        let kept = run(&materializer, &client, &GenerationRequest::new("gear"), &status).await?;
        assert_eq!(kept.width, 8);

        let request = GenerationRequest::new("gear").with_remove_background(true);
        let cut = run(&materializer, &client, &request, &status).await?;
        assert_eq!(cut.width, 4);
        Ok(())
    }
}
