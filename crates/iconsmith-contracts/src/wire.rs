use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::request::GenerationRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl SubmitRequest {
    /// Builds the submit body from a request and the already composed prompt.
    pub fn for_generation(request: &GenerationRequest, prompt: String, model: Option<&str>) -> Self {
        let mut parameters = Map::new();
        parameters.insert("size".to_string(), json!(request.size));
        parameters.insert("quality".to_string(), json!(request.quality.as_str()));
        parameters.insert(
            "remove_background".to_string(),
            json!(request.remove_background),
        );
        if let Some(scheme) = request
            .color_scheme
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            parameters.insert("color_scheme".to_string(), json!(scheme));
        }
        if !request.symbols.is_empty() {
            parameters.insert("symbols".to_string(), json!(request.symbols));
        }
        if let Some(model) = model {
            parameters.insert("model".to_string(), json!(model));
        }
        let style = Some(request.style.trim().to_string()).filter(|value| !value.is_empty());
        Self {
            prompt,
            style,
            parameters,
        }
    }

    pub fn size(&self) -> Option<u64> {
        self.parameters.get("size").and_then(Value::as_u64)
    }

    pub fn quality(&self) -> Option<&str> {
        self.parameters.get("quality").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(rename = "taskId", alias = "task_id", alias = "id")]
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatusKind {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RemoteStatusKind {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "taskId", alias = "task_id", default)]
    pub task_id: String,
    pub status: RemoteStatusKind,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(rename = "resultURL", alias = "result_url", default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "revisedPrompt", alias = "revised_prompt", default)]
    pub revised_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl StatusResponse {
    pub fn pending(task_id: impl Into<String>, progress: Option<f64>) -> Self {
        Self {
            task_id: task_id.into(),
            status: RemoteStatusKind::Pending,
            progress,
            result_url: None,
            error: None,
            revised_prompt: None,
            model: None,
        }
    }

    pub fn completed(task_id: impl Into<String>, result_url: impl Into<String>) -> Self {
        Self {
            status: RemoteStatusKind::Completed,
            result_url: Some(result_url.into()),
            ..Self::pending(task_id, Some(1.0))
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: RemoteStatusKind::Failed,
            error: Some(error.into()),
            ..Self::pending(task_id, None)
        }
    }

    /// Backend progress if it is a usable fraction.
    pub fn usable_progress(&self) -> Option<f64> {
        self.progress
            .filter(|value| value.is_finite() && (0.0..=1.0).contains(value))
    }

    pub fn result_url(&self) -> Option<&str> {
        self.result_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}
