use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub remaining: i64,
    pub plan: String,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default, rename = "resetAt", alias = "reset_at")]
    pub reset_at: Option<String>,
}

impl Quota {
    pub fn is_exhausted(&self) -> bool {
        self.remaining <= 0
    }
}

/// Explicit switch that lets a deployment generate without quota confirmation.
///
/// Off unless constructed with [`PolicyOverride::bypass_quota`], which requires a reason so
/// every bypass can be traced back in the logs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    bypass_quota: bool,
    #[serde(default)]
    reason: Option<String>,
}

impl PolicyOverride {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn bypass_quota(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = reason.trim();
        Self {
            bypass_quota: true,
            reason: Some(if reason.is_empty() {
                "unspecified".to_string()
            } else {
                reason.to_string()
            }),
        }
    }

    pub fn quota_bypassed(&self) -> bool {
        self.bypass_quota
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}
