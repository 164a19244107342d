use std::sync::Arc;

use iconsmith_contracts::errors::GenerationError;
use iconsmith_contracts::quota::{PolicyOverride, Quota};
use tracing::{info, warn};

use crate::client::ProviderClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Granted(Quota),
    /// Generation proceeds without a confirmed allowance.
    Bypassed { quota: Option<Quota>, reason: String },
}

impl QuotaDecision {
    pub fn quota(&self) -> Option<&Quota> {
        match self {
            Self::Granted(quota) => Some(quota),
            Self::Bypassed { quota, .. } => quota.as_ref(),
        }
    }
}

/// Confirms the account can afford one more generation before anything is submitted.
///
/// Fails closed: an unreachable quota service blocks generation unless the
/// [`PolicyOverride`] explicitly bypasses the check.
#[derive(Clone)]
pub struct QuotaGate {
    source: Arc<dyn ProviderClient>,
    policy: PolicyOverride,
}

impl QuotaGate {
    pub fn new(source: Arc<dyn ProviderClient>, policy: PolicyOverride) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> &PolicyOverride {
        &self.policy
    }

    /// Current allowance without applying any policy.
    pub async fn fetch(&self) -> Result<Quota, GenerationError> {
        self.source
            .quota()
            .await
            .map_err(GenerationError::from_provider)
    }

    pub async fn check(&self) -> Result<QuotaDecision, GenerationError> {
        let fetched = self.fetch().await;
        if self.policy.quota_bypassed() {
            let reason = self.policy.reason().unwrap_or("unspecified").to_string();
            let quota = match fetched {
                Ok(quota) => Some(quota),
                Err(err) => {
                    warn!(error = %err, "quota lookup failed; continuing under bypass");
                    None
                }
            };
            warn!(
                reason = %reason,
                remaining = ?quota.as_ref().map(|quota| quota.remaining),
                "quota check bypassed"
            );
            return Ok(QuotaDecision::Bypassed { quota, reason });
        }

        let quota = fetched?;
        if quota.is_exhausted() {
            info!(plan = %quota.plan, remaining = quota.remaining, "generation quota exhausted");
            return Err(GenerationError::QuotaExceeded {
                plan: Some(quota.plan),
                limit: quota.limit,
            });
        }
        Ok(QuotaDecision::Granted(quota))
    }
}
