use indexmap::IndexMap;

use super::{ProviderId, DEFAULT_PROVIDER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub provider: ProviderId,
    pub style: String,
    pub fallback_reason: Option<String>,
}

/// Maps a style tag to the provider that renders it best.
///
/// Holds only the routing table; selection is a pure lookup.
#[derive(Debug, Clone)]
pub struct ProviderSelector {
    routes: IndexMap<String, ProviderId>,
    default_provider: ProviderId,
}

impl Default for ProviderSelector {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl ProviderSelector {
    pub fn new(routes: Option<IndexMap<String, ProviderId>>, default_provider: Option<ProviderId>) -> Self {
        let routes = routes
            .unwrap_or_else(default_style_routes)
            .into_iter()
            .map(|(style, provider)| (normalize_style(&style), provider))
            .collect();
        Self {
            routes,
            default_provider: default_provider.unwrap_or_else(|| ProviderId::new(DEFAULT_PROVIDER)),
        }
    }

    /// Routes every style to one provider, e.g. the offline dry-run backend.
    pub fn pinned(provider: ProviderId) -> Self {
        Self {
            routes: IndexMap::new(),
            default_provider: provider,
        }
    }

    pub fn default_provider(&self) -> &ProviderId {
        &self.default_provider
    }

    pub fn routes(&self) -> impl Iterator<Item = (&str, &ProviderId)> {
        self.routes
            .iter()
            .map(|(style, provider)| (style.as_str(), provider))
    }

    pub fn select(&self, style: &str) -> ProviderSelection {
        let normalized = normalize_style(style);
        if let Some(provider) = self.routes.get(&normalized) {
            return ProviderSelection {
                provider: provider.clone(),
                style: normalized,
                fallback_reason: None,
            };
        }
        let fallback_reason = if normalized.is_empty() {
            "No style specified; using default provider.".to_string()
        } else {
            format!(
                "No provider route for style '{normalized}'; using default '{}'.",
                self.default_provider
            )
        };
        ProviderSelection {
            provider: self.default_provider.clone(),
            style: normalized,
            fallback_reason: Some(fallback_reason),
        }
    }
}

pub fn default_style_routes() -> IndexMap<String, ProviderId> {
    let mut routes = IndexMap::new();
    let mut insert = |style: &str, provider: &str| {
        routes.insert(style.to_string(), ProviderId::new(provider));
    };
    insert("flat", "openai");
    insert("glass", "openai");
    insert("gradient", "openai");
    insert("minimal", "openai");
    insert("3d", "flux");
    insert("skeuomorphic", "flux");
    insert("line", "stability");
    insert("pixel", "stability");
    routes
}

fn normalize_style(style: &str) -> String {
    style.trim().to_ascii_lowercase()
}
