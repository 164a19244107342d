use crate::request::{GenerationRequest, Quality};

const STYLE_DESCRIPTORS: &[(&str, &str)] = &[
    ("flat", "flat vector app icon with simple geometric shapes"),
    ("glass", "glassmorphism app icon with frosted translucent layers"),
    ("gradient", "app icon with smooth vibrant gradients"),
    ("3d", "glossy 3D rendered app icon with soft studio lighting"),
    ("skeuomorphic", "skeuomorphic app icon with realistic textures"),
    ("line", "minimal line-art icon with consistent stroke width"),
    ("pixel", "pixel-art icon on a crisp grid"),
    ("minimal", "minimalist app icon with generous negative space"),
];

/// Turns raw user input plus request parameters into the final backend prompt.
///
/// Pure: the same request always yields the same prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptComposer;

impl PromptComposer {
    pub fn new() -> Self {
        Self
    }

    pub fn compose(&self, request: &GenerationRequest) -> String {
        let subject = collapse_whitespace(&request.prompt);
        let mut parts = vec![format!("{} of {}", style_descriptor(&request.style), subject)];

        let symbols = request
            .symbols
            .iter()
            .map(|symbol| symbol.trim())
            .filter(|symbol| !symbol.is_empty())
            .collect::<Vec<&str>>();
        if !symbols.is_empty() {
            parts.push(format!("incorporating the symbols {}", symbols.join(", ")));
        }

        if let Some(scheme) = request
            .color_scheme
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            parts.push(format!("using a {scheme} color scheme"));
        }

        parts.push("centered composition".to_string());
        if request.remove_background {
            parts.push("isolated on a plain solid background for easy cutout".to_string());
        }
        if request.quality == Quality::High {
            parts.push("highly detailed, sharp edges".to_string());
        }
        parts.push(format!("{0}x{0}", request.size));
        parts.join(", ")
    }
}

fn style_descriptor(style: &str) -> String {
    let normalized = style.trim().to_ascii_lowercase();
    STYLE_DESCRIPTORS
        .iter()
        .find(|(tag, _)| *tag == normalized)
        .map(|(_, descriptor)| descriptor.to_string())
        .unwrap_or_else(|| {
            if normalized.is_empty() {
                "app icon".to_string()
            } else {
                format!("{normalized} style app icon")
            }
        })
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<&str>>().join(" ")
}
