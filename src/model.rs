use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a downloadable asset; decides the target directory in a UI layout.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    #[serde(alias = "models", alias = "checkpoints")]
    Model,
    Vae,
    Controlnet,
    #[serde(alias = "loras")]
    Lora,
}

impl AssetKind {
    pub fn all() -> &'static [AssetKind] {
        use AssetKind::*;
        &[Model, Vae, Controlnet, Lora]
    }

    pub fn slug(&self) -> &'static str {
        match self {
            AssetKind::Model => "model",
            AssetKind::Vae => "vae",
            AssetKind::Controlnet => "controlnet",
            AssetKind::Lora => "lora",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug.trim().to_ascii_lowercase().as_str() {
            "model" | "models" | "checkpoints" => Some(AssetKind::Model),
            "vae" | "vaes" => Some(AssetKind::Vae),
            "controlnet" | "controlnets" => Some(AssetKind::Controlnet),
            "lora" | "loras" => Some(AssetKind::Lora),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AssetKind::Model => "Model",
            AssetKind::Vae => "VAE",
            AssetKind::Controlnet => "ControlNet",
            AssetKind::Lora => "LoRA",
        }
    }

    /// Directory under the UI root for the A1111 family of layouts.
    pub fn classic_subdir(&self) -> &'static str {
        match self {
            AssetKind::Model => "models/Stable-diffusion",
            AssetKind::Vae => "models/VAE",
            AssetKind::Controlnet => "models/ControlNet",
            AssetKind::Lora => "models/Lora",
        }
    }

    pub fn comfyui_subdir(&self) -> &'static str {
        match self {
            AssetKind::Model => "models/checkpoints",
            AssetKind::Vae => "models/vae",
            AssetKind::Controlnet => "models/controlnet",
            AssetKind::Lora => "models/loras",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AssetFile {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AssetFile {
    /// Catalog-provided name, or the URL tail with query and fragment stripped.
    pub fn derived_file_name(&self) -> Option<String> {
        if let Some(name) = self.name.as_deref().map(str::trim) {
            if !name.is_empty() {
                return Some(sanitize_file_name(name));
            }
        }

        file_name_from_url(&self.url).map(|name| sanitize_file_name(&name))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssetBundle {
    pub label: String,
    pub files: Vec<AssetFile>,
}

/// One generation (standard or XL) of the four bundle registries.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AssetCatalog {
    #[serde(default)]
    pub model: Vec<AssetBundle>,
    #[serde(default)]
    pub vae: Vec<AssetBundle>,
    #[serde(default)]
    pub controlnet: Vec<AssetBundle>,
    #[serde(default)]
    pub lora: Vec<AssetBundle>,
}

impl AssetCatalog {
    pub fn bundles(&self, kind: AssetKind) -> &[AssetBundle] {
        match kind {
            AssetKind::Model => &self.model,
            AssetKind::Vae => &self.vae,
            AssetKind::Controlnet => &self.controlnet,
            AssetKind::Lora => &self.lora,
        }
    }

    pub fn find_bundle(&self, kind: AssetKind, label: &str) -> Option<&AssetBundle> {
        let label = label.trim();
        self.bundles(kind)
            .iter()
            .find(|bundle| bundle.label == label)
    }

    pub fn is_empty(&self) -> bool {
        AssetKind::all()
            .iter()
            .all(|kind| self.bundles(*kind).is_empty())
    }

    pub fn counts(&self) -> [(AssetKind, usize); 4] {
        [
            (AssetKind::Model, self.model.len()),
            (AssetKind::Vae, self.vae.len()),
            (AssetKind::Controlnet, self.controlnet.len()),
            (AssetKind::Lora, self.lora.len()),
        ]
    }
}

pub fn file_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let without_query = trimmed
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or(trimmed);
    let last_segment = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    if last_segment.is_empty() || last_segment.contains(':') {
        return None;
    }
    Some(
        percent_decode_str(last_segment)
            .decode_utf8_lossy()
            .to_string(),
    )
}

pub fn sanitize_file_name(name: &str) -> String {
    let sanitized = name
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ if ch.is_control() => '_',
            _ => ch,
        })
        .collect::<String>();
    if sanitized.trim_matches(|c| c == '_' || c == '.').is_empty() {
        "download".to_string()
    } else {
        sanitized
    }
}

/// Repository directory name: URL basename with a trailing `.git` removed.
pub fn repo_dir_name(url: &str) -> Option<String> {
    let tail = url.trim().trim_end_matches('/').rsplit('/').next()?;
    let name = tail.strip_suffix(".git").unwrap_or(tail);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_name_wins_over_url_tail() {
        let file = AssetFile {
            url: "https://huggingface.co/XpucT/Anime/resolve/main/Anime_v2.safetensors".into(),
            name: Some("Anime_V2.safetensors".into()),
        };
        assert_eq!(file.derived_file_name().as_deref(), Some("Anime_V2.safetensors"));
    }

    #[test]
    fn url_tail_strips_query_and_decodes() {
        let file = AssetFile {
            url: "https://example.com/files/my%20model.safetensors?download=1".into(),
            name: None,
        };
        assert_eq!(file.derived_file_name().as_deref(), Some("my model.safetensors"));
    }

    #[test]
    fn url_without_path_has_no_name() {
        let file = AssetFile {
            url: "https://".into(),
            name: None,
        };
        assert_eq!(file.derived_file_name(), None);
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_file_name("../evil/name.bin"), ".._evil_name.bin");
        assert_eq!(sanitize_file_name(".."), "download");
    }

    #[test]
    fn repo_dir_name_strips_git_suffix() {
        assert_eq!(
            repo_dir_name("https://github.com/lllyasviel/stable-diffusion-webui-forge.git").as_deref(),
            Some("stable-diffusion-webui-forge")
        );
        assert_eq!(
            repo_dir_name("https://github.com/Bing-su/adetailer/").as_deref(),
            Some("adetailer")
        );
    }

    #[test]
    fn kind_slugs_round_trip_through_aliases() {
        assert_eq!(AssetKind::from_slug("loras"), Some(AssetKind::Lora));
        assert_eq!(AssetKind::from_slug("Checkpoints"), Some(AssetKind::Model));
        assert_eq!(AssetKind::from_slug("unet"), None);
    }
}
