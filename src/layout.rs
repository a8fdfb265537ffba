use crate::{
    config::Settings,
    error::FetchError,
    model::{repo_dir_name, AssetKind},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

const ARCHIVE_BASE_URL: &str = "https://huggingface.co/NagisaNao/ANXETY/resolve/main";
const FORGE_REPO_URL: &str = "https://github.com/lllyasviel/stable-diffusion-webui-forge.git";
const REFORGE_REPO_URL: &str = "https://github.com/Panchovix/stable-diffusion-webui-reForge.git";

const A1111_EXTENSIONS: &[&str] = &[
    "https://github.com/anxety-solo/webui_timer timer",
    "https://github.com/anxety-solo/anxety-theme",
    "https://github.com/anxety-solo/sd-civitai-browser-plus Civitai-Browser-Plus",
    "https://github.com/gutris1/sd-image-viewer Image-Viewer",
    "https://github.com/gutris1/sd-image-info Image-Info",
    "https://github.com/gutris1/sd-hub SD-Hub",
    "https://github.com/Bing-su/adetailer",
    "https://github.com/Haoming02/sd-forge-couple SD-Couple",
    "https://github.com/hako-mikan/sd-webui-regional-prompter Regional-Prompter",
];

const CLASSIC_EXTENSIONS: &[&str] = &[
    "https://github.com/anxety-solo/webui_timer timer",
    "https://github.com/anxety-solo/anxety-theme",
    "https://github.com/anxety-solo/sd-civitai-browser-plus Civitai-Browser-Plus",
    "https://github.com/gutris1/sd-image-info Image-Info",
    "https://github.com/gutris1/sd-hub SD-Hub",
    "https://github.com/Bing-su/adetailer",
    "https://github.com/Haoming02/sd-forge-couple SD-Couple",
    "https://github.com/hako-mikan/sd-webui-regional-prompter Regional-Prompter",
];

// Forge and ReForge ship ADetailer and Forge-Couple built in.
const FORGE_EXTENSIONS: &[&str] = &[
    "https://github.com/anxety-solo/webui_timer timer",
    "https://github.com/anxety-solo/anxety-theme",
    "https://github.com/anxety-solo/sd-civitai-browser-plus Civitai-Browser-Plus",
    "https://github.com/gutris1/sd-image-viewer Image-Viewer",
    "https://github.com/gutris1/sd-image-info Image-Info",
    "https://github.com/gutris1/sd-hub SD-Hub",
    "https://github.com/hako-mikan/sd-webui-regional-prompter Regional-Prompter",
];

const COMFYUI_NODES: &[&str] = &[
    "https://github.com/Fannovel16/comfyui_controlnet_aux",
    "https://github.com/Kosinkadink/ComfyUI-Advanced-ControlNet",
    "https://github.com/hayden-fr/ComfyUI-Model-Manager",
    "https://github.com/jags111/efficiency-nodes-comfyui",
    "https://github.com/ltdrdata/ComfyUI-Impact-Pack",
    "https://github.com/ltdrdata/ComfyUI-Impact-Subpack",
    "https://github.com/ltdrdata/ComfyUI-Manager",
    "https://github.com/pythongosssss/ComfyUI-Custom-Scripts",
    "https://github.com/pythongosssss/ComfyUI-WD14-Tagger",
    "https://github.com/ssitu/ComfyUI_UltimateSDUpscale",
    "https://github.com/WASasquatch/was-node-suite-comfyui",
];

const KAGGLE_EXTENSION: &str = "https://github.com/anxety-solo/sd-encrypt-image Encrypt-Image";

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum UiKind {
    A1111,
    ComfyUI,
    Forge,
    ReForge,
    Classic,
    #[serde(rename = "SD-UX")]
    SdUx,
}

impl UiKind {
    pub fn all() -> &'static [UiKind] {
        use UiKind::*;
        &[A1111, ComfyUI, Forge, ReForge, Classic, SdUx]
    }

    pub fn name(self) -> &'static str {
        match self {
            UiKind::A1111 => "A1111",
            UiKind::ComfyUI => "ComfyUI",
            UiKind::Forge => "Forge",
            UiKind::ReForge => "ReForge",
            UiKind::Classic => "Classic",
            UiKind::SdUx => "SD-UX",
        }
    }

    pub fn is_comfy(self) -> bool {
        matches!(self, UiKind::ComfyUI)
    }

    pub fn source(self) -> WebUiSource {
        match self {
            UiKind::Forge => WebUiSource::Git {
                url: FORGE_REPO_URL.to_string(),
            },
            UiKind::ReForge => WebUiSource::Git {
                url: REFORGE_REPO_URL.to_string(),
            },
            other => WebUiSource::Archive {
                url: format!("{ARCHIVE_BASE_URL}/{}.zip", other.name()),
            },
        }
    }

    /// Python minor version the UI's venv uses, when it ships the gradio tunnel shim.
    fn tunnel_python(self) -> Option<&'static str> {
        match self {
            UiKind::A1111 | UiKind::ReForge | UiKind::SdUx => Some("3.10"),
            UiKind::Classic => Some("3.11"),
            UiKind::Forge | UiKind::ComfyUI => None,
        }
    }

    fn extension_table(self) -> &'static [&'static str] {
        match self {
            UiKind::A1111 => A1111_EXTENSIONS,
            UiKind::Classic => CLASSIC_EXTENSIONS,
            UiKind::Forge | UiKind::ReForge => FORGE_EXTENSIONS,
            UiKind::ComfyUI => COMFYUI_NODES,
            UiKind::SdUx => &[],
        }
    }

    fn takes_kaggle_extension(self) -> bool {
        matches!(self, UiKind::A1111 | UiKind::Classic | UiKind::ReForge)
    }
}

impl FromStr for UiKind {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        UiKind::all()
            .iter()
            .copied()
            .find(|ui| ui.name().eq_ignore_ascii_case(trimmed))
            .or_else(|| match trimmed.to_ascii_lowercase().as_str() {
                "automatic1111" | "a1111-webui" => Some(UiKind::A1111),
                "sdux" | "sd_ux" => Some(UiKind::SdUx),
                _ => None,
            })
            .ok_or_else(|| {
                FetchError::InvalidInput(format!(
                    "unknown WebUI choice '{trimmed}' (expected one of {})",
                    UiKind::all()
                        .iter()
                        .map(|ui| ui.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

impl fmt::Display for UiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebUiSource {
    Archive { url: String },
    Git { url: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionSpec {
    pub url: String,
    pub dir_name: String,
}

impl ExtensionSpec {
    pub fn new(url: impl Into<String>, dir_name: Option<&str>) -> Option<Self> {
        let url = url.into();
        let dir_name = match dir_name.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => repo_dir_name(&url)?,
        };
        Some(Self { url, dir_name })
    }

    /// Parses the `"<url> [dir]"` table form.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let url = parts.next()?;
        Self::new(url, parts.next())
    }
}

/// A small file fetched with the plain transport: `(url, dir, file name)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigFile {
    pub url: String,
    pub dest_dir: PathBuf,
    pub file_name: String,
}

/// Directory conventions of one installed WebUI.
#[derive(Clone, Debug)]
pub struct UiLayout {
    ui: UiKind,
    root: PathBuf,
}

impl UiLayout {
    pub fn new(ui: UiKind, home: &Path) -> Self {
        Self {
            ui,
            root: home.join(ui.name()),
        }
    }

    pub fn ui(&self) -> UiKind {
        self.ui
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn asset_dir(&self, kind: AssetKind) -> PathBuf {
        let subdir = if self.ui.is_comfy() {
            kind.comfyui_subdir()
        } else {
            kind.classic_subdir()
        };
        self.root.join(subdir)
    }

    pub fn extensions_dir(&self) -> PathBuf {
        if self.ui.is_comfy() {
            self.root.join("custom_nodes")
        } else {
            self.root.join("extensions")
        }
    }

    pub fn extension_specs(&self, kaggle: bool) -> Vec<ExtensionSpec> {
        let mut specs: Vec<ExtensionSpec> = self
            .ui
            .extension_table()
            .iter()
            .filter_map(|line| ExtensionSpec::parse(line))
            .collect();
        if kaggle && self.ui.takes_kaggle_extension() {
            specs.extend(ExtensionSpec::parse(KAGGLE_EXTENSION));
        }
        specs
    }

    pub fn config_files(&self, settings: &Settings) -> Vec<ConfigFile> {
        let base = settings.config_base_url();
        let ui_name = self.ui.name();
        let root = self.root.clone();
        let file = |path: &str, dir: PathBuf| {
            let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
            ConfigFile {
                url: format!("{base}/{path}"),
                dest_dir: dir,
                file_name,
            }
        };

        let mut files = match self.ui {
            UiKind::ComfyUI => {
                let user = root.join("user").join("default");
                vec![
                    file(&format!("{ui_name}/install-deps.py"), root.clone()),
                    file(&format!("{ui_name}/comfy.settings.json"), user.clone()),
                    file(
                        &format!("{ui_name}/Comfy-Manager/config.ini"),
                        user.join("ComfyUI-Manager"),
                    ),
                    file(
                        &format!("{ui_name}/workflows/anxety-workflow.json"),
                        user.join("workflows"),
                    ),
                ]
            }
            UiKind::Classic => vec![
                file(&format!("{ui_name}/config.json"), root.clone()),
                file(&format!("{ui_name}/ui-config.json"), root.clone()),
                file("styles.csv", root.clone()),
                file("user.css", root.clone()),
                file("notification.mp3", root.clone()),
            ],
            UiKind::A1111 | UiKind::Forge | UiKind::ReForge | UiKind::SdUx => vec![
                file("styles.csv", root.clone()),
                file("user.css", root.clone()),
                file("card-no-preview.png", root.join("html")),
                file("notification.mp3", root.clone()),
            ],
        };

        if let Some(python) = self.ui.tunnel_python() {
            let site_packages = settings
                .venv_path()
                .join("lib")
                .join(format!("python{python}"))
                .join("site-packages")
                .join("gradio_tunneling");
            files.push(ConfigFile {
                url: format!("{base}/gradio-tunneling.py"),
                dest_dir: site_packages,
                file_name: "main.py".to_string(),
            });
        }

        files
    }
}
