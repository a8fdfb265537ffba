use crate::{
    app::APP_ID,
    env_flags,
    error::{FetchError, FetchResult},
    layout::UiKind,
    model::AssetKind,
};
use anyhow::{Context, Result};
use directories::BaseDirs;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const SETTINGS_FILE: &str = "settings.json";
const DEFAULT_HOME: &str = "/content";
const DEFAULT_FORK_REPO: &str = "remphanostar/TrinityUI";
const DEFAULT_BRANCH: &str = "main";
const MIN_EXISTING_BYTES: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum SdVersion {
    #[default]
    #[serde(rename = "SD1.5", alias = "SD 1.5", alias = "sd1.5", alias = "1.5")]
    Sd15,
    #[serde(rename = "SDXL", alias = "sdxl", alias = "XL")]
    Sdxl,
}

impl SdVersion {
    pub fn is_xl(self) -> bool {
        matches!(self, SdVersion::Sdxl)
    }
}

/// Selection document produced by the configuration front-end.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct InstallConfig {
    pub webui_choice: String,
    #[serde(default)]
    pub sd_version: SdVersion,
    #[serde(default)]
    pub selected_models: Vec<String>,
    #[serde(default)]
    pub selected_vaes: Vec<String>,
    #[serde(default)]
    pub selected_controlnets: Vec<String>,
    #[serde(default)]
    pub selected_loras: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub civitai_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub huggingface_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ngrok_token: Option<String>,
}

impl InstallConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("failed to read install config {path:?}"))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse install config {path:?}"))
    }

    pub fn from_json(json: &str) -> FetchResult<Self> {
        serde_json::from_str(json)
            .map_err(|err| FetchError::InvalidInput(format!("malformed install config: {err}")))
    }

    pub fn ui(&self) -> FetchResult<UiKind> {
        self.webui_choice.parse()
    }

    pub fn is_xl(&self) -> bool {
        self.sd_version.is_xl()
    }

    pub fn selected(&self, kind: AssetKind) -> &[String] {
        match kind {
            AssetKind::Model => &self.selected_models,
            AssetKind::Vae => &self.selected_vaes,
            AssetKind::Controlnet => &self.selected_controlnets,
            AssetKind::Lora => &self.selected_loras,
        }
    }

    pub fn has_selection(&self) -> bool {
        AssetKind::all()
            .iter()
            .any(|kind| !self.selected(*kind).is_empty())
    }
}

/// Runtime settings, built once at startup and shared by reference.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub home_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venv_dir: Option<PathBuf>,
    pub env_name: String,
    pub fork_repo: String,
    pub branch: String,
    pub aria2c_bin: String,
    pub git_bin: String,
    pub max_concurrency: usize,
    pub accelerated_timeout_secs: u64,
    pub clone_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub min_existing_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_dir: Option<PathBuf>,
}

impl Settings {
    pub fn venv_path(&self) -> PathBuf {
        self.venv_dir
            .clone()
            .unwrap_or_else(|| self.home_dir.join("anxlight_venv"))
    }

    pub fn is_kaggle(&self) -> bool {
        self.env_name.eq_ignore_ascii_case("kaggle")
    }

    pub fn config_base_url(&self) -> String {
        format!(
            "https://raw.githubusercontent.com/{}/{}/__configs__",
            self.fork_repo.trim_matches('/'),
            self.branch
        )
    }

    pub fn accelerated_timeout(&self) -> Duration {
        Duration::from_secs(self.accelerated_timeout_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(home) = env_flags::home_override() {
            self.home_dir = home;
        }
        if let Some(env_name) = env_flags::env_name_override() {
            self.env_name = env_name;
        } else if env_flags::running_on_kaggle() {
            self.env_name = "Kaggle".to_string();
        }
        if let Some(dir) = env_flags::catalog_dir_override() {
            self.catalog_dir = Some(dir);
        }
        if let Some(limit) = env_flags::concurrency_override() {
            self.max_concurrency = limit;
        }
        self.max_concurrency = self.max_concurrency.max(1);
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home_dir: PathBuf::from(DEFAULT_HOME),
            venv_dir: None,
            env_name: "Colab".to_string(),
            fork_repo: DEFAULT_FORK_REPO.to_string(),
            branch: DEFAULT_BRANCH.to_string(),
            aria2c_bin: "aria2c".to_string(),
            git_bin: "git".to_string(),
            max_concurrency: 8,
            accelerated_timeout_secs: 600,
            clone_timeout_secs: 300,
            fetch_timeout_secs: 300,
            min_existing_bytes: MIN_EXISTING_BYTES,
            catalog_dir: None,
        }
    }
}

#[derive(Debug)]
pub struct ConfigStore {
    settings_path: PathBuf,
    settings: Settings,
}

impl ConfigStore {
    /// Reads settings from `explicit` or the per-user default location; a missing file
    /// yields defaults. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let settings_path = match explicit {
            Some(path) => path.to_path_buf(),
            None => default_settings_path(),
        };

        let mut settings = if settings_path.is_file() {
            let data = fs::read(&settings_path)
                .with_context(|| format!("failed to read settings file {settings_path:?}"))?;
            let parsed: Settings = serde_json::from_slice(&data)
                .with_context(|| format!("failed to parse settings from {settings_path:?}"))?;
            info!("Loaded settings from {:?}", settings_path);
            parsed
        } else {
            if explicit.is_some() {
                anyhow::bail!("settings file {settings_path:?} does not exist");
            }
            Settings::default()
        };
        settings.apply_env_overrides();

        Ok(Self {
            settings_path,
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn into_settings(self) -> Settings {
        self.settings
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }
}

fn default_settings_path() -> PathBuf {
    BaseDirs::new()
        .map(|base| base.data_local_dir().join(APP_ID).join(SETTINGS_FILE))
        .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_config_parses_front_end_document() {
        let config = InstallConfig::from_json(
            r#"{
                "webui_choice": "ComfyUI",
                "sd_version": "SDXL",
                "selected_models": ["1. Hassaku-XL [Anime] [V2.2] [XL]"],
                "selected_loras": [],
                "custom_args": "--listen",
                "tunnel_choice": "ngrok",
                "ngrok_token": "abc",
                "some_future_field": true
            }"#,
        )
        .unwrap();
        assert!(config.is_xl());
        assert_eq!(config.ui().unwrap(), UiKind::ComfyUI);
        assert_eq!(config.selected(AssetKind::Model).len(), 1);
        assert!(config.selected(AssetKind::Vae).is_empty());
        assert!(config.has_selection());
    }

    #[test]
    fn sd_version_defaults_to_sd15() {
        let config = InstallConfig::from_json(r#"{"webui_choice": "A1111"}"#).unwrap();
        assert_eq!(config.sd_version, SdVersion::Sd15);
        assert!(!config.has_selection());
    }

    #[test]
    fn unknown_sd_version_is_invalid_input() {
        let err = InstallConfig::from_json(r#"{"webui_choice": "A1111", "sd_version": "SD3"}"#)
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidInput(_)));
    }

    #[test]
    fn settings_file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"home_dir": "/kaggle/working", "env_name": "Kaggle"}"#).unwrap();

        let store = ConfigStore::load(Some(&path)).unwrap();
        let settings = store.settings();
        assert_eq!(settings.max_concurrency, 8);
        assert_eq!(settings.accelerated_timeout_secs, 600);
        assert_eq!(settings.min_existing_bytes, MIN_EXISTING_BYTES);
        assert_eq!(settings.fork_repo, DEFAULT_FORK_REPO);
        assert!(settings.is_kaggle());
    }

    #[test]
    fn explicit_missing_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigStore::load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn venv_defaults_under_home() {
        let settings = Settings {
            home_dir: PathBuf::from("/content"),
            ..Settings::default()
        };
        assert_eq!(settings.venv_path(), PathBuf::from("/content/anxlight_venv"));
        assert_eq!(
            settings.config_base_url(),
            "https://raw.githubusercontent.com/remphanostar/TrinityUI/main/__configs__"
        );
    }
}
