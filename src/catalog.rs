use crate::{
    config::Settings,
    error::{FetchError, FetchResult},
    model::{AssetBundle, AssetCatalog, AssetKind},
};
use log::{debug, info, warn};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};
use tokio::fs;

const STANDARD_FILE: &str = "models.json";
const XL_FILE: &str = "xl-models.json";
const BUNDLED_STANDARD: &str = include_str!("../data/models.json");
const BUNDLED_XL: &str = include_str!("../data/xl-models.json");

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogSource {
    Bundled,
    Directory(PathBuf),
}

/// A file to fetch, produced by resolving a catalog label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadTask {
    pub url: String,
    pub dest_dir: PathBuf,
    pub file_name: String,
    pub kind: AssetKind,
    pub bundle: String,
}

impl DownloadTask {
    pub fn destination(&self) -> PathBuf {
        self.dest_dir.join(&self.file_name)
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub tasks: Vec<DownloadTask>,
    pub unknown_labels: Vec<String>,
    pub warnings: Vec<String>,
}

/// Both catalog generations, each parsed on first use.
#[derive(Debug)]
pub struct CatalogService {
    source: CatalogSource,
    standard: OnceLock<Arc<AssetCatalog>>,
    xl: OnceLock<Arc<AssetCatalog>>,
}

impl CatalogService {
    pub fn new(settings: &Settings) -> Self {
        match &settings.catalog_dir {
            Some(dir) => Self::from_dir(dir),
            None => Self::bundled(),
        }
    }

    pub fn bundled() -> Self {
        Self::with_source(CatalogSource::Bundled)
    }

    pub fn from_dir(dir: &Path) -> Self {
        Self::with_source(CatalogSource::Directory(dir.to_path_buf()))
    }

    fn with_source(source: CatalogSource) -> Self {
        Self {
            source,
            standard: OnceLock::new(),
            xl: OnceLock::new(),
        }
    }

    pub fn source(&self) -> &CatalogSource {
        &self.source
    }

    pub fn is_loaded(&self, is_xl: bool) -> bool {
        self.cell(is_xl).get().is_some()
    }

    /// Returns the generation's catalog, reading it on first use. Concurrent first
    /// callers may both read the source; the first stored copy wins.
    pub async fn catalog(&self, is_xl: bool) -> FetchResult<Arc<AssetCatalog>> {
        let cell = self.cell(is_xl);
        if let Some(catalog) = cell.get() {
            return Ok(catalog.clone());
        }
        let loaded = Arc::new(self.load(is_xl).await?);
        Ok(cell.get_or_init(|| loaded).clone())
    }

    pub async fn bundles_for(
        &self,
        kind: AssetKind,
        is_xl: bool,
    ) -> FetchResult<Vec<AssetBundle>> {
        Ok(self.catalog(is_xl).await?.bundles(kind).to_vec())
    }

    pub async fn labels(&self, kind: AssetKind, is_xl: bool) -> FetchResult<Vec<String>> {
        Ok(self
            .catalog(is_xl)
            .await?
            .bundles(kind)
            .iter()
            .map(|bundle| bundle.label.clone())
            .collect())
    }

    /// Expands `labels` into per-file tasks targeting `dest_dir`. Unknown labels and
    /// files without a derivable name are reported, never raised.
    pub async fn resolve(
        &self,
        labels: &[String],
        kind: AssetKind,
        is_xl: bool,
        dest_dir: &Path,
    ) -> FetchResult<Resolution> {
        let catalog = self.catalog(is_xl).await?;
        let mut resolution = Resolution::default();
        let mut seen = HashSet::new();

        for label in labels {
            let label = label.trim();
            if label.is_empty() || !seen.insert(label.to_string()) {
                continue;
            }

            let Some(bundle) = catalog.find_bundle(kind, label) else {
                warn!("Unknown {kind} selection '{label}', skipping");
                resolution.unknown_labels.push(label.to_string());
                resolution
                    .warnings
                    .push(format!("unknown {kind} selection '{label}'"));
                continue;
            };

            for file in &bundle.files {
                match file.derived_file_name() {
                    Some(file_name) => resolution.tasks.push(DownloadTask {
                        url: file.url.trim().to_string(),
                        dest_dir: dest_dir.to_path_buf(),
                        file_name,
                        kind,
                        bundle: bundle.label.clone(),
                    }),
                    None => {
                        warn!("Cannot derive a file name for {} in '{label}'", file.url);
                        resolution
                            .warnings
                            .push(format!("no file name for {} in '{label}'", file.url));
                    }
                }
            }
        }

        debug!(
            "Resolved {} {kind} task(s) from {} label(s)",
            resolution.tasks.len(),
            labels.len()
        );
        Ok(resolution)
    }

    fn cell(&self, is_xl: bool) -> &OnceLock<Arc<AssetCatalog>> {
        if is_xl {
            &self.xl
        } else {
            &self.standard
        }
    }

    async fn load(&self, is_xl: bool) -> FetchResult<AssetCatalog> {
        let generation = if is_xl { "XL" } else { "standard" };
        match &self.source {
            CatalogSource::Bundled => {
                let text = if is_xl { BUNDLED_XL } else { BUNDLED_STANDARD };
                let catalog = parse_catalog(text).map_err(|err| {
                    FetchError::CatalogUnavailable(format!("bundled {generation} catalog: {err}"))
                })?;
                debug!("Using bundled {generation} catalog");
                Ok(catalog)
            }
            CatalogSource::Directory(dir) => {
                let path = dir.join(if is_xl { XL_FILE } else { STANDARD_FILE });
                let text = fs::read_to_string(&path).await.map_err(|err| {
                    FetchError::CatalogUnavailable(format!("failed to read {:?}: {err}", path))
                })?;
                let catalog = parse_catalog(&text).map_err(|err| {
                    FetchError::CatalogUnavailable(format!("failed to parse {:?}: {err}", path))
                })?;
                info!("Loaded {generation} catalog from {:?}", path);
                Ok(catalog)
            }
        }
    }
}

fn parse_catalog(text: &str) -> Result<AssetCatalog, serde_json::Error> {
    let catalog: AssetCatalog = serde_json::from_str(text)?;
    if catalog.is_empty() {
        warn!("Catalog contains no bundles");
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn bundled_catalogs_parse() {
        let service = CatalogService::bundled();
        for is_xl in [false, true] {
            let catalog = service.catalog(is_xl).await.unwrap();
            assert!(!catalog.model.is_empty());
            assert!(!catalog.lora.is_empty());
        }
    }

    #[tokio::test]
    async fn catalogs_load_lazily() {
        let service = CatalogService::bundled();
        assert!(!service.is_loaded(false));
        service.labels(AssetKind::Vae, false).await.unwrap();
        assert!(service.is_loaded(false));
        assert!(!service.is_loaded(true));
    }

    #[tokio::test]
    async fn anime_bundle_expands_to_two_files() {
        let service = CatalogService::bundled();
        let dest = Path::new("/content/A1111/models/Stable-diffusion");
        let resolution = service
            .resolve(
                &labels(&["1. Anime (by XpucT) + INP"]),
                AssetKind::Model,
                false,
                dest,
            )
            .await
            .unwrap();
        let destinations: Vec<_> = resolution.tasks.iter().map(|t| t.destination()).collect();
        assert_eq!(
            destinations,
            vec![
                dest.join("Anime_V2.safetensors"),
                dest.join("Anime_V2-inpainting.safetensors")
            ]
        );
        assert!(resolution.unknown_labels.is_empty());
    }

    #[tokio::test]
    async fn unknown_labels_are_reported_not_raised() {
        let service = CatalogService::bundled();
        let resolution = service
            .resolve(
                &labels(&["99. Nonexistent"]),
                AssetKind::Model,
                false,
                Path::new("/tmp"),
            )
            .await
            .unwrap();
        assert!(resolution.tasks.is_empty());
        assert_eq!(resolution.unknown_labels, vec!["99. Nonexistent"]);
        assert_eq!(resolution.warnings.len(), 1);
    }

    #[tokio::test]
    async fn repeated_labels_resolve_once() {
        let service = CatalogService::bundled();
        let label = "1. Anime (by XpucT) + INP";
        let resolution = service
            .resolve(&labels(&[label, label]), AssetKind::Model, false, Path::new("/tmp"))
            .await
            .unwrap();
        assert_eq!(resolution.tasks.len(), 2);
    }

    #[tokio::test]
    async fn directory_source_reads_and_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(STANDARD_FILE),
            r#"{"vae": [{"label": "1. Test VAE", "files": [{"url": "https://example.com/vae/test.vae.pt?dl=1"}]}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join(XL_FILE), "{ not json").unwrap();

        let service = CatalogService::from_dir(dir.path());
        let resolution = service
            .resolve(&labels(&["1. Test VAE"]), AssetKind::Vae, false, Path::new("/v"))
            .await
            .unwrap();
        assert_eq!(resolution.tasks[0].file_name, "test.vae.pt");

        let err = service.catalog(true).await.unwrap_err();
        assert!(matches!(err, FetchError::CatalogUnavailable(_)));
        assert!(!service.is_loaded(true));
    }

    #[tokio::test]
    async fn missing_directory_is_catalog_unavailable() {
        let service = CatalogService::from_dir(Path::new("/definitely/not/here"));
        assert!(matches!(
            service.labels(AssetKind::Model, false).await,
            Err(FetchError::CatalogUnavailable(_))
        ));
    }
}
