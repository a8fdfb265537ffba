//! End-to-end provisioning of one WebUI: the UI itself, its config files, its
//! extensions, and the selected assets, in that order.

use crate::{
    catalog::CatalogService,
    config::{InstallConfig, Settings},
    downloader::{AssetDownloader, ProgressEvent},
    error::{FetchError, FetchResult},
    extensions::ExtensionInstaller,
    layout::{UiKind, UiLayout, WebUiSource},
    scheduler::{BatchScheduler, BatchSummary, Job, Outcome},
    transport::{AcceleratorOptions, Transport},
};
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::{
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::{mpsc::Sender, Arc},
};
use zip::ZipArchive;

const UI_CLONE_DEPTH: u32 = 1;

#[derive(Debug)]
pub struct ProvisionReport {
    pub ui: UiKind,
    pub webui: Outcome,
    pub configs: BatchSummary,
    pub extensions: BatchSummary,
    pub assets: BatchSummary,
}

impl ProvisionReport {
    pub fn is_success(&self) -> bool {
        self.webui.is_success() && self.assets.is_success()
    }
}

pub struct WebUiInstaller {
    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
    scheduler: BatchScheduler,
    downloader: AssetDownloader,
}

impl WebUiInstaller {
    pub fn new(
        settings: Arc<Settings>,
        catalog: Arc<CatalogService>,
        transport: Arc<dyn Transport>,
        scheduler: BatchScheduler,
    ) -> Self {
        let downloader = AssetDownloader::new(
            settings.clone(),
            catalog,
            transport.clone(),
            scheduler.clone(),
        );
        Self {
            settings,
            transport,
            scheduler,
            downloader,
        }
    }

    pub fn with_progress(mut self, progress: Sender<ProgressEvent>) -> Self {
        self.downloader = self.downloader.with_progress(progress);
        self
    }

    pub fn layout(&self, ui: UiKind) -> UiLayout {
        UiLayout::new(ui, &self.settings.home_dir)
    }

    pub async fn provision(&self, config: &InstallConfig) -> FetchResult<ProvisionReport> {
        let ui = config.ui()?;
        let layout = self.layout(ui);
        info!("Provisioning {ui} under {:?}", layout.root());

        let webui = self.install_webui(&layout).await?;

        let configs = self.download_configs(&layout).await;
        if let Err(err) = configs.require_all() {
            warn!("{ui} config files: {err}");
        }
        self.check_cancelled()?;

        let extensions = self.install_extensions(&layout).await;
        self.check_cancelled()?;

        let assets = self.downloader.download_selected(config).await?;

        Ok(ProvisionReport {
            ui,
            webui,
            configs,
            extensions,
            assets,
        })
    }

    /// Fetches and unpacks (or clones) the UI. A present root directory is left alone.
    pub async fn install_webui(&self, layout: &UiLayout) -> FetchResult<Outcome> {
        let ui = layout.ui();
        let root = layout.root().to_path_buf();
        if root.exists() {
            info!("{ui} already present at {:?}", root);
            return Ok(Outcome::skipped(ui.name(), "already present").at(root));
        }

        let outcome = match ui.source() {
            WebUiSource::Archive { url } => self.install_archive(ui, &url, &root).await?,
            WebUiSource::Git { url } => {
                let transport = self.transport.clone();
                let dest = root.clone();
                self.run_single(
                    ui.name(),
                    async move { transport.clone_repository(&url, &dest, UI_CLONE_DEPTH).await },
                )
                .await
            }
        };

        if !outcome.is_success() {
            self.check_cancelled()?;
            return Err(FetchError::TransportFailure(format!(
                "{ui}: {}",
                outcome.message
            )));
        }
        info!("{ui} installed at {:?}", root);
        Ok(outcome)
    }

    async fn install_archive(&self, ui: UiKind, url: &str, root: &Path) -> FetchResult<Outcome> {
        let home = self.settings.home_dir.clone();
        let archive_name = format!("{}.zip", ui.name());
        let archive_path = home.join(&archive_name);
        let options = AcceleratorOptions::from_settings(&self.settings);

        let fetched = {
            let transport = self.transport.clone();
            let url = url.to_string();
            let name = archive_name.clone();
            self.run_single(&archive_name, async move {
                transport
                    .fetch_file_accelerated(&url, &home, &name, &options)
                    .await
            })
            .await
        };
        if !fetched.is_success() {
            return Ok(fetched);
        }

        let dest = root.to_path_buf();
        let source = archive_path.clone();
        let joined = tokio::task::spawn_blocking(move || extract_archive(&source, &dest)).await;

        if let Err(err) = tokio::fs::remove_file(&archive_path).await {
            warn!("Failed to remove {:?}: {err}", archive_path);
        }
        let extracted = joined
            .map_err(|err| FetchError::TransportFailure(format!("extraction task failed: {err}")))?;

        match extracted {
            Ok(entries) => Ok(Outcome::downloaded(
                ui.name(),
                format!("Unpacked {entries} file(s) from {archive_name}"),
            )
            .at(root.to_path_buf())),
            Err(err) => {
                if let Err(remove_err) = tokio::fs::remove_dir_all(root).await {
                    warn!("Failed to clean up {:?}: {remove_err}", root);
                }
                Ok(Outcome::failed(ui.name(), format!("{err:#}")).at(root.to_path_buf()))
            }
        }
    }

    pub async fn download_configs(&self, layout: &UiLayout) -> BatchSummary {
        let files = layout.config_files(&self.settings);
        let jobs = files
            .iter()
            .map(|file| {
                let dest = file.dest_dir.join(&file.file_name);
                let fetch = self
                    .transport
                    .fetch_file(&file.url, &file.dest_dir, &file.file_name);
                Job::new(file.file_name.clone(), fetch).keyed(dest)
            })
            .collect();

        let summary = BatchSummary::from_outcomes(self.scheduler.run(jobs).await);
        summary.log(&format!("{} config files", layout.ui()));
        summary
    }

    pub async fn install_extensions(&self, layout: &UiLayout) -> BatchSummary {
        let specs = layout.extension_specs(self.settings.is_kaggle());
        let installer = ExtensionInstaller::new(self.transport.clone(), self.scheduler.clone());
        let summary = installer
            .install_extensions(&layout.extensions_dir(), &specs)
            .await;
        summary.log(&format!("{} extensions", layout.ui()));
        summary
    }

    async fn run_single<F>(&self, label: &str, future: F) -> Outcome
    where
        F: std::future::Future<Output = Outcome> + Send,
    {
        let mut outcomes = self.scheduler.run(vec![Job::new(label, future)]).await;
        outcomes
            .pop()
            .unwrap_or_else(|| Outcome::failed(label, "no result"))
    }

    fn check_cancelled(&self) -> FetchResult<()> {
        if self.scheduler.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Unpacks `archive` into `dest`. Entries that would land outside `dest` abort the
/// extraction.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive).with_context(|| format!("failed to open {:?}", archive))?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("{:?} is not a valid zip archive", archive))?;
    fs::create_dir_all(dest).with_context(|| format!("failed to create directory {:?}", dest))?;

    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .with_context(|| format!("failed to read entry {index} of {:?}", archive))?;
        let Some(relative) = entry.enclosed_name().map(PathBuf::from) else {
            bail!("archive entry '{}' escapes the destination", entry.name());
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("failed to create directory {:?}", out_path))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {:?}", parent))?;
        }
        let mut out = File::create(&out_path)
            .with_context(|| format!("failed to create {:?}", out_path))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to extract {:?}", out_path))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("failed to set permissions on {:?}", out_path))?;
        }
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use async_trait::async_trait;
    use std::{
        io::Write,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use tokio_util::sync::CancellationToken;
    use zip::{write::FileOptions, CompressionMethod, ZipWriter};

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(io::Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// Serves a fixed archive for accelerated fetches and delegates the rest.
    struct ArchiveTransport {
        archive: Vec<u8>,
        archive_fetches: AtomicUsize,
        inner: RecordingTransport,
    }

    #[async_trait]
    impl Transport for ArchiveTransport {
        async fn fetch_file(&self, url: &str, dest_dir: &Path, file_name: &str) -> Outcome {
            self.inner.fetch_file(url, dest_dir, file_name).await
        }

        async fn fetch_file_accelerated(
            &self,
            url: &str,
            dest_dir: &Path,
            file_name: &str,
            options: &AcceleratorOptions,
        ) -> Outcome {
            if !file_name.ends_with(".zip") {
                return self
                    .inner
                    .fetch_file_accelerated(url, dest_dir, file_name, options)
                    .await;
            }
            self.archive_fetches.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(dest_dir).unwrap();
            let target = dest_dir.join(file_name);
            std::fs::write(&target, &self.archive).unwrap();
            Outcome::downloaded(file_name, "ok").at(target)
        }

        async fn clone_repository(&self, url: &str, dest_dir: &Path, depth: u32) -> Outcome {
            self.inner.clone_repository(url, dest_dir, depth).await
        }
    }

    fn installer(home: &Path, transport: Arc<dyn Transport>) -> WebUiInstaller {
        let settings = Arc::new(Settings {
            home_dir: home.to_path_buf(),
            venv_dir: Some(home.join("venv")),
            ..Settings::default()
        });
        WebUiInstaller::new(
            settings,
            Arc::new(CatalogService::bundled()),
            transport,
            BatchScheduler::new(4, CancellationToken::new()),
        )
    }

    #[test]
    fn extraction_rejects_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        std::fs::write(&archive, zip_bytes(&[("../escape.txt", b"x")])).unwrap();
        let dest = dir.path().join("out");

        assert!(extract_archive(&archive, &dest).is_err());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn extraction_recreates_nested_paths() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("ui.zip");
        std::fs::write(
            &archive,
            zip_bytes(&[("launch.py", b"print()"), ("modules/shared.py", b"x = 1")]),
        )
        .unwrap();
        let dest = dir.path().join("A1111");

        assert_eq!(extract_archive(&archive, &dest).unwrap(), 2);
        assert!(dest.join("modules/shared.py").is_file());
    }

    #[tokio::test]
    async fn archive_ui_is_unpacked_and_zip_removed() {
        let home = tempfile::tempdir().unwrap();
        let transport = Arc::new(ArchiveTransport {
            archive: zip_bytes(&[("webui.py", b"")]),
            archive_fetches: AtomicUsize::new(0),
            inner: RecordingTransport::default(),
        });
        let installer = installer(home.path(), transport.clone());
        let layout = installer.layout(UiKind::A1111);

        let outcome = installer.install_webui(&layout).await.unwrap();
        assert_eq!(outcome.status, crate::scheduler::OutcomeStatus::Downloaded);
        assert!(home.path().join("A1111/webui.py").is_file());
        assert!(!home.path().join("A1111.zip").exists());

        let again = installer.install_webui(&layout).await.unwrap();
        assert_eq!(again.status, crate::scheduler::OutcomeStatus::SkippedExisting);
        assert_eq!(transport.archive_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forge_is_cloned() {
        let home = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let installer = installer(home.path(), transport.clone());

        installer
            .install_webui(&installer.layout(UiKind::Forge))
            .await
            .unwrap();
        assert!(home.path().join("Forge").is_dir());
        assert_eq!(transport.clones.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_ui_fetch_is_a_transport_failure() {
        let home = tempfile::tempdir().unwrap();
        let transport = Arc::new(
            RecordingTransport::default().failing_on(
                "https://github.com/Panchovix/stable-diffusion-webui-reForge.git",
            ),
        );
        let installer = installer(home.path(), transport);

        let err = installer
            .install_webui(&installer.layout(UiKind::ReForge))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TransportFailure(_)));
    }

    #[tokio::test]
    async fn corrupt_archive_fails_and_removes_the_zip() {
        let home = tempfile::tempdir().unwrap();
        let transport = Arc::new(ArchiveTransport {
            archive: b"not a zip archive".to_vec(),
            archive_fetches: AtomicUsize::new(0),
            inner: RecordingTransport::default(),
        });
        let installer = installer(home.path(), transport);

        let err = installer
            .install_webui(&installer.layout(UiKind::A1111))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TransportFailure(_)), "{err}");
        assert!(!home.path().join("A1111.zip").exists());
        assert!(!home.path().join("A1111").exists());
    }

    #[tokio::test]
    async fn interrupted_ui_install_reports_cancellation() {
        let home = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let transport = Arc::new(RecordingTransport::default());
        let installer = WebUiInstaller::new(
            Arc::new(Settings {
                home_dir: home.path().to_path_buf(),
                ..Settings::default()
            }),
            Arc::new(CatalogService::bundled()),
            transport.clone(),
            BatchScheduler::new(4, cancel),
        );

        let err = installer
            .install_webui(&installer.layout(UiKind::Forge))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled), "{err}");
        assert_eq!(transport.clones.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provision_runs_every_stage() {
        let home = tempfile::tempdir().unwrap();
        let transport = Arc::new(ArchiveTransport {
            archive: zip_bytes(&[("main.py", b"")]),
            archive_fetches: AtomicUsize::new(0),
            inner: RecordingTransport::new(2 * 1024 * 1024),
        });
        let installer = installer(home.path(), transport.clone());
        let config = InstallConfig {
            webui_choice: "ComfyUI".into(),
            selected_vaes: vec!["1. Anime.vae".into()],
            ..InstallConfig::default()
        };

        let report = installer.provision(&config).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.configs.total, 4);
        assert_eq!(report.extensions.total, 11);
        assert!(home.path().join("ComfyUI/custom_nodes/ComfyUI-Manager").is_dir());
        assert!(home
            .path()
            .join("ComfyUI/user/default/comfy.settings.json")
            .is_file());
        assert_eq!(transport.archive_fetches.load(Ordering::SeqCst), 1);
    }
}
