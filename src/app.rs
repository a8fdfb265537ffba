use crate::{
    catalog::CatalogService,
    config::{ConfigStore, Settings},
    downloader::{AssetDownloader, ProgressEvent},
    extensions::ExtensionInstaller,
    scheduler::BatchScheduler,
    transport::{SystemTransport, Transport},
    webui::WebUiInstaller,
};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::{path::Path, sync::mpsc::Sender, sync::Arc};
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;

pub const APP_ID: &str = "webui-fetch";

/// Long-lived collaborators shared by every command.
#[derive(Clone)]
pub struct AppContext {
    pub runtime: Arc<Runtime>,
    pub settings: Arc<Settings>,
    pub catalog: Arc<CatalogService>,
    pub transport: Arc<dyn Transport>,
    pub cancel: CancellationToken,
}

impl AppContext {
    pub fn new(settings_path: Option<&Path>) -> Result<Self> {
        let runtime = Arc::new(
            Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| anyhow!("failed to create Tokio runtime: {err}"))?,
        );

        let store = ConfigStore::load(settings_path)?;
        info!("Using settings from {:?}", store.settings_path());
        let settings = Arc::new(store.into_settings());
        let catalog = Arc::new(CatalogService::new(&settings));
        let transport: Arc<dyn Transport> = Arc::new(SystemTransport::new(&settings)?);

        Ok(Self {
            runtime,
            settings,
            catalog,
            transport,
            cancel: CancellationToken::new(),
        })
    }

    /// Ctrl-C cancels the running batch; in-flight child processes are killed on drop.
    pub fn install_interrupt_handler(&self) {
        let cancel = self.cancel.clone();
        self.runtime.spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Interrupted, cancelling outstanding work");
                    cancel.cancel();
                }
                Err(err) => warn!("Failed to listen for Ctrl-C: {err}"),
            }
        });
    }

    pub fn scheduler(&self) -> BatchScheduler {
        BatchScheduler::new(self.settings.max_concurrency, self.cancel.clone())
    }

    pub fn asset_downloader(&self, progress: Option<Sender<ProgressEvent>>) -> AssetDownloader {
        let downloader = AssetDownloader::new(
            self.settings.clone(),
            self.catalog.clone(),
            self.transport.clone(),
            self.scheduler(),
        );
        match progress {
            Some(progress) => downloader.with_progress(progress),
            None => downloader,
        }
    }

    pub fn extension_installer(&self) -> ExtensionInstaller {
        ExtensionInstaller::new(self.transport.clone(), self.scheduler())
    }

    pub fn webui_installer(&self, progress: Option<Sender<ProgressEvent>>) -> WebUiInstaller {
        let installer = WebUiInstaller::new(
            self.settings.clone(),
            self.catalog.clone(),
            self.transport.clone(),
            self.scheduler(),
        );
        match progress {
            Some(progress) => installer.with_progress(progress),
            None => installer,
        }
    }
}
