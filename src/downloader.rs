use crate::{
    catalog::{CatalogService, DownloadTask},
    config::{InstallConfig, Settings},
    error::{FetchError, FetchResult},
    layout::UiLayout,
    model::AssetKind,
    scheduler::{BatchScheduler, BatchSummary, Job, Outcome},
    transport::{AcceleratorOptions, Transport},
};
use log::{debug, info, warn};
use serde::Serialize;
use std::{collections::HashSet, path::Path, sync::mpsc::Sender, sync::Arc};
use tokio::fs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Pending,
    Downloading,
    Success,
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub asset: String,
    pub status: AssetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Turns an install selection into files on disk under the chosen UI.
pub struct AssetDownloader {
    settings: Arc<Settings>,
    catalog: Arc<CatalogService>,
    transport: Arc<dyn Transport>,
    scheduler: BatchScheduler,
    progress: Option<Sender<ProgressEvent>>,
}

impl AssetDownloader {
    pub fn new(
        settings: Arc<Settings>,
        catalog: Arc<CatalogService>,
        transport: Arc<dyn Transport>,
        scheduler: BatchScheduler,
    ) -> Self {
        Self {
            settings,
            catalog,
            transport,
            scheduler,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Sender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Downloads every selected bundle. Returns `Err` only for an invalid selection,
    /// an unreadable catalog, or cancellation; per-file failures land in the summary.
    pub async fn download_selected(&self, config: &InstallConfig) -> FetchResult<BatchSummary> {
        let ui = config.ui()?;
        if !config.has_selection() {
            info!("No assets selected for {ui}");
            return Ok(BatchSummary::empty());
        }

        let layout = UiLayout::new(ui, &self.settings.home_dir);
        let is_xl = config.is_xl();
        let mut tasks = Vec::new();
        let mut warnings = Vec::new();

        for &kind in AssetKind::all() {
            let labels = config.selected(kind);
            if labels.is_empty() {
                continue;
            }
            let resolution = self
                .catalog
                .resolve(labels, kind, is_xl, &layout.asset_dir(kind))
                .await?;
            for label in &resolution.unknown_labels {
                self.emit(label, AssetStatus::Error, Some("not found in catalog".into()));
            }
            tasks.extend(resolution.tasks);
            warnings.extend(resolution.warnings);
        }

        let summary = self.download_tasks(tasks).await.with_warnings(warnings);
        summary.log(&format!("{ui} assets"));

        if self.scheduler.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        Ok(summary)
    }

    pub async fn download_tasks(&self, tasks: Vec<DownloadTask>) -> BatchSummary {
        let tasks = dedup_by_destination(tasks);
        if tasks.is_empty() {
            return BatchSummary::empty();
        }

        for task in &tasks {
            self.emit(&task.file_name, AssetStatus::Pending, None);
        }

        let options = AcceleratorOptions::from_settings(&self.settings);
        let jobs = tasks
            .iter()
            .map(|task| {
                Job::new(task.file_name.clone(), self.fetch_one(task, &options))
                    .keyed(task.destination())
            })
            .collect();

        BatchSummary::from_outcomes(self.scheduler.run(jobs).await)
    }

    async fn fetch_one(&self, task: &DownloadTask, options: &AcceleratorOptions) -> Outcome {
        let destination = task.destination();
        if let Some(size) = satisfied_size(&destination, self.settings.min_existing_bytes).await {
            info!("{} already present ({size} bytes), skipping", task.file_name);
            self.emit(&task.file_name, AssetStatus::Success, None);
            return Outcome::skipped(&task.file_name, "already present").at(destination);
        }

        debug!("Fetching {} ({}) from {}", task.file_name, task.bundle, task.url);
        self.emit(&task.file_name, AssetStatus::Downloading, None);
        let outcome = self
            .transport
            .fetch_file_accelerated(&task.url, &task.dest_dir, &task.file_name, options)
            .await;

        if outcome.is_success() {
            info!("{} -> {:?}: {}", task.url, destination, outcome.message);
            self.emit(&task.file_name, AssetStatus::Success, None);
        } else {
            warn!("{} -> {:?}: {}", task.url, destination, outcome.message);
            self.emit(
                &task.file_name,
                AssetStatus::Error,
                Some(outcome.message.clone()),
            );
        }
        outcome
    }

    fn emit(&self, asset: &str, status: AssetStatus, error: Option<String>) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(ProgressEvent {
                asset: asset.to_string(),
                status,
                error,
            });
        }
    }
}

/// First occurrence of each destination wins.
fn dedup_by_destination(tasks: Vec<DownloadTask>) -> Vec<DownloadTask> {
    let mut seen = HashSet::new();
    tasks
        .into_iter()
        .filter(|task| {
            let fresh = seen.insert(task.destination());
            if !fresh {
                debug!("Dropping duplicate target {:?}", task.destination());
            }
            fresh
        })
        .collect()
}

/// Size of a complete-looking file at `path`. A leftover `<name>.aria2` control file
/// marks an interrupted transfer that the accelerator should resume.
async fn satisfied_size(path: &Path, min_bytes: u64) -> Option<u64> {
    let meta = fs::metadata(path).await.ok()?;
    if !meta.is_file() || meta.len() <= min_bytes {
        return None;
    }
    let name = path.file_name()?.to_string_lossy();
    let control = path.with_file_name(format!("{name}.aria2"));
    if fs::try_exists(&control).await.unwrap_or(false) {
        debug!("{:?} has a pending control file, resuming", path);
        return None;
    }
    Some(meta.len())
}
