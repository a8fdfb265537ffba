use crate::{
    layout::ExtensionSpec,
    scheduler::{BatchScheduler, BatchSummary, Job, Outcome},
    transport::Transport,
};
use log::{info, warn};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;

const CLONE_DEPTH: u32 = 1;

/// Clones extension repositories into a UI's extension directory.
pub struct ExtensionInstaller {
    transport: Arc<dyn Transport>,
    scheduler: BatchScheduler,
}

impl ExtensionInstaller {
    pub fn new(transport: Arc<dyn Transport>, scheduler: BatchScheduler) -> Self {
        Self {
            transport,
            scheduler,
        }
    }

    /// Present directories count as installed and are left untouched.
    pub async fn install_extensions(
        &self,
        target_dir: &Path,
        specs: &[ExtensionSpec],
    ) -> BatchSummary {
        if specs.is_empty() {
            return BatchSummary::empty();
        }

        if let Err(err) = fs::create_dir_all(target_dir).await {
            warn!("Failed to create {:?}: {err}", target_dir);
        }

        let mut seen = HashSet::new();
        let jobs = specs
            .iter()
            .filter(|spec| seen.insert(spec.dir_name.clone()))
            .map(|spec| {
                let dest = target_dir.join(&spec.dir_name);
                Job::new(spec.dir_name.clone(), self.install_one(spec, dest.clone())).keyed(dest)
            })
            .collect::<Vec<_>>();

        let summary = BatchSummary::from_outcomes(self.scheduler.run(jobs).await);
        if summary.total > 0 && summary.succeeded == 0 {
            warn!("No extensions present in {:?}", target_dir);
        }
        summary
    }

    async fn install_one(&self, spec: &ExtensionSpec, dest: PathBuf) -> Outcome {
        if fs::try_exists(&dest).await.unwrap_or(false) {
            info!("Extension '{}' already present", spec.dir_name);
            return Outcome::skipped(&spec.dir_name, "already present").at(dest);
        }
        let outcome = self
            .transport
            .clone_repository(&spec.url, &dest, CLONE_DEPTH)
            .await;
        if outcome.is_success() {
            info!("Installed extension '{}'", spec.dir_name);
        }
        outcome
    }
}
