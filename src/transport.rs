//! Single-operation network I/O: plain HTTP fetch, accelerated fetch through an
//! external `aria2c` process, and shallow `git clone`.
//!
//! Every operation reports through [`Outcome`]; errors never cross this boundary.
//! The plain HTTP client accepts invalid certificates so that mirrors with broken
//! TLS still work. It is not a secure transport.

use crate::{config::Settings, scheduler::Outcome};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use log::{debug, info, warn};
use reqwest::{header, Client, Url};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
    process::Command,
    time::timeout,
};
use tokio_util::io::StreamReader;

const STDERR_EXCERPT: usize = 200;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Plain HTTP GET into `dest_dir/file_name`, replacing whatever is there.
    async fn fetch_file(&self, url: &str, dest_dir: &Path, file_name: &str) -> Outcome;

    /// Multi-connection resumable fetch through the accelerator process.
    async fn fetch_file_accelerated(
        &self,
        url: &str,
        dest_dir: &Path,
        file_name: &str,
        options: &AcceleratorOptions,
    ) -> Outcome;

    /// Shallow clone; an existing `dest_dir` counts as already satisfied.
    async fn clone_repository(&self, url: &str, dest_dir: &Path, depth: u32) -> Outcome;
}

#[derive(Clone, Debug)]
pub struct AcceleratorOptions {
    pub connections_per_server: u32,
    pub split: u32,
    pub min_split_size: String,
    pub resume: bool,
    pub allow_overwrite: bool,
    pub max_tries: u32,
    pub retry_wait_secs: u32,
    pub check_integrity: bool,
    pub file_allocation: String,
    pub timeout: Duration,
}

impl Default for AcceleratorOptions {
    fn default() -> Self {
        Self {
            connections_per_server: 16,
            split: 16,
            min_split_size: "1M".to_string(),
            resume: true,
            allow_overwrite: true,
            max_tries: 5,
            retry_wait_secs: 3,
            check_integrity: true,
            file_allocation: "none".to_string(),
            timeout: Duration::from_secs(600),
        }
    }
}

impl AcceleratorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: settings.accelerated_timeout(),
            ..Self::default()
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        vec![
            format!("--max-connection-per-server={}", self.connections_per_server),
            format!("--split={}", self.split),
            format!("--min-split-size={}", self.min_split_size),
            format!("--continue={}", self.resume),
            format!("--allow-overwrite={}", self.allow_overwrite),
            "--auto-file-renaming=false".to_string(),
            format!("--max-tries={}", self.max_tries),
            format!("--retry-wait={}", self.retry_wait_secs),
            format!("--check-integrity={}", self.check_integrity),
            format!("--file-allocation={}", self.file_allocation),
            "--console-log-level=warn".to_string(),
            "--summary-interval=0".to_string(),
        ]
    }
}

#[derive(Debug)]
pub struct SystemTransport {
    client: Client,
    aria2c_bin: String,
    git_bin: String,
    fetch_timeout: Duration,
    clone_timeout: Duration,
}

impl SystemTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(15))
            .build()
            .context("failed to construct HTTP client")?;

        Ok(Self {
            client,
            aria2c_bin: settings.aria2c_bin.clone(),
            git_bin: settings.git_bin.clone(),
            fetch_timeout: settings.fetch_timeout(),
            clone_timeout: settings.clone_timeout(),
        })
    }

    async fn fetch_into(&self, url: &Url, dest_dir: &Path, file_name: &str) -> Result<u64> {
        fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("failed to create directory {:?}", dest_dir))?;

        let dest_path = dest_dir.join(file_name);
        if fs::try_exists(&dest_path).await.unwrap_or(false) {
            fs::remove_file(&dest_path)
                .await
                .with_context(|| format!("failed to remove existing {:?}", dest_path))?;
        }

        let response = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, "*/*")
            .send()
            .await
            .with_context(|| format!("request failed for {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("download failed for {url} (status {status})");
        }

        let tmp_path = unique_tmp_path(dest_dir, file_name);
        let file = fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("failed to create temporary file {:?}", tmp_path))?;
        let mut file = BufWriter::new(file);

        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::new(ErrorKind::Other, err));
        let mut reader = StreamReader::new(stream);
        let copied = tokio::io::copy(&mut reader, &mut file).await;
        let received = match copied {
            Ok(received) => received,
            Err(err) => {
                drop(file);
                fs::remove_file(&tmp_path).await.ok();
                return Err(err).with_context(|| format!("failed streaming {url}"));
            }
        };
        file.flush()
            .await
            .with_context(|| format!("failed flushing {:?}", tmp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &dest_path).await {
            fs::remove_file(&tmp_path).await.ok();
            return Err(err)
                .with_context(|| format!("failed to move {:?} to {:?}", tmp_path, dest_path));
        }

        Ok(received)
    }

    async fn run_accelerator(
        &self,
        url: &Url,
        dest_dir: &Path,
        file_name: &str,
        options: &AcceleratorOptions,
    ) -> Result<u64> {
        fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("failed to create directory {:?}", dest_dir))?;

        let mut cmd = Command::new(&self.aria2c_bin);
        cmd.args(options.to_args())
            .arg("--dir")
            .arg(dest_dir)
            .arg("--out")
            .arg(file_name)
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                bail!("download accelerator '{}' not found on PATH", self.aria2c_bin)
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to spawn '{}'", self.aria2c_bin))
            }
        };

        let output = match timeout(options.timeout, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("failed waiting for '{}'", self.aria2c_bin))?,
            Err(_) => bail!(
                "download timed out for {file_name} after {}s",
                options.timeout.as_secs()
            ),
        };

        if !output.status.success() {
            bail!(
                "accelerator exited with {} for {url}: {}",
                output.status,
                stderr_excerpt(&output.stderr)
            );
        }

        let dest_path = dest_dir.join(file_name);
        let size = fs::metadata(&dest_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if size == 0 {
            bail!("accelerator reported success but {:?} is missing or empty", dest_path);
        }
        Ok(size)
    }

    async fn run_clone(&self, url: &Url, dest_dir: &Path, depth: u32) -> Result<()> {
        if let Some(parent) = dest_dir.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {:?}", parent))?;
        }

        let mut cmd = Command::new(&self.git_bin);
        cmd.arg("clone");
        if depth > 0 {
            cmd.arg("--depth").arg(depth.to_string());
        }
        cmd.arg(url.as_str())
            .arg(dest_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                bail!("'{}' not found on PATH", self.git_bin)
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to spawn '{}'", self.git_bin))
            }
        };

        let output = match timeout(self.clone_timeout, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("failed waiting for '{}'", self.git_bin))?,
            Err(_) => bail!("clone timed out after {}s", self.clone_timeout.as_secs()),
        };

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                debug!("git stdout for {url}: {}", stdout.trim());
            }
            bail!(
                "git exited with {}: {}",
                output.status,
                stderr_excerpt(&output.stderr)
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SystemTransport {
    async fn fetch_file(&self, url: &str, dest_dir: &Path, file_name: &str) -> Outcome {
        let target = dest_dir.join(file_name);
        let label = file_name.to_string();
        let parsed = match parse_url(url) {
            Ok(parsed) => parsed,
            Err(err) => return Outcome::failed(label, err.to_string()).at(target),
        };

        let started = Instant::now();
        info!("Downloading {} to {:?}", url, target);
        match timeout(self.fetch_timeout, self.fetch_into(&parsed, dest_dir, file_name)).await {
            Ok(Ok(size)) => Outcome::downloaded(label, format!("Downloaded {file_name}"))
                .at(target)
                .with_stats(Some(size), started.elapsed()),
            Ok(Err(err)) => Outcome::failed(label, format!("{err:#}")).at(target),
            Err(_) => {
                cleanup_partials(dest_dir, file_name).await;
                Outcome::failed(
                    label,
                    format!(
                        "download timed out for {file_name} after {}s",
                        self.fetch_timeout.as_secs()
                    ),
                )
                .at(target)
            }
        }
    }

    async fn fetch_file_accelerated(
        &self,
        url: &str,
        dest_dir: &Path,
        file_name: &str,
        options: &AcceleratorOptions,
    ) -> Outcome {
        let target = dest_dir.join(file_name);
        let label = file_name.to_string();
        let parsed = match parse_url(url) {
            Ok(parsed) => parsed,
            Err(err) => return Outcome::failed(label, err.to_string()).at(target),
        };

        let started = Instant::now();
        info!("Accelerated download {} -> {:?}", url, target);
        match self.run_accelerator(&parsed, dest_dir, file_name, options).await {
            Ok(size) => Outcome::downloaded(label, format!("Downloaded {file_name} successfully"))
                .at(target)
                .with_stats(Some(size), started.elapsed()),
            Err(err) => Outcome::failed(label, format!("{err:#}")).at(target),
        }
    }

    async fn clone_repository(&self, url: &str, dest_dir: &Path, depth: u32) -> Outcome {
        let label = dest_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| url.to_string());

        if fs::try_exists(dest_dir).await.unwrap_or(false) {
            return Outcome::skipped(label, format!("{:?} already exists", dest_dir))
                .at(dest_dir.to_path_buf());
        }

        let parsed = match parse_url(url) {
            Ok(parsed) => parsed,
            Err(err) => return Outcome::failed(label, err.to_string()).at(dest_dir.to_path_buf()),
        };

        let started = Instant::now();
        info!("Cloning '{}' from {}", label, url);
        match self.run_clone(&parsed, dest_dir, depth).await {
            Ok(()) => Outcome::downloaded(label.clone(), format!("Cloned {label}"))
                .at(dest_dir.to_path_buf())
                .with_stats(None, started.elapsed()),
            Err(err) => {
                // A half-written checkout would satisfy the existence check on the next run.
                if let Err(remove_err) = fs::remove_dir_all(dest_dir).await {
                    if remove_err.kind() != ErrorKind::NotFound {
                        warn!("Failed to clean up {:?}: {remove_err}", dest_dir);
                    }
                }
                Outcome::failed(label, format!("{err:#}")).at(dest_dir.to_path_buf())
            }
        }
    }
}

fn parse_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim()).map_err(|err| anyhow!("invalid URL '{url}': {err}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => bail!("invalid URL '{url}': unsupported scheme '{other}'"),
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "unknown error".to_string();
    }
    trimmed.chars().take(STDERR_EXCERPT).collect()
}

fn unique_tmp_path(dest_dir: &Path, file_name: &str) -> PathBuf {
    let suffix = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    dest_dir.join(format!("{file_name}.part.{suffix}"))
}

async fn cleanup_partials(dest_dir: &Path, file_name: &str) {
    let prefix = format!("{file_name}.part.");
    let Ok(mut entries) = fs::read_dir(dest_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            fs::remove_file(entry.path()).await.ok();
        }
    }
}
