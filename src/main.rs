use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::debug;
use std::{
    path::PathBuf,
    sync::mpsc::{self, Sender},
    thread::{self, JoinHandle},
};
use webui_fetch::{
    app::AppContext,
    config::InstallConfig,
    downloader::{AssetStatus, ProgressEvent},
    layout::{UiKind, UiLayout},
    model::AssetKind,
    scheduler::BatchSummary,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to the per-user data directory)
    #[arg(short = 's', long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the models, VAEs, ControlNets and LoRAs selected in an install config
    Assets {
        #[arg(short = 'c', long)]
        config: PathBuf,
    },
    /// Clone the stock extension set for a WebUI
    Extensions {
        #[arg(short = 'u', long)]
        ui: String,
    },
    /// Install the WebUI, its configs and extensions, then the selected assets
    Install {
        #[arg(short = 'c', long)]
        config: PathBuf,
    },
    /// List catalog labels for one asset kind
    Catalog {
        #[arg(short = 'k', long, value_enum)]
        kind: KindArg,
        /// Use the SDXL catalog
        #[arg(long)]
        xl: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Model,
    Vae,
    Controlnet,
    Lora,
}

impl From<KindArg> for AssetKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Model => AssetKind::Model,
            KindArg::Vae => AssetKind::Vae,
            KindArg::Controlnet => AssetKind::Controlnet,
            KindArg::Lora => AssetKind::Lora,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let context = AppContext::new(cli.settings.as_deref())?;
    context.install_interrupt_handler();
    let runtime = context.runtime.clone();
    runtime.block_on(run(cli.command, &context))
}

async fn run(command: Command, context: &AppContext) -> Result<()> {
    match command {
        Command::Assets { config } => {
            let config = InstallConfig::load(&config)?;
            let (progress, printer) = spawn_progress_printer();
            let downloader = context.asset_downloader(Some(progress));
            let result = downloader.download_selected(&config).await;
            drop(downloader);
            join_printer(printer);

            let summary = result?;
            print_summary("assets", &summary);
            summary.into_result()?;
        }
        Command::Extensions { ui } => {
            let ui: UiKind = ui.parse()?;
            let layout = UiLayout::new(ui, &context.settings.home_dir);
            let specs = layout.extension_specs(context.settings.is_kaggle());
            let summary = context
                .extension_installer()
                .install_extensions(&layout.extensions_dir(), &specs)
                .await;
            print_summary("extensions", &summary);
            summary.into_result()?;
        }
        Command::Install { config } => {
            let config = InstallConfig::load(&config)?;
            let (progress, printer) = spawn_progress_printer();
            let installer = context.webui_installer(Some(progress));
            let result = installer.provision(&config).await;
            drop(installer);
            join_printer(printer);

            let report = result?;
            println!("{}", report.webui);
            print_summary("config files", &report.configs);
            print_summary("extensions", &report.extensions);
            print_summary("assets", &report.assets);
            report.assets.into_result()?;
        }
        Command::Catalog { kind, xl } => {
            let labels = context
                .catalog
                .labels(kind.into(), xl)
                .await
                .context("failed to list catalog labels")?;
            for label in labels {
                println!("{label}");
            }
        }
    }
    Ok(())
}

fn spawn_progress_printer() -> (Sender<ProgressEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<ProgressEvent>();
    let handle = thread::spawn(move || {
        for event in rx {
            match event.status {
                AssetStatus::Success => println!("  done  {}", event.asset),
                AssetStatus::Error => println!(
                    "  fail  {}: {}",
                    event.asset,
                    event.error.as_deref().unwrap_or("unknown error")
                ),
                AssetStatus::Pending | AssetStatus::Downloading => {
                    debug!("{:?} {}", event.status, event.asset)
                }
            }
        }
    });
    (tx, handle)
}

fn join_printer(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        debug!("progress printer thread panicked");
    }
}

fn print_summary(label: &str, summary: &BatchSummary) {
    println!("{label}: {}/{} succeeded", summary.succeeded, summary.total);
    for outcome in &summary.failed {
        println!("  {outcome}");
    }
    for warning in &summary.warnings {
        println!("  warning: {warning}");
    }
}
