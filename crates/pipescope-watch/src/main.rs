use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pipescope_diagnostics::system_source::{
    DEFAULT_GPU_MEMORY_FILE, GPU_MEMORY_FILE_ENV, MEMORY_LIMITS_ENV,
};
use pipescope_diagnostics::{
    analyze_images, DiagnosticsSource, HttpProbe, ImageSnapshot, MemoryAnalysis, MemoryMonitors,
    MetricKind, ReachabilityPoller, SystemDiagnostics, ThresholdConfig,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ONE_SHOT_POLL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "pipescope-watch")]
#[command(about = "Reachability, memory and image diagnostics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe a URL and report online/offline transitions
    Reachability {
        #[arg(long)]
        url: String,
        /// Seconds between probes (0 is treated as 1)
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
    /// Report when RAM or graphics memory use reaches a percentage
    Memory {
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Percentage, 0 to 250
        #[arg(long)]
        trigger: i64,
        /// Seconds between samples; 0 or omitted fires once
        #[arg(long)]
        interval: Option<i64>,
        /// Per-process limits such as `pipescope*:500M`
        #[arg(long, env = MEMORY_LIMITS_ENV)]
        memory_limits: Option<String>,
        #[arg(long, env = GPU_MEMORY_FILE_ENV, default_value = DEFAULT_GPU_MEMORY_FILE)]
        gpu_file: PathBuf,
    },
    /// Summarise the memory held by images in a JSON snapshot
    Images {
        #[arg(long)]
        snapshot: PathBuf,
    },
    /// Log current RAM and graphics use alongside image estimates
    Analysis {
        /// Image snapshot to take estimates from
        #[arg(long)]
        snapshot: Option<PathBuf>,
        #[arg(long, env = MEMORY_LIMITS_ENV)]
        memory_limits: Option<String>,
        #[arg(long, env = GPU_MEMORY_FILE_ENV, default_value = DEFAULT_GPU_MEMORY_FILE)]
        gpu_file: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Ram,
    Gfx,
}

impl From<KindArg> for MetricKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Ram => MetricKind::Ram,
            KindArg::Gfx => MetricKind::Graphics,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Reachability { url, interval } => watch_reachability(url, interval).await,
        Commands::Memory {
            kind,
            trigger,
            interval,
            memory_limits,
            gpu_file,
        } => {
            let source = Arc::new(system_source(memory_limits, gpu_file));
            watch_memory(kind.into(), source, trigger, interval).await
        }
        Commands::Images { snapshot } => {
            let report = analyze_images(&load_snapshot(&snapshot)?);
            report.log();
            print!("{report}");
            Ok(())
        }
        Commands::Analysis {
            snapshot,
            memory_limits,
            gpu_file,
        } => {
            let source = system_source(memory_limits, gpu_file);
            let analysis = analyze_memory(&source, snapshot.as_deref())?;
            analysis.log();
            print!("{analysis}");
            Ok(())
        }
    }
}

fn system_source(memory_limits: Option<String>, gpu_file: PathBuf) -> SystemDiagnostics {
    SystemDiagnostics::new(
        memory_limits.as_deref().filter(|value| !value.trim().is_empty()),
        gpu_file,
    )
}

fn load_snapshot(path: &Path) -> Result<ImageSnapshot> {
    ImageSnapshot::load(path)
        .with_context(|| format!("Failed to load snapshot {}", path.display()))
}

fn analyze_memory(
    source: &dyn DiagnosticsSource,
    snapshot: Option<&Path>,
) -> Result<MemoryAnalysis> {
    let images = match snapshot {
        Some(path) => load_snapshot(path)?,
        None => ImageSnapshot::default(),
    };
    Ok(MemoryAnalysis::collect(source, &images))
}

async fn watch_reachability(url: String, interval: u64) -> Result<()> {
    let probe = HttpProbe::new(url.clone()).context("Failed to build HTTP client")?;
    let poller = ReachabilityPoller::new();
    let target = url.clone();
    let handle = poller.observe_reachability(
        Arc::new(move |reachable| {
            let state = if reachable { "online" } else { "offline" };
            println!("{target}: {state}");
        }),
        Arc::new(probe),
        interval,
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    handle.stop();
    info!(event = "reachability_stopped", url = %url);
    Ok(())
}

async fn watch_memory(
    kind: MetricKind,
    source: Arc<dyn DiagnosticsSource>,
    trigger: i64,
    interval: Option<i64>,
) -> Result<()> {
    let config = ThresholdConfig::new(trigger, interval).context("Invalid threshold")?;
    let mut monitors = MemoryMonitors::new(source);
    let monitor = monitors.monitor_mut(kind);
    monitor.register_callback(
        Arc::new(move |reached| {
            if reached {
                println!("{kind} memory reached {}%", config.trigger_point);
            }
        }),
        trigger,
        interval,
    );

    if config.one_shot {
        let mut poll = tokio::time::interval(ONE_SHOT_POLL);
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if !monitor.is_active() {
                        break;
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to wait for Ctrl-C")?;
                    break;
                }
            }
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to wait for Ctrl-C")?;
    }
    monitor.unregister_callback();
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
