mod agent_uds;
mod registry;

use agent_uds::AgentUdsConfig;
use clap::Parser;
use pipescope_core::config::{env_true, resolve_agent_socket_path, resolve_session_id};
use pipescope_core::sanitize_component;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const PIPELINES_DIR_ENV: &str = "PIPESCOPE_PIPELINES_DIR";
const LOG_DIR_ENV: &str = "PIPESCOPE_LOG_DIR";

#[derive(Clone, Debug)]
struct Config {
    session_id: String,
    socket_path: PathBuf,
    pipelines_dir: PathBuf,
    debug: bool,
    write_timeout: Duration,
    queue_capacity: usize,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "pipescope-agent", about = "Serve pipeline dumps to inspection panels")]
struct Args {
    /// Socket to listen on; defaults to the per-session runtime socket.
    #[arg(long, default_value = "")]
    socket: String,
    #[arg(long, default_value = "")]
    session: String,
    /// Directory holding one `<pipeline>.dot` dump per active pipeline.
    #[arg(long, default_value = "")]
    pipelines_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    info!(
        event = "agent_start",
        session_id = %config.session_id,
        pid = std::process::id()
    );

    let uds_config = AgentUdsConfig {
        session_id: config.session_id.clone(),
        agent_id: format!("pipescope-agent-{}", std::process::id()),
        socket_path: config.socket_path.clone(),
        pipelines_dir: config.pipelines_dir.clone(),
        write_timeout: config.write_timeout,
        queue_capacity: config.queue_capacity.max(1),
    };
    if let Err(err) = agent_uds::run(uds_config, shutdown_rx).await {
        error!(
            event = "agent_error",
            socket = %config.socket_path.display(),
            error = %err
        );
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    let session_id = if args.session.trim().is_empty() {
        resolve_session_id()
    } else {
        args.session.clone()
    };
    let socket_path = if args.socket.trim().is_empty() {
        resolve_agent_socket_path(&session_id)
    } else {
        PathBuf::from(&args.socket)
    };
    Config {
        socket_path,
        pipelines_dir: resolve_pipelines_dir(&args.pipelines_dir),
        debug: args.debug || env_true("PIPESCOPE_AGENT_DEBUG"),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        queue_capacity: args.queue_capacity,
        log_dir: resolve_log_dir(&args.log_dir),
        session_id,
    }
}

fn resolve_pipelines_dir(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = std::env::var(PIPELINES_DIR_ENV) {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    PathBuf::from("pipelines")
}

/// Empty means stdout only.
fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    std::env::var(LOG_DIR_ENV).unwrap_or_default()
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&config.log_dir, &config.session_id) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || TeeWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Writes every record to stdout and, when configured, the session log file.
struct TeeWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl TeeWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, session_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!(
        "pipescope-agent-{}.log",
        sanitize_component(session_id)
    ));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
