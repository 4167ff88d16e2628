mod agent_client;
mod app;
mod catalog;
mod export;
mod ui;
mod view;
mod viewport;

use agent_client::{
    execute as run_request, AgentClientConfig, AgentReply, AgentRequest, PipelineAgent,
    UdsPipelineAgent,
};
use app::App;
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture, EventStream},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use export::FileSaver;
use futures_util::StreamExt;
use pipescope_core::config::{
    env_true, resolve_agent_socket_path, resolve_export_dir, resolve_session_id, LOG_STDOUT_ENV,
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{error::Error, io, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use view::PipelineView;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const TICK_QUEUE_CAPACITY: usize = 4;
const REPLY_QUEUE_CAPACITY: usize = 64;
const EVENT_QUEUE_CAPACITY: usize = 32;

#[derive(Clone, Debug)]
struct Config {
    session_id: String,
    client_id: String,
    socket_path: PathBuf,
    export_dir: PathBuf,
}

fn load_config() -> Config {
    let session_id = resolve_session_id();
    let socket_path = resolve_agent_socket_path(&session_id);
    Config {
        client_id: format!("pipescope-panel-{}", std::process::id()),
        session_id,
        socket_path,
        export_dir: resolve_export_dir(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config();
    init_logging();
    info!(
        event = "panel_start",
        session = %config.session_id,
        socket = %config.socket_path.display(),
        export_dir = %config.export_dir.display()
    );

    let (agent_event_tx, mut agent_event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let agent: Arc<dyn PipelineAgent> = Arc::new(UdsPipelineAgent::spawn(
        AgentClientConfig {
            session_id: config.session_id.clone(),
            client_id: config.client_id.clone(),
            socket_path: config.socket_path.clone(),
            request_timeout: REQUEST_TIMEOUT,
        },
        agent_event_tx,
    ));
    let (tick_tx, mut tick_rx) = mpsc::channel(TICK_QUEUE_CAPACITY);
    let (reply_tx, mut reply_rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);

    let view = PipelineView::new(tick_tx, Box::new(FileSaver::new(config.export_dir.clone())));
    let mut app = App::new(view);
    dispatch(&agent, &reply_tx, app.start());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut events = EventStream::new();

    loop {
        app.graph_area = ui::graph_area(terminal.size()?);
        terminal.draw(|frame| ui::render(frame, &app))?;
        let requests = tokio::select! {
            Some(event) = agent_event_rx.recv() => app.apply_agent_event(event),
            Some(reply) = reply_rx.recv() => app.apply_reply(reply),
            Some(tick) = tick_rx.recv() => app.apply_tick(tick),
            maybe_event = events.next() => {
                match maybe_event {
                    Some(Ok(event)) => {
                        let outcome = app.handle_input(event);
                        if outcome.quit {
                            break;
                        }
                        outcome.requests
                    }
                    Some(Err(err)) => {
                        debug!(event = "terminal_event_error", error = %err);
                        Vec::new()
                    }
                    None => break,
                }
            }
        };
        dispatch(&agent, &reply_tx, requests);
    }

    app.view.stop_auto_refresh();
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        DisableMouseCapture,
        LeaveAlternateScreen
    )?;
    terminal.show_cursor()?;
    Ok(())
}

/// Run each request on its own task; replies come back through `replies`.
fn dispatch(
    agent: &Arc<dyn PipelineAgent>,
    replies: &mpsc::Sender<AgentReply>,
    requests: Vec<AgentRequest>,
) {
    for request in requests {
        let agent = Arc::clone(agent);
        let replies = replies.clone();
        tokio::spawn(async move {
            let reply = run_request(agent.as_ref(), request).await;
            let _ = replies.send(reply).await;
        });
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_true(LOG_STDOUT_ENV) {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}
