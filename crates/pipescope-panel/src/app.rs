use crate::agent_client::{AgentEvent, AgentReply, AgentRequest, DumpOrigin};
use crate::catalog::PipelineCatalog;
use crate::view::{PipelineView, RefreshTick};
use crate::viewport::{PAN_STEP, ZOOM_STEP};
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseEvent};
use ratatui::layout::Rect;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Catalog,
    Filter,
    Selector,
    Graph,
}

impl Focus {
    fn next(self) -> Self {
        match self {
            Focus::Catalog | Focus::Filter => Focus::Selector,
            Focus::Selector => Focus::Graph,
            Focus::Graph => Focus::Catalog,
        }
    }
}

/// Outcome of one input event.
#[derive(Debug, Default)]
pub struct InputOutcome {
    pub quit: bool,
    pub requests: Vec<AgentRequest>,
}

impl InputOutcome {
    fn request(request: Option<AgentRequest>) -> Self {
        Self {
            quit: false,
            requests: request.into_iter().collect(),
        }
    }
}

/// All panel state. Agent calls leave as [`AgentRequest`]s and come back
/// through [`App::apply_reply`] in arrival order.
pub struct App {
    pub catalog: PipelineCatalog,
    pub view: PipelineView,
    pub focus: Focus,
    pub help_open: bool,
    pub status_note: Option<String>,
    /// Screen area the graph was last drawn in.
    pub graph_area: Rect,
    target_available: bool,
}

impl App {
    pub fn new(view: PipelineView) -> Self {
        Self {
            catalog: PipelineCatalog::new(),
            view,
            focus: Focus::Catalog,
            help_open: false,
            status_note: None,
            graph_area: Rect::default(),
            target_available: false,
        }
    }

    pub fn target_available(&self) -> bool {
        self.target_available
    }

    /// The panel became visible: load the catalog, or wait for the target.
    pub fn start(&mut self) -> Vec<AgentRequest> {
        self.catalog
            .refresh(self.target_available)
            .into_iter()
            .collect()
    }

    pub fn apply_agent_event(&mut self, event: AgentEvent) -> Vec<AgentRequest> {
        match event {
            AgentEvent::TargetAvailable => {
                self.target_available = true;
                self.status_note = None;
                // A reconnect may reach an agent with different pipelines, so
                // the list is reloaded even without a pending deferral.
                let request = match self.catalog.target_became_available() {
                    Some(request) => Some(request),
                    None => self.catalog.refresh(true),
                };
                request.into_iter().collect()
            }
            AgentEvent::Disconnected => {
                self.target_available = false;
                self.status_note = Some("agent disconnected; reconnecting".to_string());
                Vec::new()
            }
            AgentEvent::PipelinesChanged => self
                .catalog
                .refresh(self.target_available)
                .into_iter()
                .collect(),
        }
    }

    pub fn apply_reply(&mut self, reply: AgentReply) -> Vec<AgentRequest> {
        let request = match reply {
            AgentReply::PipelineNames(result) => {
                self.catalog.apply_names(result);
                None
            }
            AgentReply::ChildBinNames { generation, result } => {
                self.view.apply_child_bins(generation, result);
                None
            }
            AgentReply::PipelineDump {
                query,
                origin: DumpOrigin::Catalog,
                result,
                ..
            } => self
                .catalog
                .apply_dump(&query.pipeline_name, result)
                .and_then(|descriptor| self.view.display_pipeline(descriptor)),
            AgentReply::PipelineDump {
                query,
                parent_bin_name,
                origin,
                result,
            } => self.view.apply_dump(query, parent_bin_name, origin, result),
        };
        request.into_iter().collect()
    }

    pub fn apply_tick(&mut self, tick: RefreshTick) -> Vec<AgentRequest> {
        self.view.refresh_tick(tick).into_iter().collect()
    }

    pub fn handle_input(&mut self, event: Event) -> InputOutcome {
        match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => self.handle_key(key),
            Event::Mouse(mouse) => {
                self.handle_mouse(mouse);
                InputOutcome::default()
            }
            _ => InputOutcome::default(),
        }
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) {
        let area = self.graph_area;
        let inside = mouse.column >= area.x
            && mouse.column < area.x.saturating_add(area.width)
            && mouse.row >= area.y
            && mouse.row < area.y.saturating_add(area.height);
        if !inside {
            return;
        }
        let local = MouseEvent {
            column: mouse.column - area.x,
            row: mouse.row - area.y,
            ..mouse
        };
        self.view.handle_mouse(&local);
    }

    fn handle_key(&mut self, key: KeyEvent) -> InputOutcome {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return InputOutcome {
                quit: true,
                requests: Vec::new(),
            };
        }
        if self.focus == Focus::Filter {
            self.handle_filter_key(key);
            return InputOutcome::default();
        }
        if matches!(key.code, KeyCode::Char('?') | KeyCode::F(1)) {
            self.help_open = !self.help_open;
            return InputOutcome::default();
        }
        if self.help_open {
            if key.code == KeyCode::Esc {
                self.help_open = false;
            }
            return InputOutcome::default();
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('s') {
            self.export();
            return InputOutcome::default();
        }

        match key.code {
            KeyCode::Char('q') => {
                return InputOutcome {
                    quit: true,
                    requests: Vec::new(),
                }
            }
            KeyCode::Tab => {
                self.focus = self.focus.next();
                return InputOutcome::default();
            }
            KeyCode::Char('/') => {
                self.focus = Focus::Filter;
                return InputOutcome::default();
            }
            KeyCode::Char('r') => {
                return InputOutcome::request(self.catalog.refresh(self.target_available));
            }
            KeyCode::Char('a') => {
                let active = self.view.toggle_auto_refresh();
                self.status_note = self
                    .view
                    .auto_refresh_available()
                    .then(|| format!("auto-refresh {}", if active { "on" } else { "off" }));
                return InputOutcome::default();
            }
            KeyCode::Char('e') => {
                self.export();
                return InputOutcome::default();
            }
            _ => {}
        }

        match self.focus {
            Focus::Catalog => match key.code {
                KeyCode::Down | KeyCode::Char('j') => self.catalog.move_cursor(1),
                KeyCode::Up | KeyCode::Char('k') => self.catalog.move_cursor(-1),
                KeyCode::Enter => return InputOutcome::request(self.catalog.select_at_cursor()),
                _ => {}
            },
            Focus::Selector => match key.code {
                KeyCode::Right | KeyCode::Down | KeyCode::Char('l') | KeyCode::Char('j') => {
                    self.view.move_selector(1)
                }
                KeyCode::Left | KeyCode::Up | KeyCode::Char('h') | KeyCode::Char('k') => {
                    self.view.move_selector(-1)
                }
                KeyCode::Enter => return InputOutcome::request(self.view.choose_highlighted()),
                _ => {}
            },
            Focus::Graph => {
                let (width, height) = (self.graph_area.width, self.graph_area.height);
                match key.code {
                    KeyCode::Left | KeyCode::Char('h') => {
                        self.view.pan(PAN_STEP, 0.0);
                    }
                    KeyCode::Right | KeyCode::Char('l') => {
                        self.view.pan(-PAN_STEP, 0.0);
                    }
                    KeyCode::Up | KeyCode::Char('k') => {
                        self.view.pan(0.0, PAN_STEP / 2.0);
                    }
                    KeyCode::Down | KeyCode::Char('j') => {
                        self.view.pan(0.0, -PAN_STEP / 2.0);
                    }
                    KeyCode::Char('+') | KeyCode::Char('=') => {
                        self.view.zoom(ZOOM_STEP, width, height);
                    }
                    KeyCode::Char('-') => {
                        self.view.zoom(1.0 / ZOOM_STEP, width, height);
                    }
                    KeyCode::Char('0') => {
                        self.view.reset_viewport();
                    }
                    _ => {}
                }
            }
            Focus::Filter => {}
        }
        InputOutcome::default()
    }

    fn handle_filter_key(&mut self, key: KeyEvent) {
        let mut text = self.catalog.filter_text().to_string();
        match key.code {
            KeyCode::Enter | KeyCode::Esc | KeyCode::Tab => {
                self.focus = Focus::Catalog;
                return;
            }
            KeyCode::Backspace => {
                text.pop();
            }
            KeyCode::Char(ch) => text.push(ch),
            _ => return,
        }
        self.catalog.set_filter(&text);
    }

    fn export(&mut self) {
        match self.view.export() {
            Ok(path) => {
                info!(event = "pipeline_exported", path = %path.display());
                self.status_note = Some(format!("saved {}", path.display()));
            }
            Err(err) => {
                self.status_note = Some(err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::AgentError;
    use crate::catalog::CatalogState;
    use crate::export::FileSaver;
    use pipescope_core::inspector_ipc::BinQuery;
    use tokio::sync::mpsc;

    const DUMP: &str = r#"digraph pipeline {
  subgraph cluster_decode_0x1 {
    label="GstDecodeBin\ndecode\n[>]";
    subgraph cluster_queue_0x2 {
      label="GstQueue\nqueue\n[>]";
      queue_0x2_sink [label="sink"];
    }
  }
}
"#;

    fn app() -> (App, mpsc::Receiver<RefreshTick>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let (ticks, tick_rx) = mpsc::channel(4);
        let view = PipelineView::new(ticks, Box::new(FileSaver::new(dir.path())));
        (App::new(view), tick_rx, dir)
    }

    fn key(code: KeyCode) -> Event {
        Event::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn dump_reply(request: &AgentRequest, result: Result<String, AgentError>) -> AgentReply {
        let AgentRequest::DumpPipeline {
            query,
            parent_bin_name,
            origin,
        } = request.clone()
        else {
            panic!("expected dump request, got {request:?}")
        };
        AgentReply::PipelineDump {
            query,
            parent_bin_name,
            origin,
            result,
        }
    }

    #[tokio::test]
    async fn list_waits_for_target() {
        let (mut app, _ticks, _dir) = app();
        assert!(app.start().is_empty());
        assert_eq!(
            app.apply_agent_event(AgentEvent::TargetAvailable),
            vec![AgentRequest::ListPipelineNames]
        );
        app.apply_reply(AgentReply::PipelineNames(Ok(vec!["p0".to_string()])));
        assert_eq!(app.catalog.state(), CatalogState::ListPopulated);

        assert_eq!(
            app.apply_agent_event(AgentEvent::PipelinesChanged),
            vec![AgentRequest::ListPipelineNames]
        );
        app.apply_agent_event(AgentEvent::Disconnected);
        assert!(!app.target_available());
        assert!(app.apply_agent_event(AgentEvent::PipelinesChanged).is_empty());
        assert_eq!(
            app.apply_agent_event(AgentEvent::TargetAvailable),
            vec![AgentRequest::ListPipelineNames]
        );
    }

    #[tokio::test]
    async fn selecting_a_pipeline_displays_it() {
        let (mut app, _ticks, dir) = app();
        app.apply_agent_event(AgentEvent::TargetAvailable);
        app.apply_reply(AgentReply::PipelineNames(Ok(vec![
            "p0".to_string(),
            "p1".to_string(),
        ])));

        app.handle_input(key(KeyCode::Down));
        let outcome = app.handle_input(key(KeyCode::Enter));
        assert_eq!(outcome.requests.len(), 1);
        let follow_up = app.apply_reply(dump_reply(&outcome.requests[0], Ok(DUMP.to_string())));
        assert_eq!(
            follow_up,
            vec![AgentRequest::ListChildBinNames {
                generation: 1,
                query: BinQuery {
                    pipeline_name: "p1".to_string(),
                    bin_name: String::new(),
                },
            }]
        );
        assert_eq!(app.view.descriptor().map(|d| d.name()), Some("p1"));

        app.handle_input(key(KeyCode::Char('e')));
        let exported = dir.path().join("GStreamer-pipeline-dump-p1.dot");
        assert_eq!(std::fs::read_to_string(exported).expect("export"), DUMP);
    }

    #[tokio::test]
    async fn failed_dump_leaves_display_untouched() {
        let (mut app, _ticks, _dir) = app();
        app.apply_agent_event(AgentEvent::TargetAvailable);
        app.apply_reply(AgentReply::PipelineNames(Ok(vec!["p0".to_string()])));
        let outcome = app.handle_input(key(KeyCode::Enter));
        let follow_up = app.apply_reply(dump_reply(
            &outcome.requests[0],
            Err(AgentError::Remote {
                code: "unknown_pipeline".to_string(),
                message: "No active pipeline named p0".to_string(),
            }),
        ));
        assert!(follow_up.is_empty());
        assert!(app.view.descriptor().is_none());
    }

    #[tokio::test]
    async fn filter_captures_typed_text() {
        let (mut app, _ticks, _dir) = app();
        app.apply_agent_event(AgentEvent::TargetAvailable);
        app.apply_reply(AgentReply::PipelineNames(Ok(vec![
            "playbin0".to_string(),
            "capture".to_string(),
        ])));
        app.handle_input(key(KeyCode::Char('/')));
        for ch in "cap".chars() {
            app.handle_input(key(KeyCode::Char(ch)));
        }
        assert_eq!(app.catalog.visible_names(), vec!["capture"]);
        // 'q' is text while filtering.
        assert!(!app.handle_input(key(KeyCode::Char('q'))).quit);
        app.handle_input(key(KeyCode::Backspace));
        app.handle_input(key(KeyCode::Esc));
        assert_eq!(app.focus, Focus::Catalog);
        assert!(app.handle_input(key(KeyCode::Char('q'))).quit);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_ticks_flow_through_app() {
        let (mut app, mut ticks, _dir) = app();
        app.apply_agent_event(AgentEvent::TargetAvailable);
        app.apply_reply(AgentReply::PipelineNames(Ok(vec!["p0".to_string()])));
        let outcome = app.handle_input(key(KeyCode::Enter));
        app.apply_reply(dump_reply(&outcome.requests[0], Ok(DUMP.to_string())));

        app.handle_input(key(KeyCode::Char('a')));
        assert!(app.view.auto_refresh_active());
        let tick = ticks.recv().await.expect("tick");
        let requests = app.apply_tick(tick);
        assert_eq!(requests.len(), 1);
        app.apply_reply(dump_reply(&requests[0], Err(AgentError::Disconnected)));
        assert!(!app.view.auto_refresh_active());
    }
}
