//! Graph view: shows one pipeline or bin, navigates between bins and keeps
//! the display fresh while auto-refresh is on.

use crate::agent_client::{AgentError, AgentRequest, DumpOrigin};
use crate::export::{SaveError, SaveSink};
use crate::viewport::{PanZoomController, ViewportState};
use crossterm::event::MouseEvent;
use pipescope_core::inspector_ipc::BinQuery;
use pipescope_core::PipelineDescriptor;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const AUTO_REFRESH_PERIOD: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTick {
    pub session_id: u64,
}

/// Periodic tick source. Dropping or cancelling the handle stops it.
#[derive(Debug)]
pub struct TickerHandle {
    task: JoinHandle<()>,
}

impl TickerHandle {
    pub fn spawn(period: Duration, session_id: u64, ticks: mpsc::Sender<RefreshTick>) -> Self {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match ticks.try_send(RefreshTick { session_id }) {
                    // A full queue means the UI is behind; that tick is skipped.
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        });
        Self { task }
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A running auto-refresh loop and the bin it keeps re-fetching.
#[derive(Debug)]
pub struct RefreshSession {
    id: u64,
    ticker: TickerHandle,
    current_bin_name: String,
    current_parent_bin_name: String,
    tick_in_flight: bool,
}

impl RefreshSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn current_bin_name(&self) -> &str {
        &self.current_bin_name
    }

    pub fn current_parent_bin_name(&self) -> &str {
        &self.current_parent_bin_name
    }

    pub fn tick_in_flight(&self) -> bool {
        self.tick_in_flight
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorEntry {
    Placeholder,
    Parent {
        bin_name: String,
    },
    Child {
        bin_name: String,
        parent_bin_name: String,
    },
}

impl SelectorEntry {
    pub fn label(&self) -> String {
        match self {
            SelectorEntry::Placeholder => "Select...".to_string(),
            SelectorEntry::Parent { bin_name } => format!("Parent: {bin_name}"),
            SelectorEntry::Child { bin_name, .. } => bin_name.clone(),
        }
    }

    /// `(bin_name, parent_bin_name)` to display when chosen.
    fn target(&self) -> Option<(String, String)> {
        match self {
            SelectorEntry::Placeholder => None,
            SelectorEntry::Parent { bin_name } => Some((bin_name.clone(), String::new())),
            SelectorEntry::Child {
                bin_name,
                parent_bin_name,
            } => Some((bin_name.clone(), parent_bin_name.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinSelector {
    entries: Vec<SelectorEntry>,
    highlighted: usize,
}

impl BinSelector {
    fn build(descriptor: &PipelineDescriptor, child_bins: Vec<String>) -> Self {
        let mut entries = vec![
            SelectorEntry::Placeholder,
            SelectorEntry::Parent {
                bin_name: descriptor.parent_bin_name().to_string(),
            },
        ];
        entries.extend(child_bins.into_iter().map(|bin_name| SelectorEntry::Child {
            bin_name,
            parent_bin_name: descriptor.bin_name().to_string(),
        }));
        Self {
            entries,
            highlighted: 0,
        }
    }

    pub fn entries(&self) -> &[SelectorEntry] {
        &self.entries
    }

    pub fn highlighted(&self) -> usize {
        self.highlighted
    }

    pub fn move_highlight(&mut self, delta: isize) {
        let last = self.entries.len().saturating_sub(1);
        self.highlighted = self.highlighted.saturating_add_signed(delta).min(last);
    }
}

pub struct PipelineView {
    descriptor: Option<PipelineDescriptor>,
    generation: u64,
    selector: Option<BinSelector>,
    pan_zoom: Option<PanZoomController>,
    saved_viewport: ViewportState,
    refresh: Option<RefreshSession>,
    next_session_id: u64,
    refresh_period: Duration,
    ticks: mpsc::Sender<RefreshTick>,
    save_sink: Box<dyn SaveSink>,
}

impl PipelineView {
    pub fn new(ticks: mpsc::Sender<RefreshTick>, save_sink: Box<dyn SaveSink>) -> Self {
        Self {
            descriptor: None,
            generation: 0,
            selector: None,
            pan_zoom: None,
            saved_viewport: ViewportState::default(),
            refresh: None,
            next_session_id: 0,
            refresh_period: AUTO_REFRESH_PERIOD,
            ticks,
            save_sink,
        }
    }

    pub fn descriptor(&self) -> Option<&PipelineDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn selector(&self) -> Option<&BinSelector> {
        self.selector.as_ref()
    }

    pub fn refresh_session(&self) -> Option<&RefreshSession> {
        self.refresh.as_ref()
    }

    pub fn export_enabled(&self) -> bool {
        self.descriptor.is_some()
    }

    pub fn auto_refresh_available(&self) -> bool {
        self.descriptor.is_some()
    }

    pub fn auto_refresh_active(&self) -> bool {
        self.refresh.is_some()
    }

    pub fn viewport(&self) -> ViewportState {
        self.pan_zoom
            .as_ref()
            .map(PanZoomController::viewport)
            .unwrap_or(self.saved_viewport)
    }

    pub fn label(&self) -> Option<String> {
        let descriptor = self.descriptor.as_ref()?;
        let name = descriptor.display_name();
        Some(if self.refresh.is_some() {
            format!("Displaying {name}.")
        } else {
            format!("Displaying {name}. Available children bins:")
        })
    }

    /// Show `descriptor`. Outside auto-refresh this resets the viewport and
    /// asks for the bins the selector should offer.
    pub fn display_pipeline(&mut self, descriptor: PipelineDescriptor) -> Option<AgentRequest> {
        self.selector = None;
        self.pan_zoom = None;
        self.generation += 1;

        let viewport = match &mut self.refresh {
            Some(session) => {
                session.current_bin_name = descriptor.bin_name().to_string();
                session.current_parent_bin_name = descriptor.parent_bin_name().to_string();
                self.saved_viewport
            }
            None => ViewportState::default(),
        };
        self.saved_viewport = viewport;
        self.pan_zoom = Some(PanZoomController::new(viewport));

        debug!(
            event = "view_display",
            pipeline = descriptor.name(),
            bin = descriptor.bin_name(),
            refreshing = self.refresh.is_some()
        );

        let request = if self.refresh.is_some() {
            None
        } else {
            Some(AgentRequest::ListChildBinNames {
                generation: self.generation,
                query: BinQuery {
                    pipeline_name: descriptor.name().to_string(),
                    bin_name: descriptor.bin_name().to_string(),
                },
            })
        };
        self.descriptor = Some(descriptor);
        request
    }

    /// Build the bin selector from a child-bin listing. Listings for a graph
    /// that has since been replaced are dropped.
    pub fn apply_child_bins(&mut self, generation: u64, result: Result<Vec<String>, AgentError>) {
        if generation != self.generation {
            debug!(
                event = "view_stale_bins",
                generation,
                current = self.generation
            );
            return;
        }
        let Some(descriptor) = &self.descriptor else {
            return;
        };
        match result {
            Ok(bins) => self.selector = Some(BinSelector::build(descriptor, bins)),
            Err(err) => warn!(
                event = "view_bins_failed",
                pipeline = descriptor.name(),
                bin = descriptor.bin_name(),
                error = %err
            ),
        }
    }

    pub fn move_selector(&mut self, delta: isize) {
        if let Some(selector) = &mut self.selector {
            selector.move_highlight(delta);
        }
    }

    /// Navigate to the highlighted selector entry. The placeholder does
    /// nothing.
    pub fn choose_highlighted(&mut self) -> Option<AgentRequest> {
        let selector = self.selector.as_ref()?;
        let (bin_name, parent_bin_name) = selector.entries.get(selector.highlighted)?.target()?;
        self.display_bin(&bin_name, &parent_bin_name, DumpOrigin::Navigation)
    }

    pub fn choose_entry(&mut self, index: usize) -> Option<AgentRequest> {
        let selector = self.selector.as_mut()?;
        if index >= selector.entries.len() {
            return None;
        }
        selector.highlighted = index;
        self.choose_highlighted()
    }

    /// Request a dump of `bin_name` within the displayed pipeline.
    pub fn display_bin(
        &mut self,
        bin_name: &str,
        parent_bin_name: &str,
        origin: DumpOrigin,
    ) -> Option<AgentRequest> {
        let pipeline_name = self.descriptor.as_ref()?.name().to_string();
        if let Some(session) = &mut self.refresh {
            session.current_bin_name = bin_name.to_string();
            session.current_parent_bin_name = parent_bin_name.to_string();
        }
        Some(AgentRequest::DumpPipeline {
            query: BinQuery {
                pipeline_name,
                bin_name: bin_name.to_string(),
            },
            parent_bin_name: parent_bin_name.to_string(),
            origin,
        })
    }

    pub fn apply_dump(
        &mut self,
        query: BinQuery,
        parent_bin_name: String,
        origin: DumpOrigin,
        result: Result<String, AgentError>,
    ) -> Option<AgentRequest> {
        let tick_session = match origin {
            DumpOrigin::RefreshTick { session_id } => Some(session_id),
            _ => None,
        };
        if let Some(session) = self
            .refresh
            .as_mut()
            .filter(|session| Some(session.id) == tick_session)
        {
            session.tick_in_flight = false;
        }

        let descriptor = match result {
            Ok(source) => PipelineDescriptor::new(
                query.pipeline_name.as_str(),
                parent_bin_name,
                query.bin_name.as_str(),
                source,
            )
            .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match descriptor {
            Ok(descriptor) => self.display_pipeline(descriptor),
            Err(err) => {
                warn!(
                    event = "view_dump_failed",
                    pipeline = %query.pipeline_name,
                    bin = %query.bin_name,
                    error = %err
                );
                let failed_session = self
                    .refresh
                    .as_ref()
                    .is_some_and(|session| Some(session.id) == tick_session);
                if failed_session {
                    info!(event = "auto_refresh_cancelled", pipeline = %query.pipeline_name);
                    self.stop_auto_refresh();
                }
                None
            }
        }
    }

    /// Start or stop auto-refresh. Returns whether it is now on.
    pub fn toggle_auto_refresh(&mut self) -> bool {
        if self.refresh.is_some() {
            self.stop_auto_refresh();
            return false;
        }
        let Some(descriptor) = &self.descriptor else {
            return false;
        };
        self.next_session_id += 1;
        let id = self.next_session_id;
        self.refresh = Some(RefreshSession {
            id,
            ticker: TickerHandle::spawn(self.refresh_period, id, self.ticks.clone()),
            current_bin_name: descriptor.bin_name().to_string(),
            current_parent_bin_name: descriptor.parent_bin_name().to_string(),
            tick_in_flight: false,
        });
        info!(event = "auto_refresh_started", session_id = id, pipeline = descriptor.name());
        true
    }

    pub fn stop_auto_refresh(&mut self) {
        if let Some(session) = self.refresh.take() {
            session.ticker.cancel();
        }
    }

    /// Re-dump the session's bin, unless the previous tick's dump is still
    /// outstanding or the tick belongs to an ended session.
    pub fn refresh_tick(&mut self, tick: RefreshTick) -> Option<AgentRequest> {
        let session = self.refresh.as_mut()?;
        if session.id != tick.session_id {
            return None;
        }
        if session.tick_in_flight {
            debug!(event = "auto_refresh_tick_skipped", session_id = session.id);
            return None;
        }
        session.tick_in_flight = true;
        let bin_name = session.current_bin_name.clone();
        let parent_bin_name = session.current_parent_bin_name.clone();
        let request = self.display_bin(
            &bin_name,
            &parent_bin_name,
            DumpOrigin::RefreshTick {
                session_id: tick.session_id,
            },
        );
        if request.is_none() {
            if let Some(session) = &mut self.refresh {
                session.tick_in_flight = false;
            }
        }
        request
    }

    pub fn export(&self) -> Result<PathBuf, SaveError> {
        let descriptor = self.descriptor.as_ref().ok_or(SaveError::NothingToSave)?;
        self.save_sink.save(&descriptor.save_data())
    }

    fn transformed(&mut self, changed: bool) -> bool {
        if changed {
            if let Some(pan_zoom) = &self.pan_zoom {
                self.saved_viewport = pan_zoom.viewport();
            }
        }
        changed
    }

    /// Mouse event relative to the graph area.
    pub fn handle_mouse(&mut self, event: &MouseEvent) -> bool {
        let changed = self
            .pan_zoom
            .as_mut()
            .is_some_and(|pan_zoom| pan_zoom.handle_mouse(event));
        self.transformed(changed)
    }

    pub fn pan(&mut self, dx: f64, dy: f64) -> bool {
        let changed = self
            .pan_zoom
            .as_mut()
            .is_some_and(|pan_zoom| pan_zoom.pan(dx, dy));
        self.transformed(changed)
    }

    pub fn zoom(&mut self, factor: f64, width: u16, height: u16) -> bool {
        let changed = self
            .pan_zoom
            .as_mut()
            .is_some_and(|pan_zoom| pan_zoom.zoom(factor, width, height));
        self.transformed(changed)
    }

    pub fn reset_viewport(&mut self) -> bool {
        let changed = self.pan_zoom.as_mut().is_some_and(PanZoomController::reset);
        self.transformed(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipescope_core::SaveData;
    use std::sync::{Arc, Mutex};

    const ROOT: &str = r#"digraph pipeline {
  subgraph cluster_decode_0x1 {
    label="GstDecodeBin\ndecode\n[>]";
    subgraph cluster_queue_0x2 {
      label="GstQueue\nqueue\n[>]";
      queue_0x2_sink [label="sink"];
    }
  }
}
"#;

    #[derive(Clone, Default)]
    struct RecordingSink {
        saved: Arc<Mutex<Vec<SaveData>>>,
    }

    impl SaveSink for RecordingSink {
        fn save(&self, data: &SaveData) -> Result<PathBuf, SaveError> {
            self.saved.lock().expect("saved").push(data.clone());
            Ok(PathBuf::from(&data.suggested_filename))
        }
    }

    fn view() -> (PipelineView, mpsc::Receiver<RefreshTick>, RecordingSink) {
        let (ticks, tick_rx) = mpsc::channel(4);
        let sink = RecordingSink::default();
        (PipelineView::new(ticks, Box::new(sink.clone())), tick_rx, sink)
    }

    fn root() -> PipelineDescriptor {
        PipelineDescriptor::new("player", "", "", ROOT).expect("descriptor")
    }

    fn bins_request_generation(request: Option<AgentRequest>) -> u64 {
        match request {
            Some(AgentRequest::ListChildBinNames { generation, .. }) => generation,
            other => panic!("expected bin listing, got {other:?}"),
        }
    }

    fn dump_parts(request: Option<AgentRequest>) -> (BinQuery, String, DumpOrigin) {
        match request {
            Some(AgentRequest::DumpPipeline {
                query,
                parent_bin_name,
                origin,
            }) => (query, parent_bin_name, origin),
            other => panic!("expected dump, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn display_builds_selector_from_child_bins() {
        let (mut view, _ticks, _sink) = view();
        assert!(!view.export_enabled());
        assert!(!view.auto_refresh_available());

        let generation = bins_request_generation(view.display_pipeline(root()));
        assert!(view.export_enabled());
        assert!(view.selector().is_none());

        view.apply_child_bins(generation, Ok(vec!["decode".to_string()]));
        let selector = view.selector().expect("selector");
        assert_eq!(
            selector.entries(),
            &[
                SelectorEntry::Placeholder,
                SelectorEntry::Parent {
                    bin_name: String::new()
                },
                SelectorEntry::Child {
                    bin_name: "decode".to_string(),
                    parent_bin_name: String::new()
                },
            ]
        );
        assert_eq!(selector.highlighted(), 0);
        assert_eq!(view.choose_highlighted(), None);
        assert_eq!(
            view.label().as_deref(),
            Some("Displaying player. Available children bins:")
        );
    }

    #[tokio::test]
    async fn stale_bin_listing_is_discarded() {
        let (mut view, _ticks, _sink) = view();
        let first = bins_request_generation(view.display_pipeline(root()));
        let second = bins_request_generation(view.display_pipeline(root()));
        assert_ne!(first, second);

        view.apply_child_bins(first, Ok(vec!["old".to_string()]));
        assert!(view.selector().is_none());
        view.apply_child_bins(second, Ok(Vec::new()));
        assert_eq!(view.selector().expect("selector").entries().len(), 2);
    }

    #[tokio::test]
    async fn choosing_a_child_navigates_into_it() {
        let (mut view, _ticks, _sink) = view();
        let generation = bins_request_generation(view.display_pipeline(root()));
        view.apply_child_bins(generation, Ok(vec!["decode".to_string()]));

        let (query, parent, origin) = dump_parts(view.choose_entry(2));
        assert_eq!(query.pipeline_name, "player");
        assert_eq!(query.bin_name, "decode");
        assert_eq!(parent, "");
        assert_eq!(origin, DumpOrigin::Navigation);

        let request = view.apply_dump(query, parent, origin, Ok(ROOT.to_string()));
        bins_request_generation(request);
        let descriptor = view.descriptor().expect("descriptor");
        assert_eq!(descriptor.bin_name(), "decode");
        assert_eq!(descriptor.display_name(), "decode");

        // Parent entries navigate up with no grandparent.
        view.apply_child_bins(view.generation, Ok(Vec::new()));
        let (query, parent, _) = dump_parts(view.choose_entry(1));
        assert_eq!(query.bin_name, "");
        assert_eq!(parent, "");
    }

    #[tokio::test]
    async fn failed_navigation_keeps_current_graph() {
        let (mut view, _ticks, _sink) = view();
        view.display_pipeline(root());
        let request = view.display_bin("decode", "", DumpOrigin::Navigation);
        let (query, parent, origin) = dump_parts(request);
        let result = view.apply_dump(query, parent, origin, Err(AgentError::Disconnected));
        assert_eq!(result, None);
        assert!(view.descriptor().expect("descriptor").is_root());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_cancels_session() {
        let (mut view, mut ticks, _sink) = view();
        let generation = bins_request_generation(view.display_pipeline(root()));
        view.apply_child_bins(generation, Ok(vec!["decode".to_string()]));
        let (query, parent, origin) = dump_parts(view.choose_entry(2));
        view.apply_dump(query, parent, origin, Ok(ROOT.to_string()));

        assert!(view.toggle_auto_refresh());
        assert!(view.auto_refresh_active());
        assert_eq!(view.label().as_deref(), Some("Displaying decode."));

        let tick = tokio::time::timeout(Duration::from_millis(1500), ticks.recv())
            .await
            .expect("tick within period")
            .expect("tick");
        let (query, parent, origin) = dump_parts(view.refresh_tick(tick));
        assert_eq!(query.bin_name, "decode");
        assert_eq!(origin, DumpOrigin::RefreshTick { session_id: tick.session_id });

        view.apply_dump(
            query,
            parent,
            origin,
            Err(AgentError::Remote {
                code: "unknown_bin".to_string(),
                message: "No bin named decode in pipeline player".to_string(),
            }),
        );
        assert!(!view.auto_refresh_active());
        assert!(view.refresh_session().is_none());
        assert_eq!(view.refresh_tick(tick), None);

        let late = tokio::time::timeout(Duration::from_secs(5), ticks.recv()).await;
        assert!(late.is_err(), "ticker kept running after cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ticks_are_skipped() {
        let (mut view, _ticks, _sink) = view();
        view.display_pipeline(root());
        view.toggle_auto_refresh();
        let tick = RefreshTick {
            session_id: view.refresh_session().expect("session").id(),
        };

        let (query, parent, origin) = dump_parts(view.refresh_tick(tick));
        assert!(view.refresh_session().expect("session").tick_in_flight());
        assert_eq!(view.refresh_tick(tick), None);
        assert_eq!(
            view.refresh_tick(RefreshTick {
                session_id: tick.session_id + 1
            }),
            None
        );

        // A refresh-driven swap skips the bin listing.
        assert_eq!(view.apply_dump(query, parent, origin, Ok(ROOT.to_string())), None);
        assert!(!view.refresh_session().expect("session").tick_in_flight());
        assert!(view.refresh_tick(tick).is_some());

        assert!(!view.toggle_auto_refresh());
        assert!(!view.auto_refresh_active());
    }

    #[tokio::test(start_paused = true)]
    async fn viewport_survives_refresh_but_not_manual_display() {
        let (mut view, _ticks, _sink) = view();
        view.display_pipeline(root());
        assert!(view.pan(3.0, -2.0));
        assert!(view.zoom(2.0, 0, 0));
        let moved = view.viewport();
        assert_ne!(moved, ViewportState::default());

        view.toggle_auto_refresh();
        view.display_pipeline(root());
        assert_eq!(view.viewport(), moved);

        view.stop_auto_refresh();
        view.display_pipeline(root());
        assert_eq!(view.viewport(), ViewportState::default());
    }

    #[tokio::test]
    async fn export_offers_raw_graph_text() {
        let (mut view, _ticks, sink) = view();
        assert!(matches!(view.export(), Err(SaveError::NothingToSave)));
        assert!(!view.toggle_auto_refresh());

        view.display_pipeline(root());
        let path = view.export().expect("export");
        assert_eq!(path, PathBuf::from("GStreamer-pipeline-dump-player.dot"));
        let saved = sink.saved.lock().expect("saved");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].content, ROOT);
    }
}
