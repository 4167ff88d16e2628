//! Sidebar listing the agent's active pipelines.

use crate::agent_client::{AgentError, AgentRequest, DumpOrigin};
use pipescope_core::inspector_ipc::BinQuery;
use pipescope_core::{NameFilter, PipelineDescriptor};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogState {
    Idle,
    ListPending,
    ListPopulated,
    DetailPending,
    DetailPopulated,
}

#[derive(Debug, Clone)]
pub struct PipelineCatalog {
    state: CatalogState,
    names: Vec<String>,
    populated: bool,
    filter_input: String,
    filter: NameFilter,
    cursor: usize,
    selected: Option<String>,
    deferred: bool,
}

impl Default for PipelineCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineCatalog {
    pub fn new() -> Self {
        Self {
            state: CatalogState::Idle,
            names: Vec::new(),
            populated: false,
            filter_input: String::new(),
            filter: NameFilter::new(""),
            cursor: 0,
            selected: None,
            deferred: false,
        }
    }

    pub fn state(&self) -> CatalogState {
        self.state
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Ask for the pipeline list. Without a target the fetch waits for
    /// [`Self::target_became_available`] instead.
    pub fn refresh(&mut self, target_available: bool) -> Option<AgentRequest> {
        if !target_available {
            if !self.deferred {
                debug!(event = "catalog_refresh_deferred");
            }
            self.deferred = true;
            return None;
        }
        self.state = CatalogState::ListPending;
        Some(AgentRequest::ListPipelineNames)
    }

    /// Release a deferred refresh. Only the first call after a deferral
    /// issues a request.
    pub fn target_became_available(&mut self) -> Option<AgentRequest> {
        if !std::mem::take(&mut self.deferred) {
            return None;
        }
        self.refresh(true)
    }

    pub fn apply_names(&mut self, result: Result<Vec<String>, AgentError>) {
        match result {
            Ok(names) => {
                self.names = names;
                self.populated = true;
                self.selected = None;
                self.state = CatalogState::ListPopulated;
                self.clamp_cursor();
            }
            Err(err) => {
                warn!(event = "catalog_list_failed", error = %err);
                if self.state == CatalogState::ListPending {
                    self.state = if self.populated {
                        CatalogState::ListPopulated
                    } else {
                        CatalogState::Idle
                    };
                }
            }
        }
    }

    /// The filter as typed.
    pub fn filter_text(&self) -> &str {
        &self.filter_input
    }

    pub fn set_filter(&mut self, text: &str) {
        self.filter_input = text.to_string();
        self.filter = NameFilter::new(text);
        self.clamp_cursor();
    }

    pub fn visible_names(&self) -> Vec<&str> {
        self.names
            .iter()
            .map(String::as_str)
            .filter(|name| self.filter.matches(name))
            .collect()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn move_cursor(&mut self, delta: isize) {
        let len = self.visible_names().len();
        if len == 0 {
            self.cursor = 0;
            return;
        }
        self.cursor = self.cursor.saturating_add_signed(delta).min(len - 1);
    }

    fn clamp_cursor(&mut self) {
        let len = self.visible_names().len();
        self.cursor = self.cursor.min(len.saturating_sub(1));
    }

    pub fn select_at_cursor(&mut self) -> Option<AgentRequest> {
        let name = self.visible_names().get(self.cursor)?.to_string();
        self.select(&name)
    }

    /// Dump the whole pipeline `name`.
    pub fn select(&mut self, name: &str) -> Option<AgentRequest> {
        if !self.names.iter().any(|known| known == name) {
            return None;
        }
        self.selected = Some(name.to_string());
        self.state = CatalogState::DetailPending;
        Some(AgentRequest::DumpPipeline {
            query: BinQuery {
                pipeline_name: name.to_string(),
                bin_name: String::new(),
            },
            parent_bin_name: String::new(),
            origin: DumpOrigin::Catalog,
        })
    }

    /// Turn a root dump into a descriptor for the view. Failures are logged
    /// and leave the display alone.
    pub fn apply_dump(
        &mut self,
        pipeline_name: &str,
        result: Result<String, AgentError>,
    ) -> Option<PipelineDescriptor> {
        let descriptor = match result {
            Ok(source) => PipelineDescriptor::new(pipeline_name, "", "", source)
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match descriptor {
            Ok(descriptor) => {
                self.state = CatalogState::DetailPopulated;
                Some(descriptor)
            }
            Err(err) => {
                warn!(event = "catalog_dump_failed", pipeline = pipeline_name, error = %err);
                if self.state == CatalogState::DetailPending {
                    self.state = CatalogState::ListPopulated;
                }
                None
            }
        }
    }
}
