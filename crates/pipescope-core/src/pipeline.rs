use crate::dot::{DotGraph, DotParseError};
use crate::layout::GraphLayout;
use std::sync::Arc;
use thiserror::Error;

/// Parsed pipeline graph plus its layout.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineGraph {
    pub dot: DotGraph,
    pub layout: GraphLayout,
}

/// Parse and lay out a DOT description. Identical input yields an
/// identical graph.
pub fn render_graph(source: &str) -> Result<PipelineGraph, DotParseError> {
    let dot = DotGraph::parse(source)?;
    let layout = GraphLayout::compute(&dot);
    Ok(PipelineGraph { dot, layout })
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("pipeline name must not be empty")]
    EmptyName,
    #[error("invalid pipeline graph: {0}")]
    Graph(#[from] DotParseError),
}

/// File name and content offered when exporting a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveData {
    pub suggested_filename: String,
    pub content: String,
}

/// An immutable snapshot of one pipeline (or one bin of it).
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    name: String,
    parent_bin_name: String,
    bin_name: String,
    graph_source: String,
    rendered_graph: Arc<PipelineGraph>,
}

impl PipelineDescriptor {
    pub fn new(
        name: impl Into<String>,
        parent_bin_name: impl Into<String>,
        bin_name: impl Into<String>,
        graph_source: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        let graph_source = graph_source.into();
        let rendered_graph = Arc::new(render_graph(&graph_source)?);
        Ok(Self {
            name,
            parent_bin_name: parent_bin_name.into(),
            bin_name: bin_name.into(),
            graph_source,
            rendered_graph,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_bin_name(&self) -> &str {
        &self.parent_bin_name
    }

    pub fn bin_name(&self) -> &str {
        &self.bin_name
    }

    pub fn graph_source(&self) -> &str {
        &self.graph_source
    }

    pub fn rendered_graph(&self) -> &PipelineGraph {
        &self.rendered_graph
    }

    pub fn is_root(&self) -> bool {
        self.bin_name.is_empty()
    }

    pub fn display_name(&self) -> String {
        if self.is_root() {
            self.name.clone()
        } else {
            self.bin_name.clone()
        }
    }

    pub fn save_data(&self) -> SaveData {
        SaveData {
            suggested_filename: format!("GStreamer-pipeline-dump-{}.dot", self.name),
            content: self.graph_source.clone(),
        }
    }
}
