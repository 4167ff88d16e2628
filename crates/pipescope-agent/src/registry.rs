use pipescope_core::{DotGraph, DotParseError};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const DUMP_EXTENSION: &str = "dot";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No active pipeline named {0}")]
    UnknownPipeline(String),
    #[error("No bin named {bin} in pipeline {pipeline}")]
    UnknownBin { pipeline: String, bin: String },
    #[error("failed to read pipelines from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pipeline {pipeline} has an invalid graph: {source}")]
    Graph {
        pipeline: String,
        #[source]
        source: DotParseError,
    },
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::UnknownPipeline(_) => "unknown_pipeline",
            RegistryError::UnknownBin { .. } => "unknown_bin",
            RegistryError::Io { .. } => "io_error",
            RegistryError::Graph { .. } => "invalid_graph",
        }
    }
}

/// Active pipelines, one `<name>.dot` dump per pipeline in a directory.
#[derive(Debug, Clone)]
pub struct PipelineRegistry {
    dir: PathBuf,
}

impl PipelineRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sorted names of every dump in the directory. A missing directory has
    /// no pipelines.
    pub fn pipeline_names(&self) -> Result<Vec<String>, RegistryError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(DUMP_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if is_pipeline_name(stem) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn source_for(&self, pipeline: &str) -> Result<String, RegistryError> {
        if !is_pipeline_name(pipeline) {
            return Err(RegistryError::UnknownPipeline(pipeline.to_string()));
        }
        let path = self.dir.join(format!("{pipeline}.{DUMP_EXTENSION}"));
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(RegistryError::UnknownPipeline(pipeline.to_string()))
            }
            Err(source) => Err(RegistryError::Io { path, source }),
        }
    }

    fn graph_for(&self, pipeline: &str) -> Result<(String, DotGraph), RegistryError> {
        let source = self.source_for(pipeline)?;
        let graph = DotGraph::parse(&source).map_err(|source| RegistryError::Graph {
            pipeline: pipeline.to_string(),
            source,
        })?;
        Ok((source, graph))
    }

    /// Bins directly inside `bin` (the pipeline itself when empty). Unknown
    /// pipelines and bins have no children.
    pub fn child_bin_names(&self, pipeline: &str, bin: &str) -> Vec<String> {
        match self.graph_for(pipeline) {
            Ok((_, graph)) => graph.child_bin_names(bin).unwrap_or_default(),
            Err(err) => {
                debug!(event = "child_bins_unavailable", pipeline, bin, error = %err);
                Vec::new()
            }
        }
    }

    /// DOT text for the pipeline, or for one of its bins cut out as a
    /// standalone graph.
    pub fn dump_pipeline(&self, pipeline: &str, bin: &str) -> Result<String, RegistryError> {
        if bin.is_empty() {
            return self.source_for(pipeline);
        }
        let (_, graph) = self.graph_for(pipeline)?;
        graph
            .extract_bin(bin)
            .map(|extracted| extracted.to_dot())
            .ok_or_else(|| RegistryError::UnknownBin {
                pipeline: pipeline.to_string(),
                bin: bin.to_string(),
            })
    }
}

fn is_pipeline_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\'])
}
