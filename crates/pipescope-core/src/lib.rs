pub mod config;
pub mod dot;
pub mod inspector_ipc;
pub mod layout;
pub mod name_filter;
pub mod pipeline;

pub use dot::{DotCluster, DotEdge, DotGraph, DotNode, DotParseError};
pub use layout::GraphLayout;
pub use name_filter::NameFilter;
pub use pipeline::{render_graph, DescriptorError, PipelineDescriptor, PipelineGraph, SaveData};

/// Replace anything outside `[A-Za-z0-9._-]` so the value is safe to use as
/// a single path component.
pub fn sanitize_component(input: &str) -> String {
    let sanitized: String = input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.trim_matches('.').is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}
