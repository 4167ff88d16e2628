//! Page-level diagnostics: network reachability, memory thresholds and
//! memory reports.

pub mod analysis;
pub mod images;
pub mod reachability;
pub mod system_source;
pub mod threshold;

pub use analysis::MemoryAnalysis;
pub use images::{
    analyze_images, ImageElement, ImageMemoryReport, ImageSnapshot, ImageSource, SnapshotError,
};
pub use reachability::{HttpProbe, Probe, ReachabilityHandle, ReachabilityPoller, ReachabilityState};
pub use system_source::SystemDiagnostics;
pub use threshold::{
    DiagnosticsSource, MemoryMonitors, MetricKind, ThresholdConfig, ThresholdError,
    ThresholdMonitor,
};
