//! Point-in-time memory analysis combining the sampled metrics with the
//! image element estimates.

use crate::images::{analyze_images, ImageSource};
use crate::threshold::DiagnosticsSource;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryAnalysis {
    pub used_ram_mb: f64,
    pub used_gfx_mb: f64,
    pub used_ram_percent: f64,
    pub used_gfx_percent: f64,
    /// Estimated RAM held by image elements, in MB.
    pub images_ram_mb: f64,
    /// Estimated graphics memory held by image elements, in MB.
    pub images_gfx_mb: f64,
}

impl MemoryAnalysis {
    pub fn collect<S: ImageSource + ?Sized>(source: &dyn DiagnosticsSource, images: &S) -> Self {
        let report = analyze_images(images);
        Self {
            used_ram_mb: source.used_ram_mb(),
            used_gfx_mb: source.used_gfx_mb(),
            used_ram_percent: source.used_ram_percent(),
            used_gfx_percent: source.used_gfx_percent(),
            images_ram_mb: report.total_ram,
            images_gfx_mb: report.total_gfx,
        }
    }

    pub fn log(&self) {
        info!(
            event = "memory_analysis",
            used_ram_mb = self.used_ram_mb,
            used_gfx_mb = self.used_gfx_mb,
            used_ram_percent = self.used_ram_percent,
            used_gfx_percent = self.used_gfx_percent,
            images_ram_mb = self.images_ram_mb,
            images_gfx_mb = self.images_gfx_mb
        );
    }
}

impl fmt::Display for MemoryAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory analysis:")?;
        writeln!(
            f,
            "  RAM in use: {:.1}MB ({:.1}%)",
            self.used_ram_mb, self.used_ram_percent
        )?;
        writeln!(
            f,
            "  GFX in use: {:.1}MB ({:.1}%)",
            self.used_gfx_mb, self.used_gfx_percent
        )?;
        writeln!(f, "  Image elements:")?;
        writeln!(f, "    Estimated RAM used by images: {}MB", self.images_ram_mb)?;
        writeln!(f, "    Estimated GFX used by images: {}MB", self.images_gfx_mb)
    }
}
