//! Memory report for the image elements of a document.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// One image element with its estimated memory cost in MB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageElement {
    pub description: String,
    #[serde(default)]
    pub estimated_ram: f64,
    #[serde(default)]
    pub estimated_gfx: f64,
    #[serde(default)]
    pub is_using_gfx: bool,
}

/// Anything that can enumerate the image elements of a document.
pub trait ImageSource {
    fn image_elements(&self) -> Vec<ImageElement>;
}

impl ImageSource for [ImageElement] {
    fn image_elements(&self) -> Vec<ImageElement> {
        self.to_vec()
    }
}

impl ImageSource for Vec<ImageElement> {
    fn image_elements(&self) -> Vec<ImageElement> {
        self.clone()
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read image snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid image snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

/// Image elements captured to a JSON array on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageSnapshot {
    pub elements: Vec<ImageElement>,
}

impl ImageSnapshot {
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl ImageSource for ImageSnapshot {
    fn image_elements(&self) -> Vec<ImageElement> {
        self.elements.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMemoryReport {
    pub total_ram: f64,
    pub total_gfx: f64,
    /// Elements held in RAM, largest RAM estimate first.
    pub ram_images: Vec<ImageElement>,
    /// Elements held in graphics memory, largest graphics estimate first.
    pub gfx_images: Vec<ImageElement>,
}

/// Total up every element with a nonzero estimate and split them by where
/// their pixels live.
pub fn analyze_images<S: ImageSource + ?Sized>(source: &S) -> ImageMemoryReport {
    let mut report = ImageMemoryReport::default();
    for element in source.image_elements() {
        if element.estimated_ram <= 0.0 && element.estimated_gfx <= 0.0 {
            continue;
        }
        report.total_ram += element.estimated_ram;
        report.total_gfx += element.estimated_gfx;
        if element.is_using_gfx {
            report.gfx_images.push(element);
        } else {
            report.ram_images.push(element);
        }
    }
    report
        .ram_images
        .sort_by(|a, b| descending(a.estimated_ram, b.estimated_ram));
    report
        .gfx_images
        .sort_by(|a, b| descending(a.estimated_gfx, b.estimated_gfx));
    report
}

fn descending(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

impl ImageMemoryReport {
    pub fn log(&self) {
        info!(
            event = "image_memory_report",
            total_ram_mb = self.total_ram,
            total_gfx_mb = self.total_gfx,
            ram_images = self.ram_images.len(),
            gfx_images = self.gfx_images.len()
        );
        for element in &self.ram_images {
            info!(
                event = "image_memory_ram",
                element = %element.description,
                estimated_ram_mb = element.estimated_ram
            );
        }
        for element in &self.gfx_images {
            info!(
                event = "image_memory_gfx",
                element = %element.description,
                estimated_gfx_mb = element.estimated_gfx
            );
        }
    }
}

impl fmt::Display for ImageMemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory analysis for image elements:")?;
        writeln!(f, "  Estimated total RAM used by images: {}MB", self.total_ram)?;
        writeln!(f, "  Estimated total GFX used by images: {}MB", self.total_gfx)?;
        if !self.ram_images.is_empty() {
            writeln!(f, "  RAM use of each image element (high-low):")?;
            for element in &self.ram_images {
                writeln!(f, "    {}MB\t{}", element.estimated_ram, element.description)?;
            }
        }
        if !self.gfx_images.is_empty() {
            writeln!(f, "  GFX use of each image element (high-low):")?;
            for element in &self.gfx_images {
                writeln!(f, "    {}MB\t{}", element.estimated_gfx, element.description)?;
            }
        }
        Ok(())
    }
}
