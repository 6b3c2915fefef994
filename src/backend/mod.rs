//! Boundary to the document library.
//!
//! Everything crossing this trait is in raster space (top-left origin). The
//! core converts to document space with [`crate::geometry`] at the call site.

use anyhow::Result;
use std::path::Path;

use crate::fonts::FontRole;
use crate::geometry::RasterRect;
use crate::layout::Alignment;

mod pdf;

pub use pdf::LopdfBackend;

/// A piece of text drawn with one font, size and color.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub size: f32,
    pub color: [f32; 3],
    pub font_name: String,
    pub bbox: RasterRect,
}

/// A region the library groups together on a page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageGroup {
    Text { bbox: RasterRect, runs: Vec<TextRun> },
    Image { bbox: RasterRect },
    /// A self-contained drawing (a form object in PDF terms). May carry text
    /// such as axis labels that belongs to the figure.
    Figure { bbox: RasterRect, runs: Vec<TextRun> },
}

impl PageGroup {
    pub fn bbox(&self) -> RasterRect {
        match self {
            PageGroup::Text { bbox, .. }
            | PageGroup::Image { bbox }
            | PageGroup::Figure { bbox, .. } => *bbox,
        }
    }
}

/// What a redaction leaves in place besides removing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedactOptions {
    pub keep_images: bool,
    pub keep_graphics: bool,
}

impl Default for RedactOptions {
    fn default() -> Self {
        Self {
            keep_images: true,
            keep_graphics: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementMode {
    /// Draw only if the text fits the rectangle.
    Fit,
    /// Draw even if the text overflows.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextPlacement<'a> {
    pub rect: RasterRect,
    pub text: &'a str,
    pub font: FontRole,
    pub size: f32,
    pub color: [f32; 3],
    pub align: Alignment,
    pub line_height: f32,
    pub mode: PlacementMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Fitted,
    Overflow,
}

pub trait DocumentBackend {
    fn page_count(&self) -> usize;

    /// Width and height of a page in points.
    fn page_size(&self, page: usize) -> Result<(f32, f32)>;

    fn groups(&self, page: usize) -> Result<Vec<PageGroup>>;

    /// Removes text inside `rects`.
    fn redact(&mut self, page: usize, rects: &[RasterRect], options: RedactOptions) -> Result<()>;

    /// Makes the configured faces available for drawing on `page`.
    fn embed_fonts(&mut self, page: usize) -> Result<()>;

    fn insert_text(&mut self, page: usize, placement: &TextPlacement<'_>) -> Result<Placement>;

    fn save(&mut self, path: &Path, compress: bool) -> Result<()>;
}
