//! Redraws translated text into the original block geometry.

pub(crate) mod log;

pub use log::{FailedBlock, RenderLog, RenderedBlock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{DocumentBackend, Placement, PlacementMode, RedactOptions, TextPlacement};
use crate::document::{Block, BlockType, Document, Page};
use crate::fonts::{FontPaths, FontRole};
use crate::geometry::RasterRect;
use crate::layout::Alignment;

/// Sizes below this are never attempted, whatever the configured floor.
const MIN_FONT_SIZE: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub fonts: FontPaths,
    /// Headings on the first page above `title_max_top` (raster space).
    pub title_size: f32,
    pub title_max_top: f32,
    pub heading_size: f32,
    pub caption_size: f32,
    pub label_size: f32,
    pub sidebar_size: f32,
    /// Tables, running headers and footers.
    pub table_size: f32,
    pub body_size: f32,
    /// Body blocks narrower than `narrow_width` or shorter than
    /// `short_height` start here instead.
    pub body_compact_size: f32,
    pub narrow_width: f32,
    pub short_height: f32,
    pub floor_size: f32,
    pub padding_x: f32,
    pub padding_y: f32,
    /// Boxes must exceed this in both directions to be padded.
    pub padding_min_extent: f32,
    pub line_height: f32,
    pub forced_line_height: f32,
    pub compress: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            fonts: FontPaths::default(),
            title_size: 24.0,
            title_max_top: 200.0,
            heading_size: 16.0,
            caption_size: 9.0,
            label_size: 9.0,
            sidebar_size: 9.0,
            table_size: 9.0,
            body_size: 10.5,
            body_compact_size: 9.0,
            narrow_width: 130.0,
            short_height: 20.0,
            floor_size: 3.0,
            padding_x: 2.0,
            padding_y: 1.0,
            padding_min_extent: 10.0,
            line_height: 1.2,
            forced_line_height: 1.1,
            compress: true,
        }
    }
}

/// Face, alignment and starting size for one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockPlan {
    pub font: FontRole,
    pub align: Alignment,
    pub target_size: f32,
}

pub fn plan_block(
    block: &Block,
    page_index: usize,
    page_height: f32,
    settings: &RenderSettings,
) -> BlockPlan {
    let font = if block.style.bold || block.kind == BlockType::Heading {
        FontRole::SansBold
    } else if block.kind == BlockType::Body {
        FontRole::Serif
    } else {
        FontRole::SansRegular
    };
    let align = match block.kind {
        BlockType::Label | BlockType::Caption => Alignment::Center,
        BlockType::Body => Alignment::Justify,
        _ => Alignment::Left,
    };
    let target_size = match block.kind {
        BlockType::Heading => {
            let top = block.bbox.to_raster(page_height).top();
            if page_index == 0 && top < settings.title_max_top {
                settings.title_size
            } else {
                settings.heading_size
            }
        }
        BlockType::Caption => settings.caption_size,
        BlockType::Label => settings.label_size,
        BlockType::Sidebar => settings.sidebar_size,
        BlockType::Table | BlockType::Header | BlockType::Footer => settings.table_size,
        BlockType::Body => {
            if block.bbox.width() < settings.narrow_width
                || block.bbox.height() < settings.short_height
            {
                settings.body_compact_size
            } else {
                settings.body_size
            }
        }
        BlockType::Image | BlockType::Chart => settings.body_size,
    };
    BlockPlan {
        font,
        align,
        target_size,
    }
}

/// Sizes tried by the shrink-to-fit loop, strictly decreasing from
/// `max(start, floor)` down to `floor`.
pub fn shrink_sizes(start: f32, floor: f32) -> Vec<f32> {
    let floor = floor.max(MIN_FONT_SIZE);
    let mut size = start.max(floor);
    let mut sizes = vec![size];
    while size > floor {
        size = (size - shrink_step(size)).max(floor);
        sizes.push(size);
    }
    sizes
}

fn shrink_step(size: f32) -> f32 {
    if size > 12.0 {
        1.0
    } else if size > 6.0 {
        0.5
    } else {
        0.25
    }
}

/// Drawing area for a block: its raster box, inset by the padding when the
/// box is large enough to afford it.
pub fn text_rect(block: &Block, page_height: f32, settings: &RenderSettings) -> RasterRect {
    let bbox = block.bbox;
    let min = settings.padding_min_extent;
    let padded = if bbox.width() > min && bbox.height() > min {
        bbox.inset(settings.padding_x, settings.padding_y)
    } else {
        bbox
    };
    padded.to_raster(page_height)
}

fn render_text(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitOutcome {
    Fitted(f32),
    /// Drawn at the floor size although it overflows.
    Forced,
}

pub struct ShapeAwareRenderer<'a, B: DocumentBackend> {
    backend: &'a mut B,
    settings: &'a RenderSettings,
}

impl<'a, B: DocumentBackend> ShapeAwareRenderer<'a, B> {
    pub fn new(backend: &'a mut B, settings: &'a RenderSettings) -> Self {
        Self { backend, settings }
    }

    /// Renders every page of `document`, appending to `log` as blocks are
    /// attempted so the log is complete up to the point of any failure.
    pub fn render(&mut self, document: &Document, log: &mut RenderLog) -> Result<()> {
        let page_count = self.backend.page_count();
        for page in &document.pages {
            if page.page_index >= page_count {
                warn!(
                    "page {} is not in the source document ({} pages); skipping",
                    page.page_index, page_count
                );
                continue;
            }
            self.render_page(page, log)
                .with_context(|| format!("failed to render page {}", page.page_index))?;
        }
        info!(
            "rendered {} blocks, {} forced at the floor size",
            log.rendered_blocks.len(),
            log.failed_blocks.len()
        );
        Ok(())
    }

    pub fn render_page(&mut self, page: &Page, log: &mut RenderLog) -> Result<()> {
        let blocks = page.translatable_blocks().collect::<Vec<_>>();
        if blocks.is_empty() {
            debug!("page {}: no text blocks", page.page_index);
            return Ok(());
        }
        let rects = blocks
            .iter()
            .map(|block| block.bbox.to_raster(page.height))
            .collect::<Vec<_>>();
        self.backend.embed_fonts(page.page_index)?;
        self.backend
            .redact(page.page_index, &rects, RedactOptions::default())?;
        // redaction rewrites the page resources on some backends
        self.backend.embed_fonts(page.page_index)?;

        for block in blocks {
            let plan = plan_block(block, page.page_index, page.height, self.settings);
            self.render_block(page, block, &plan, log)?;
        }
        Ok(())
    }

    pub fn render_block(
        &mut self,
        page: &Page,
        block: &Block,
        plan: &BlockPlan,
        log: &mut RenderLog,
    ) -> Result<FitOutcome> {
        let text = render_text(&block.content);
        let rect = text_rect(block, page.height, self.settings);
        let outcome = self.fit(page.page_index, rect, &text, block.style.color, plan)?;
        match outcome {
            FitOutcome::Fitted(size) => {
                debug!("{}: fitted at {:.2}pt", block.id, size);
                log.record_fitted(page.page_index, block, size, plan.target_size);
            }
            FitOutcome::Forced => {
                warn!(
                    "{}: does not fit {:.0}x{:.0} even at {:.2}pt; drawn anyway",
                    block.id,
                    block.bbox.width(),
                    block.bbox.height(),
                    self.settings.floor_size
                );
                log.record_forced(page.page_index, block, plan.target_size);
            }
        }
        Ok(outcome)
    }

    fn fit(
        &mut self,
        page: usize,
        rect: RasterRect,
        text: &str,
        color: [f32; 3],
        plan: &BlockPlan,
    ) -> Result<FitOutcome> {
        let mut placement = TextPlacement {
            rect,
            text,
            font: plan.font,
            size: plan.target_size,
            color,
            align: plan.align,
            line_height: self.settings.line_height,
            mode: PlacementMode::Fit,
        };
        let sizes = shrink_sizes(plan.target_size, self.settings.floor_size);
        let floor = sizes.last().copied().unwrap_or(self.settings.floor_size);
        for size in sizes {
            placement.size = size;
            if self.backend.insert_text(page, &placement)? == Placement::Fitted {
                return Ok(FitOutcome::Fitted(size));
            }
        }
        placement.size = floor;
        placement.line_height = self.settings.forced_line_height;
        placement.mode = PlacementMode::Force;
        self.backend.insert_text(page, &placement)?;
        Ok(FitOutcome::Forced)
    }
}
