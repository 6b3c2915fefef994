//! Source document to intermediate document.

mod classify;
mod style;

pub use classify::{BlockClassifier, ClassifierRule, ClassifierThresholds, ClassifyInput};
pub use style::{FontFlags, font_flags, join_content, sample_style};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::backend::{DocumentBackend, PageGroup, TextRun};
use crate::document::{Block, BlockStyle, BlockType, Document, Page, block_id};
use crate::geometry::RasterRect;

/// Blocks whose top edges are this close share a row in reading order.
const ROW_TIE_BAND: f32 = 3.0;

const IMAGE_PLACEHOLDER: &str = "[IMAGE]";

pub struct DocumentExtractor<'a, B: DocumentBackend> {
    backend: &'a B,
    classifier: BlockClassifier,
}

impl<'a, B: DocumentBackend> DocumentExtractor<'a, B> {
    pub fn new(backend: &'a B, classifier: BlockClassifier) -> Self {
        Self {
            backend,
            classifier,
        }
    }

    pub fn extract(&self, filename: &str) -> Result<Document> {
        let page_count = self.backend.page_count();
        let mut pages = Vec::with_capacity(page_count);
        for page_index in 0..page_count {
            let page = self
                .extract_page(page_index)
                .with_context(|| format!("failed to extract page {}", page_index))?;
            pages.push(page);
        }
        let document = Document::new(filename, pages);
        info!(
            "extracted {} blocks ({} translatable) from {} pages of {}",
            document.blocks().count(),
            document.translatable_blocks().count(),
            page_count,
            filename
        );
        Ok(document)
    }

    pub fn extract_page(&self, page_index: usize) -> Result<Page> {
        let (width, height) = self.backend.page_size(page_index)?;
        let groups = self.backend.groups(page_index)?;
        let mut blocks = groups
            .into_iter()
            .filter_map(|group| self.block_from_group(page_index, height, group))
            .collect::<Vec<_>>();
        sort_reading_order(&mut blocks);
        assign_ids(page_index, &mut blocks);
        debug!("page {}: {} blocks", page_index, blocks.len());
        Ok(Page {
            page_index,
            width,
            height,
            blocks,
        })
    }

    fn block_from_group(
        &self,
        page_index: usize,
        page_height: f32,
        group: PageGroup,
    ) -> Option<Block> {
        match group {
            PageGroup::Text { bbox, runs } => {
                let content = join_content(&runs);
                if content.is_empty() {
                    return None;
                }
                let style = sample_style(&runs)?;
                let bbox = bbox.to_document(page_height);
                let kind = self.classifier.classify(&ClassifyInput {
                    style: &style,
                    content: &content,
                    bbox,
                    page_height,
                    page_index,
                });
                Some(Block {
                    id: String::new(),
                    kind,
                    bbox,
                    content,
                    style,
                    metadata: base_metadata(page_index, bbox.width(), bbox.height()),
                })
            }
            PageGroup::Image { bbox } => Some(image_block(page_index, page_height, bbox)),
            PageGroup::Figure { bbox, runs } => {
                let content = join_content(&runs);
                if content.is_empty() {
                    return Some(image_block(page_index, page_height, bbox));
                }
                let doc_bbox = bbox.to_document(page_height);
                let mut metadata = base_metadata(page_index, doc_bbox.width(), doc_bbox.height());
                metadata["is_atomic"] = Value::Bool(true);
                metadata["chart_text_blocks"] = chart_text_blocks(&runs, page_height);
                Some(Block {
                    id: String::new(),
                    kind: BlockType::Chart,
                    bbox: doc_bbox,
                    content,
                    style: sample_style(&runs).unwrap_or_default(),
                    metadata,
                })
            }
        }
    }
}

fn image_block(page_index: usize, page_height: f32, bbox: RasterRect) -> Block {
    let bbox = bbox.to_document(page_height);
    Block {
        id: String::new(),
        kind: BlockType::Image,
        bbox,
        content: IMAGE_PLACEHOLDER.to_string(),
        style: BlockStyle::default(),
        metadata: base_metadata(page_index, bbox.width(), bbox.height()),
    }
}

fn base_metadata(page_index: usize, width: f32, height: f32) -> Value {
    json!({
        "page": page_index,
        "width": round2(width),
        "height": round2(height),
    })
}

fn chart_text_blocks(runs: &[TextRun], page_height: f32) -> Value {
    Value::Array(
        runs.iter()
            .filter(|run| !run.text.trim().is_empty())
            .map(|run| {
                json!({
                    "text": run.text.trim(),
                    "bbox": run.bbox.to_document(page_height),
                })
            })
            .collect(),
    )
}

fn round2(value: f32) -> f64 {
    (value as f64 * 100.0).round() / 100.0
}

/// Top to bottom, then left to right within rows of near-equal top edges.
fn sort_reading_order(blocks: &mut [Block]) {
    blocks.sort_by(|a, b| b.bbox.y1.total_cmp(&a.bbox.y1).then(a.bbox.x0.total_cmp(&b.bbox.x0)));
    let mut start = 0;
    while start < blocks.len() {
        let row_top = blocks[start].bbox.y1;
        let end = blocks[start..]
            .iter()
            .position(|block| row_top - block.bbox.y1 > ROW_TIE_BAND)
            .map(|offset| start + offset)
            .unwrap_or(blocks.len());
        blocks[start..end].sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
        start = end;
    }
}

/// The first block with a given geometry keeps the plain id; later ones get
/// `_1`, `_2`, ... in reading order.
fn assign_ids(page_index: usize, blocks: &mut [Block]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for block in blocks.iter_mut() {
        let base = block_id(page_index, &block.bbox);
        let count = seen.entry(base.clone()).or_insert(0);
        block.id = if *count == 0 {
            base
        } else {
            format!("{}_{}", base, count)
        };
        *count += 1;
    }
}
