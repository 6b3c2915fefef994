use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::document::{Block, BlockType, read_json, write_json_atomic};

const PREVIEW_CHARS: usize = 40;

/// One record per block the renderer attempted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderLog {
    pub rendered_blocks: Vec<RenderedBlock>,
    #[serde(default)]
    pub failed_blocks: Vec<FailedBlock>,
}

/// A block that fit its box at `font_size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedBlock {
    pub id: String,
    pub page: usize,
    #[serde(rename = "type")]
    pub kind: BlockType,
    pub font_size: f32,
    pub target_size: f32,
    pub box_width: f32,
    pub box_height: f32,
}

/// A block that did not fit even at the floor size and was drawn anyway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBlock {
    pub id: String,
    pub page: usize,
    #[serde(rename = "type")]
    pub kind: BlockType,
    pub content_preview: String,
    pub box_width: f32,
    pub box_height: f32,
    pub target_size: f32,
}

impl RenderLog {
    pub fn record_fitted(&mut self, page: usize, block: &Block, font_size: f32, target_size: f32) {
        self.rendered_blocks.push(RenderedBlock {
            id: block.id.clone(),
            page,
            kind: block.kind,
            font_size,
            target_size,
            box_width: block.bbox.width(),
            box_height: block.bbox.height(),
        });
    }

    pub fn record_forced(&mut self, page: usize, block: &Block, target_size: f32) {
        self.failed_blocks.push(FailedBlock {
            id: block.id.clone(),
            page,
            kind: block.kind,
            content_preview: preview(&block.content),
            box_width: block.bbox.width(),
            box_height: block.bbox.height(),
            target_size,
        });
    }

    pub fn attempted(&self) -> usize {
        self.rendered_blocks.len() + self.failed_blocks.len()
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

pub(crate) fn preview(content: &str) -> String {
    content.trim().chars().take(PREVIEW_CHARS).collect()
}
