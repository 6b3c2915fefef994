//! The intermediate document passed between pipeline stages.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::Path;

use crate::error::PreconditionError;
use crate::geometry::Rect;

pub const FORMAT_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Heading,
    Body,
    Caption,
    Label,
    Sidebar,
    Header,
    Footer,
    Table,
    Image,
    Chart,
}

impl BlockType {
    pub const ALL: [BlockType; 10] = [
        BlockType::Heading,
        BlockType::Body,
        BlockType::Caption,
        BlockType::Label,
        BlockType::Sidebar,
        BlockType::Header,
        BlockType::Footer,
        BlockType::Table,
        BlockType::Image,
        BlockType::Chart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Heading => "heading",
            BlockType::Body => "body",
            BlockType::Caption => "caption",
            BlockType::Label => "label",
            BlockType::Sidebar => "sidebar",
            BlockType::Header => "header",
            BlockType::Footer => "footer",
            BlockType::Table => "table",
            BlockType::Image => "image",
            BlockType::Chart => "chart",
        }
    }

    /// Image and chart blocks are never sent for translation or redrawn.
    pub fn is_translatable(&self) -> bool {
        !matches!(self, BlockType::Image | BlockType::Chart)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontFamily {
    Serif,
    Sans,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockStyle {
    pub size: f32,
    /// Normalized RGB, each channel in `0.0..=1.0`.
    pub color: [f32; 3],
    pub bold: bool,
    pub italic: bool,
    pub family: FontFamily,
    pub font_name: String,
}

impl Default for BlockStyle {
    fn default() -> Self {
        Self {
            size: 10.0,
            color: [0.0, 0.0, 0.0],
            bold: false,
            italic: false,
            family: FontFamily::Sans,
            font_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BlockType,
    pub bbox: Rect,
    pub content: String,
    pub style: BlockStyle,
    #[serde(default)]
    pub metadata: Value,
}

impl Block {
    pub fn is_translatable(&self) -> bool {
        self.kind.is_translatable() && !self.content.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub page_index: usize,
    pub width: f32,
    pub height: f32,
    pub blocks: Vec<Block>,
}

impl Page {
    pub fn translatable_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|block| block.is_translatable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationStatus {
    Complete,
    Partial,
}

impl TranslationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranslationStatus::Complete => "complete",
            TranslationStatus::Partial => "partial",
        }
    }
}

/// Recorded on a document once the translation stage has run over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationSummary {
    pub status: TranslationStatus,
    pub failed_pages: Vec<usize>,
    pub target_language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub filename: String,
    pub total_pages: usize,
    pub version: String,
    pub pages: Vec<Page>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<TranslationSummary>,
}

impl Document {
    pub fn new(filename: impl Into<String>, pages: Vec<Page>) -> Self {
        Self {
            filename: filename.into(),
            total_pages: pages.len(),
            version: FORMAT_VERSION.to_string(),
            pages,
            translation: None,
        }
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.pages.iter().flat_map(|page| page.blocks.iter())
    }

    pub fn translatable_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks().filter(|block| block.is_translatable())
    }

    pub fn find_block(&self, id: &str) -> Option<&Block> {
        self.blocks().find(|block| block.id == id)
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

/// Stable id for a block: the same page and geometry always give the same id.
pub fn block_id(page_index: usize, bbox: &Rect) -> String {
    let key = format!(
        "{}-{:.2}-{:.2}-{:.2}-{:.2}",
        page_index, bbox.x0, bbox.y0, bbox.x1, bbox.y1
    );
    let digest = format!("{:x}", md5::compute(key.as_bytes()));
    format!("p{}_{}", page_index, &digest[..8])
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(PreconditionError::MissingCheckpoint(path.to_path_buf()).into());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Writes pretty JSON next to `path` and moves it into place, so readers never
/// observe a half-written file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory: {}", dir.display()))?;
    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut file, value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    file.write_all(b"\n")?;
    file.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_document() -> Document {
        let bbox = Rect::new(72.0, 600.0, 540.0, 700.0);
        Document::new(
            "paper.pdf",
            vec![Page {
                page_index: 0,
                width: 612.0,
                height: 792.0,
                blocks: vec![
                    Block {
                        id: block_id(0, &bbox),
                        kind: BlockType::Body,
                        bbox,
                        content: "Results are reported below.".to_string(),
                        style: BlockStyle {
                            size: 10.5,
                            family: FontFamily::Serif,
                            font_name: "times-roman".to_string(),
                            ..BlockStyle::default()
                        },
                        metadata: json!({"height": 100.0, "page": 0, "width": 468.0}),
                    },
                    Block {
                        id: "p0_img".to_string(),
                        kind: BlockType::Image,
                        bbox: Rect::new(72.0, 300.0, 300.0, 500.0),
                        content: String::new(),
                        style: BlockStyle::default(),
                        metadata: Value::Null,
                    },
                ],
            }],
        )
    }

    #[test]
    fn block_id_is_deterministic() {
        let bbox = Rect::new(10.0, 20.0, 30.0, 40.0);
        assert_eq!(block_id(3, &bbox), block_id(3, &bbox));
        assert_ne!(block_id(3, &bbox), block_id(4, &bbox));
        assert!(block_id(3, &bbox).starts_with("p3_"));
        assert_eq!(block_id(3, &bbox).len(), "p3_".len() + 8);
    }

    #[test]
    fn image_blocks_are_not_translatable() {
        let document = sample_document();
        let ids: Vec<_> = document.translatable_blocks().map(|b| b.id.clone()).collect();
        assert_eq!(ids.len(), 1);
        assert!(ids[0].starts_with("p0_"));
    }

    #[test]
    fn checkpoint_round_trip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("intermediate.json");
        let document = sample_document();
        document.save(&path).unwrap();
        let loaded = Document::load(&path).unwrap();
        assert_eq!(loaded, document);
    }

    #[test]
    fn missing_checkpoint_is_a_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Document::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.downcast_ref::<PreconditionError>().is_some());
    }

    #[test]
    fn serialized_checkpoint_snapshot() {
        let json = serde_json::to_string_pretty(&sample_document()).unwrap();
        insta::assert_snapshot!(json);
    }
}
