//! Semantic block types from geometry and dominant style.
//!
//! Rules are evaluated in a fixed order and the first match wins. Every
//! threshold is a tuning constant that can be overridden from the
//! `[classifier]` settings table.

use serde::{Deserialize, Serialize};

use crate::document::{BlockStyle, BlockType};
use crate::geometry::Rect;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierThresholds {
    /// Any block strictly larger than this is a heading.
    pub heading_size: f32,
    /// Bold blocks strictly larger than this are headings.
    pub heading_bold_size: f32,
    pub sidebar_max_width: f32,
    /// Narrow blocks starting right of this x are sidebars.
    pub sidebar_right_x0: f32,
    /// Narrow blocks starting left of this x are sidebars.
    pub sidebar_left_x0: f32,
    pub caption_prefixes: Vec<String>,
    pub label_max_size: f32,
    pub label_max_width: f32,
    /// Raster top edge above which a block is a running header.
    pub header_max_top: f32,
    /// Raster top edge below which a block is a running footer.
    pub footer_min_top: f32,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            heading_size: 14.0,
            heading_bold_size: 11.0,
            sidebar_max_width: 250.0,
            sidebar_right_x0: 350.0,
            sidebar_left_x0: 100.0,
            caption_prefixes: ["figure", "fig", "table", "tab", "圖", "图", "表"]
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
            label_max_size: 10.0,
            label_max_width: 150.0,
            header_max_top: 50.0,
            footer_min_top: 700.0 - 50.0,
        }
    }
}

/// One classification rule. [`ClassifierRule::ORDER`] is the evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierRule {
    Heading,
    Sidebar,
    Caption,
    Label,
    Margin,
}

impl ClassifierRule {
    pub const ORDER: [ClassifierRule; 5] = [
        ClassifierRule::Heading,
        ClassifierRule::Sidebar,
        ClassifierRule::Caption,
        ClassifierRule::Label,
        ClassifierRule::Margin,
    ];

    fn evaluate(&self, input: &ClassifyInput<'_>, t: &ClassifierThresholds) -> Option<BlockType> {
        let style = input.style;
        let width = input.bbox.width();
        match self {
            ClassifierRule::Heading => (style.size > t.heading_size
                || (style.size > t.heading_bold_size && style.bold))
                .then_some(BlockType::Heading),
            ClassifierRule::Sidebar => (width < t.sidebar_max_width
                && (input.bbox.x0 > t.sidebar_right_x0 || input.bbox.x0 < t.sidebar_left_x0))
                .then_some(BlockType::Sidebar),
            ClassifierRule::Caption => {
                let content = input.content.trim().to_lowercase();
                t.caption_prefixes
                    .iter()
                    .any(|prefix| content.starts_with(&prefix.to_lowercase()))
                    .then_some(BlockType::Caption)
            }
            ClassifierRule::Label => (style.size < t.label_max_size && width < t.label_max_width)
                .then_some(BlockType::Label),
            ClassifierRule::Margin => {
                let top = input.bbox.to_raster(input.page_height).top();
                if top < t.header_max_top {
                    Some(BlockType::Header)
                } else if top > t.footer_min_top {
                    Some(BlockType::Footer)
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub style: &'a BlockStyle,
    pub content: &'a str,
    /// Document-space bounding box.
    pub bbox: Rect,
    pub page_height: f32,
    pub page_index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BlockClassifier {
    thresholds: ClassifierThresholds,
}

impl BlockClassifier {
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ClassifierThresholds {
        &self.thresholds
    }

    pub fn classify(&self, input: &ClassifyInput<'_>) -> BlockType {
        self.first_match(input).map_or(BlockType::Body, |(_, kind)| kind)
    }

    /// First rule that fires for `input`, if any.
    pub fn matching_rule(&self, input: &ClassifyInput<'_>) -> Option<ClassifierRule> {
        self.first_match(input).map(|(rule, _)| rule)
    }

    fn first_match(&self, input: &ClassifyInput<'_>) -> Option<(ClassifierRule, BlockType)> {
        ClassifierRule::ORDER
            .into_iter()
            .find_map(|rule| rule.evaluate(input, &self.thresholds).map(|kind| (rule, kind)))
    }
}
