//! Cross-checks extracted blocks against the render log.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::{info, warn};

use crate::document::{BlockType, Document};
use crate::render::RenderLog;
use crate::render::log::preview;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingBlock {
    pub id: String,
    pub page: usize,
    #[serde(rename = "type")]
    pub kind: BlockType,
    pub content_preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    pub total: usize,
    pub fitted: usize,
    pub forced: usize,
    pub missing: usize,
    /// `fitted / total`; 1.0 for a document without text blocks.
    pub coverage: f64,
    pub threshold: f64,
    pub passed: bool,
    pub missing_blocks: Vec<MissingBlock>,
    /// Logged ids that the extracted document does not contain.
    pub unexpected_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CoverageValidator {
    threshold: f64,
}

impl CoverageValidator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn validate(&self, document: &Document, log: &RenderLog) -> CoverageReport {
        let rendered: HashSet<&str> = log
            .rendered_blocks
            .iter()
            .map(|record| record.id.as_str())
            .collect();
        let forced: HashSet<&str> = log
            .failed_blocks
            .iter()
            .map(|record| record.id.as_str())
            .collect();

        let mut total = 0;
        let mut fitted = 0;
        let mut forced_count = 0;
        let mut missing_blocks = Vec::new();
        let mut extracted = HashSet::new();
        for page in &document.pages {
            for block in page.translatable_blocks() {
                total += 1;
                extracted.insert(block.id.as_str());
                if rendered.contains(block.id.as_str()) {
                    fitted += 1;
                } else if forced.contains(block.id.as_str()) {
                    forced_count += 1;
                } else {
                    missing_blocks.push(MissingBlock {
                        id: block.id.clone(),
                        page: page.page_index,
                        kind: block.kind,
                        content_preview: preview(&block.content),
                    });
                }
            }
        }

        let unexpected_ids = rendered
            .iter()
            .chain(forced.iter())
            .filter(|id| !extracted.contains(*id))
            .map(|id| id.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let coverage = if total == 0 {
            1.0
        } else {
            fitted as f64 / total as f64
        };
        let missing = missing_blocks.len();
        let passed = coverage >= self.threshold && missing == 0;
        let report = CoverageReport {
            total,
            fitted,
            forced: forced_count,
            missing,
            coverage,
            threshold: self.threshold,
            passed,
            missing_blocks,
            unexpected_ids,
        };
        report.trace();
        report
    }
}

impl CoverageReport {
    fn trace(&self) {
        info!(
            "coverage {:.1}% ({} fitted, {} forced, {} missing of {} text blocks)",
            self.coverage * 100.0,
            self.fitted,
            self.forced,
            self.missing,
            self.total
        );
        for block in self.missing_blocks.iter().take(10) {
            warn!(
                "never rendered: {} on page {} ({}): {}",
                block.id,
                block.page,
                block.kind.as_str(),
                block.content_preview
            );
        }
        if !self.unexpected_ids.is_empty() {
            warn!(
                "render log has {} ids that were not extracted",
                self.unexpected_ids.len()
            );
        }
        if !self.passed {
            warn!(
                "coverage below {:.1}% or blocks missing",
                self.threshold * 100.0
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, BlockStyle, Page};
    use crate::geometry::Rect;
    use serde_json::Value;

    fn document(ids: &[&str]) -> Document {
        let mut blocks = ids
            .iter()
            .map(|id| Block {
                id: id.to_string(),
                kind: BlockType::Body,
                bbox: Rect::new(72.0, 600.0, 540.0, 700.0),
                content: format!("content of {}", id),
                style: BlockStyle::default(),
                metadata: Value::Null,
            })
            .collect::<Vec<_>>();
        blocks.push(Block {
            id: "p0_image".to_string(),
            kind: BlockType::Image,
            bbox: Rect::new(72.0, 100.0, 300.0, 300.0),
            content: "[IMAGE]".to_string(),
            style: BlockStyle::default(),
            metadata: Value::Null,
        });
        Document::new(
            "paper.pdf",
            vec![Page {
                page_index: 0,
                width: 612.0,
                height: 792.0,
                blocks,
            }],
        )
    }

    fn log(fitted: &[&str], forced: &[&str]) -> RenderLog {
        let doc = document(&[]);
        let template = doc.pages[0].blocks[0].clone();
        let mut log = RenderLog::default();
        for id in fitted {
            let block = Block {
                id: id.to_string(),
                kind: BlockType::Body,
                ..template.clone()
            };
            log.record_fitted(0, &block, 10.5, 10.5);
        }
        for id in forced {
            let block = Block {
                id: id.to_string(),
                kind: BlockType::Body,
                ..template.clone()
            };
            log.record_forced(0, &block, 10.5);
        }
        log
    }

    #[test]
    fn buckets_add_up_to_total() {
        let doc = document(&["a", "b", "c", "d"]);
        let report = CoverageValidator::new(0.95).validate(&doc, &log(&["a", "b"], &["c"]));
        assert_eq!(report.total, 4);
        assert_eq!(report.fitted + report.forced + report.missing, report.total);
        assert_eq!(report.missing_blocks[0].id, "d");
        assert_eq!(report.missing_blocks[0].content_preview, "content of d");
        assert_eq!(report.coverage, 0.5);
        assert!(!report.passed);
    }

    #[test]
    fn full_render_passes() {
        let doc = document(&["a", "b"]);
        let report = CoverageValidator::new(0.95).validate(&doc, &log(&["a", "b"], &[]));
        assert_eq!(report.coverage, 1.0);
        assert_eq!(report.missing, 0);
        assert!(report.passed);
    }

    #[test]
    fn forced_blocks_count_against_coverage_but_not_as_missing() {
        let ids = (0..20).map(|index| format!("b{}", index)).collect::<Vec<_>>();
        let refs = ids.iter().map(String::as_str).collect::<Vec<_>>();
        let doc = document(&refs);
        let report = CoverageValidator::new(0.95).validate(&doc, &log(&refs[..19], &refs[19..]));
        assert_eq!(report.coverage, 0.95);
        assert!(report.passed);
        let report = CoverageValidator::new(0.95).validate(&doc, &log(&refs[..18], &refs[18..]));
        assert!(!report.passed);
        assert_eq!(report.missing, 0);
    }

    #[test]
    fn missing_blocks_fail_even_above_threshold() {
        let ids = (0..100).map(|index| format!("b{}", index)).collect::<Vec<_>>();
        let refs = ids.iter().map(String::as_str).collect::<Vec<_>>();
        let doc = document(&refs);
        let report = CoverageValidator::new(0.95).validate(&doc, &log(&refs[..99], &[]));
        assert!(report.coverage >= 0.95);
        assert_eq!(report.missing, 1);
        assert!(!report.passed);
    }

    #[test]
    fn unexpected_ids_are_reported() {
        let doc = document(&["a"]);
        let report = CoverageValidator::new(0.95).validate(&doc, &log(&["a", "zz"], &["yy"]));
        assert_eq!(report.unexpected_ids, vec!["yy".to_string(), "zz".to_string()]);
        assert!(report.passed);
    }

    #[test]
    fn empty_document_has_full_coverage() {
        let doc = document(&[]);
        let report = CoverageValidator::new(0.95).validate(&doc, &RenderLog::default());
        assert_eq!(report.total, 0);
        assert_eq!(report.coverage, 1.0);
        assert!(report.passed);
    }
}
