//! Block-by-block text comparison of two rendered PDFs, used to check a
//! re-render against an earlier output of the same source.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::backend::{DocumentBackend, LopdfBackend, PageGroup};
use crate::extract::join_content;

/// Largest difference between two top edges, in points, for blocks to be
/// compared as the same block.
pub const MATCH_DISTANCE: f32 = 20.0;

/// A text block's content and raster position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedText {
    pub top: f32,
    pub x0: f32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WordChange {
    Replace { from: String, to: String },
    Delete { text: String },
    Insert { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockDifference {
    /// 1-based position among the page's matched pairs.
    pub block: usize,
    pub top: f32,
    pub similarity: f64,
    pub first: String,
    pub second: String,
    pub changes: Vec<WordChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageComparison {
    pub page: usize,
    pub matched: usize,
    pub differences: Vec<BlockDifference>,
    pub only_in_first: Vec<PlacedText>,
    pub only_in_second: Vec<PlacedText>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonSummary {
    pub total_pages: usize,
    pub total_differences: usize,
    pub only_in_first: usize,
    pub only_in_second: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub first: String,
    pub second: String,
    pub pages: Vec<PageComparison>,
    pub summary: ComparisonSummary,
}

impl ComparisonReport {
    pub fn is_identical(&self) -> bool {
        self.summary.total_differences == 0
            && self.summary.only_in_first == 0
            && self.summary.only_in_second == 0
    }
}

pub fn compare_files(first: &Path, second: &Path) -> Result<ComparisonReport> {
    let first_pages = page_texts(&LopdfBackend::open(first)?)?;
    let second_pages = page_texts(&LopdfBackend::open(second)?)?;
    let report = compare_documents(
        first.display().to_string(),
        second.display().to_string(),
        &first_pages,
        &second_pages,
    );
    info!(
        "compared {} pages: {} differing blocks, {} only in first, {} only in second",
        report.summary.total_pages,
        report.summary.total_differences,
        report.summary.only_in_first,
        report.summary.only_in_second
    );
    Ok(report)
}

/// Text blocks of every page, top to bottom then left to right.
pub fn page_texts<B: DocumentBackend>(backend: &B) -> Result<Vec<Vec<PlacedText>>> {
    let mut pages = Vec::with_capacity(backend.page_count());
    for page in 0..backend.page_count() {
        let mut texts = backend
            .groups(page)?
            .into_iter()
            .filter_map(|group| match group {
                PageGroup::Text { bbox, runs } => {
                    let content = join_content(&runs);
                    (!content.is_empty()).then_some(PlacedText {
                        top: bbox.top(),
                        x0: bbox.x0,
                        content,
                    })
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        texts.sort_by(|a, b| a.top.total_cmp(&b.top).then(a.x0.total_cmp(&b.x0)));
        pages.push(texts);
    }
    Ok(pages)
}

pub fn compare_documents(
    first: String,
    second: String,
    first_pages: &[Vec<PlacedText>],
    second_pages: &[Vec<PlacedText>],
) -> ComparisonReport {
    let page_count = first_pages.len().max(second_pages.len());
    let pages = (0..page_count)
        .map(|page| {
            compare_page(
                page,
                first_pages.get(page).map_or(&[][..], Vec::as_slice),
                second_pages.get(page).map_or(&[][..], Vec::as_slice),
            )
        })
        .collect::<Vec<_>>();
    let summary = ComparisonSummary {
        total_pages: pages.len(),
        total_differences: pages.iter().map(|page| page.differences.len()).sum(),
        only_in_first: pages.iter().map(|page| page.only_in_first.len()).sum(),
        only_in_second: pages.iter().map(|page| page.only_in_second.len()).sum(),
    };
    ComparisonReport {
        first,
        second,
        pages,
        summary,
    }
}

/// Pairs each first-side block with the nearest unclaimed second-side block
/// whose top edge lies within [`MATCH_DISTANCE`].
pub fn compare_page(page: usize, first: &[PlacedText], second: &[PlacedText]) -> PageComparison {
    let mut claimed = vec![false; second.len()];
    let mut pairs = Vec::new();
    let mut only_in_first = Vec::new();
    for block in first {
        let nearest = second
            .iter()
            .enumerate()
            .filter(|(index, _)| !claimed[*index])
            .map(|(index, other)| (index, (block.top - other.top).abs()))
            .filter(|(_, distance)| *distance < MATCH_DISTANCE)
            .min_by(|a, b| a.1.total_cmp(&b.1));
        match nearest {
            Some((index, _)) => {
                claimed[index] = true;
                pairs.push((block, &second[index]));
            }
            None => only_in_first.push(block.clone()),
        }
    }
    let only_in_second = second
        .iter()
        .zip(&claimed)
        .filter(|(_, claimed)| !**claimed)
        .map(|(block, _)| block.clone())
        .collect();

    let differences = pairs
        .iter()
        .enumerate()
        .filter(|(_, (a, b))| a.content != b.content)
        .map(|(index, (a, b))| BlockDifference {
            block: index + 1,
            top: a.top,
            similarity: strsim::normalized_levenshtein(&a.content, &b.content),
            first: a.content.clone(),
            second: b.content.clone(),
            changes: word_changes(&a.content, &b.content),
        })
        .collect::<Vec<_>>();
    debug!(
        "page {}: {} pairs, {} differ",
        page,
        pairs.len(),
        differences.len()
    );
    PageComparison {
        page,
        matched: pairs.len(),
        differences,
        only_in_first,
        only_in_second,
    }
}

/// Word-level edits turning `first` into `second`, from a longest common
/// subsequence of their whitespace-separated words.
pub fn word_changes(first: &str, second: &str) -> Vec<WordChange> {
    let a = first.split_whitespace().collect::<Vec<_>>();
    let b = second.split_whitespace().collect::<Vec<_>>();
    // common[i][j]: common subsequence length of a[i..] and b[j..]
    let mut common = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            common[i][j] = if a[i] == b[j] {
                common[i + 1][j + 1] + 1
            } else {
                common[i + 1][j].max(common[i][j + 1])
            };
        }
    }

    let mut changes = Vec::new();
    let mut deleted = Vec::new();
    let mut inserted = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        if i < a.len() && j < b.len() && a[i] == b[j] {
            flush_change(&mut changes, &mut deleted, &mut inserted);
            i += 1;
            j += 1;
        } else if j < b.len() && (i == a.len() || common[i][j + 1] > common[i + 1][j]) {
            inserted.push(b[j]);
            j += 1;
        } else {
            deleted.push(a[i]);
            i += 1;
        }
    }
    flush_change(&mut changes, &mut deleted, &mut inserted);
    changes
}

fn flush_change(changes: &mut Vec<WordChange>, deleted: &mut Vec<&str>, inserted: &mut Vec<&str>) {
    let change = match (deleted.is_empty(), inserted.is_empty()) {
        (true, true) => return,
        (false, true) => WordChange::Delete {
            text: deleted.join(" "),
        },
        (true, false) => WordChange::Insert {
            text: inserted.join(" "),
        },
        (false, false) => WordChange::Replace {
            from: deleted.join(" "),
            to: inserted.join(" "),
        },
    };
    changes.push(change);
    deleted.clear();
    inserted.clear();
}
