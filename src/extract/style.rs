//! Dominant style of a block, sampled from its styled runs.

use crate::backend::TextRun;
use crate::document::{BlockStyle, FontFamily};

const SERIF_FAMILIES: &[&str] = &[
    "serif",
    "times",
    "georgia",
    "garamond",
    "minion",
    "cambria",
    "palatino",
    "book antiqua",
    "mincho",
    "song",
    "ming",
];

/// Aggregates the runs of one block into a single style.
///
/// Returns `None` for an empty run list; callers drop such blocks.
pub fn sample_style(runs: &[TextRun]) -> Option<BlockStyle> {
    if runs.is_empty() {
        return None;
    }
    let size = runs.iter().map(|run| run.size).sum::<f32>() / runs.len() as f32;
    let color = mode_by(runs, |run| quantize_color(run.color))
        .map(|run| run.color)
        .unwrap_or([0.0, 0.0, 0.0]);
    let font_name = mode_by(runs, |run| run.font_name.to_lowercase())
        .map(|run| run.font_name.to_lowercase())
        .unwrap_or_default();
    let flags = font_flags(&font_name);
    Some(BlockStyle {
        size: (size * 10.0).round() / 10.0,
        color,
        bold: flags.bold,
        italic: flags.italic,
        family: flags.family,
        font_name,
    })
}

/// Run texts joined by single spaces.
pub fn join_content(runs: &[TextRun]) -> String {
    runs.iter()
        .map(|run| run.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FontFlags {
    pub bold: bool,
    pub italic: bool,
    pub family: FontFamily,
}

/// Weight, slant and family inferred from a font name.
pub fn font_flags(font_name: &str) -> FontFlags {
    let lower = font_name.to_lowercase();
    let bold = lower.contains("bold") || lower.contains("black");
    let italic = lower.contains("italic") || lower.contains("oblique");
    let serif = !lower.contains("sans") && SERIF_FAMILIES.iter().any(|name| lower.contains(name));
    FontFlags {
        bold,
        italic,
        family: if serif {
            FontFamily::Serif
        } else {
            FontFamily::Sans
        },
    }
}

fn quantize_color(color: [f32; 3]) -> [u8; 3] {
    color.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8)
}

/// Most frequent run by `key`; ties go to the key seen first.
fn mode_by<K: PartialEq>(runs: &[TextRun], key: impl Fn(&TextRun) -> K) -> Option<&TextRun> {
    let mut counts: Vec<(K, usize, &TextRun)> = Vec::new();
    for run in runs {
        let value = key(run);
        if let Some(entry) = counts.iter_mut().find(|(existing, _, _)| *existing == value) {
            entry.1 += 1;
        } else {
            counts.push((value, 1, run));
        }
    }
    let mut best: Option<(usize, &TextRun)> = None;
    for (_, count, run) in counts {
        if best.is_none_or(|(top, _)| count > top) {
            best = Some((count, run));
        }
    }
    best.map(|(_, run)| run)
}
