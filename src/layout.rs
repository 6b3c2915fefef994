//! Line breaking and alignment for text drawn into a fixed rectangle.

use serde::{Deserialize, Serialize};

use crate::fonts::{FontMetrics, measure_text_width};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Left,
    Center,
    Right,
    Justify,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaidLine {
    pub text: String,
    /// Natural advance width of `text`, in points.
    pub width: f32,
    /// Offset of the line start from the left edge of the box.
    pub x_offset: f32,
    /// Extra advance added after every space when justifying.
    pub word_spacing: f32,
    /// Extra advance added after every character when justifying a line
    /// that has no spaces to stretch.
    pub char_spacing: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLayout {
    pub lines: Vec<LaidLine>,
    pub font_size: f32,
    /// Baseline-to-baseline distance.
    pub leading: f32,
    pub overflow: bool,
}

impl TextLayout {
    pub fn height(&self) -> f32 {
        self.lines.len() as f32 * self.leading
    }
}

/// Wraps `text` to `box_width` and reports whether the wrapped lines exceed
/// `box_height` at `line_height` times the font size per line.
pub fn layout_text(
    text: &str,
    font: Option<&FontMetrics>,
    font_size: f32,
    box_width: f32,
    box_height: f32,
    line_height: f32,
    align: Alignment,
) -> TextLayout {
    let measure = |value: &str| measure_text_width(value, font_size, font);
    let tokens = tokenize_text(text);
    let wrapped = wrap_tokens(&tokens, box_width, &measure);
    let leading = font_size * line_height;
    let count = wrapped.len();
    let lines = wrapped
        .into_iter()
        .enumerate()
        .map(|(index, line)| {
            let width = measure(&line);
            let last = index + 1 == count;
            place_line(line, width, box_width, align, last)
        })
        .collect::<Vec<_>>();
    let needed = lines.len() as f32 * leading;
    let too_wide = lines.iter().any(|line| line.width > box_width + 0.01);
    TextLayout {
        overflow: needed > box_height + 0.01 || too_wide,
        lines,
        font_size,
        leading,
    }
}

fn place_line(text: String, width: f32, box_width: f32, align: Alignment, last: bool) -> LaidLine {
    let slack = (box_width - width).max(0.0);
    let mut line = LaidLine {
        text,
        width,
        x_offset: 0.0,
        word_spacing: 0.0,
        char_spacing: 0.0,
    };
    match align {
        Alignment::Left => {}
        Alignment::Center => line.x_offset = slack / 2.0,
        Alignment::Right => line.x_offset = slack,
        Alignment::Justify => {
            if last || slack <= 0.1 {
                return line;
            }
            let spaces = line.text.matches(' ').count();
            if spaces > 0 {
                line.word_spacing = slack / spaces as f32;
            } else {
                let gaps = line.text.chars().count().saturating_sub(1);
                if gaps > 0 && is_spaceless_line(&line.text) {
                    line.char_spacing = slack / gaps as f32;
                }
            }
        }
    }
    line
}

fn is_spaceless_line(text: &str) -> bool {
    text.chars().filter(|ch| !ch.is_ascii()).count() * 2 >= text.chars().count()
}

/// Splits text into words, single spaces, explicit newlines and single CJK
/// characters, so that lines can break between any two ideographs.
pub(crate) fn tokenize_text(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch == '\n' {
            flush(&mut tokens, &mut current);
            tokens.push("\n".to_string());
        } else if ch.is_whitespace() {
            flush(&mut tokens, &mut current);
            tokens.push(" ".to_string());
        } else if is_breakable_char(ch) {
            flush(&mut tokens, &mut current);
            tokens.push(ch.to_string());
        } else {
            current.push(ch);
        }
    }
    flush(&mut tokens, &mut current);
    tokens
}

fn flush(tokens: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        tokens.push(std::mem::take(current));
    }
}

fn is_breakable_char(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3000..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xAC00..=0xD7AF | 0xFF00..=0xFFEF
    )
}

pub(crate) fn wrap_tokens(
    tokens: &[String],
    max_width: f32,
    measure: &dyn Fn(&str) -> f32,
) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();

    for token in tokens {
        if token == "\n" {
            if !current.trim().is_empty() {
                result.push(current.trim_end().to_string());
            }
            current.clear();
            continue;
        }
        if token.is_empty() {
            continue;
        }
        if token == " " {
            if !current.ends_with(' ') && !current.is_empty() {
                current.push(' ');
            }
            continue;
        }
        let candidate = format!("{}{}", current, token);
        if measure(candidate.trim_end()) <= max_width || current.trim().is_empty() {
            if current.trim().is_empty() && measure(token) > max_width {
                // a single word wider than the box is broken by character
                current.clear();
                for piece in split_to_width(token, max_width, measure) {
                    if !current.is_empty() {
                        result.push(std::mem::take(&mut current));
                    }
                    current = piece;
                }
                continue;
            }
            current = candidate;
            continue;
        }
        result.push(current.trim_end().to_string());
        current.clear();
        if measure(token) > max_width {
            for piece in split_to_width(token, max_width, measure) {
                if !current.is_empty() {
                    result.push(std::mem::take(&mut current));
                }
                current = piece;
            }
        } else {
            current.push_str(token);
        }
    }

    if !current.trim().is_empty() {
        result.push(current.trim_end().to_string());
    }
    result
}

fn split_to_width(token: &str, max_width: f32, measure: &dyn Fn(&str) -> f32) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for ch in token.chars() {
        current.push(ch);
        if measure(&current) > max_width && current.chars().count() > 1 {
            current.pop();
            pieces.push(std::mem::take(&mut current));
            current.push(ch);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
