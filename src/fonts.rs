use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ttf_parser::{Face, Tag, name_id};

use crate::error::PreconditionError;

/// The three faces the renderer draws with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FontRole {
    SansRegular,
    SansBold,
    Serif,
}

impl FontRole {
    pub const ALL: [FontRole; 3] = [FontRole::SansRegular, FontRole::SansBold, FontRole::Serif];

    pub fn as_str(&self) -> &'static str {
        match self {
            FontRole::SansRegular => "sans_regular",
            FontRole::SansBold => "sans_bold",
            FontRole::Serif => "serif",
        }
    }

    /// Name the face is registered under in a page's font resources.
    pub fn resource_name(&self) -> &'static str {
        match self {
            FontRole::SansRegular => "PLTSansR",
            FontRole::SansBold => "PLTSansB",
            FontRole::Serif => "PLTSerif",
        }
    }
}

#[derive(Clone)]
pub struct FontMetrics {
    data: Arc<Vec<u8>>,
    face_index: u32,
    units_per_em: u16,
    space_advance: u16,
    ascender: i16,
    descender: i16,
    bbox: [i16; 4],
    family: Option<String>,
    cff: bool,
}

impl std::fmt::Debug for FontMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontMetrics")
            .field("family", &self.family)
            .field("units_per_em", &self.units_per_em)
            .field("cff", &self.cff)
            .finish_non_exhaustive()
    }
}

impl FontMetrics {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read font: {}", path.display()))?;
        Self::from_bytes(data)
            .map_err(|err| anyhow!("failed to parse font: {} ({})", path.display(), err))
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let face = Face::parse(&data, 0).map_err(|err| anyhow!("{}", err))?;
        let units_per_em = face.units_per_em().max(1);
        let space_advance = face
            .glyph_index(' ')
            .and_then(|id| face.glyph_hor_advance(id))
            .unwrap_or(units_per_em / 4);
        let global = face.global_bounding_box();
        let family = extract_family_name(&face);
        let cff = face.raw_face().table(Tag::from_bytes(b"CFF ")).is_some();
        let ascender = face.ascender();
        let descender = face.descender();
        Ok(Self {
            face_index: 0,
            units_per_em,
            space_advance,
            ascender,
            descender,
            bbox: [global.x_min, global.y_min, global.x_max, global.y_max],
            family,
            cff,
            data: Arc::new(data),
        })
    }

    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn units_per_em(&self) -> u16 {
        self.units_per_em
    }

    /// OpenType fonts with CFF outlines embed differently from TrueType ones.
    pub fn is_cff(&self) -> bool {
        self.cff
    }

    pub fn ascent_ratio(&self) -> f32 {
        self.ascender as f32 / self.units_per_em as f32
    }

    pub fn descent_ratio(&self) -> f32 {
        self.descender as f32 / self.units_per_em as f32
    }

    /// Font bounding box scaled to 1000 units per em.
    pub fn bbox_thousandths(&self) -> [i64; 4] {
        self.bbox.map(|value| self.to_thousandths(value as i32))
    }

    pub fn ascent_thousandths(&self) -> i64 {
        self.to_thousandths(self.ascender as i32)
    }

    pub fn descent_thousandths(&self) -> i64 {
        self.to_thousandths(self.descender as i32)
    }

    fn to_thousandths(&self, value: i32) -> i64 {
        (value as f64 * 1000.0 / self.units_per_em as f64).round() as i64
    }

    pub fn glyph_id(&self, ch: char) -> Option<u16> {
        let face = Face::parse(&self.data, self.face_index).ok()?;
        face.glyph_index(ch).map(|id| id.0)
    }

    /// Horizontal advance of a glyph in 1000 units per em.
    pub fn glyph_advance_thousandths(&self, glyph: u16) -> i64 {
        let advance = Face::parse(&self.data, self.face_index)
            .ok()
            .and_then(|face| face.glyph_hor_advance(ttf_parser::GlyphId(glyph)))
            .unwrap_or(self.space_advance);
        self.to_thousandths(advance as i32)
    }

    pub fn measure(&self, text: &str, font_size: f32) -> f32 {
        measure_text_width(text, font_size, Some(self))
    }
}

/// Advance width of `text` at `font_size`, in points. Falls back to a
/// per-script estimate when no font is available.
pub fn measure_text_width(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    if let Some(font) = font
        && let Ok(face) = Face::parse(&font.data, font.face_index)
    {
        let mut advance = 0u32;
        for ch in text.chars() {
            if ch == '\n' {
                continue;
            }
            if ch == ' ' {
                advance = advance.saturating_add(font.space_advance as u32);
                continue;
            }
            let glyph_advance = face
                .glyph_index(ch)
                .and_then(|glyph| face.glyph_hor_advance(glyph))
                .unwrap_or(font.space_advance);
            advance = advance.saturating_add(glyph_advance as u32);
        }
        let units = font.units_per_em.max(1) as f32;
        return advance as f32 * (font_size / units);
    }
    estimate_text_width_units(text) * font_size
}

fn estimate_char_units_for_width(ch: char) -> f32 {
    if ch.is_whitespace() {
        0.25
    } else if ch.is_ascii_alphanumeric() {
        0.55
    } else if ch.is_ascii() {
        0.35
    } else if matches!(
        ch as u32,
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0x31F0..=0x31FF | 0x3000..=0x303F | 0xFF00..=0xFFEF
    ) {
        1.0
    } else {
        0.9
    }
}

fn estimate_text_width_units(text: &str) -> f32 {
    text.chars()
        .filter(|ch| *ch != '\n')
        .map(estimate_char_units_for_width)
        .sum()
}

fn extract_family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FontPaths {
    pub sans_regular: PathBuf,
    pub sans_bold: PathBuf,
    pub serif: PathBuf,
}

impl Default for FontPaths {
    fn default() -> Self {
        Self {
            sans_regular: PathBuf::from("fonts/NotoSansCJKtc-Regular.otf"),
            sans_bold: PathBuf::from("fonts/NotoSansCJKtc-Bold.otf"),
            serif: PathBuf::from("fonts/NotoSerifCJKtc-Regular.otf"),
        }
    }
}

impl FontPaths {
    pub fn get(&self, role: FontRole) -> &Path {
        match role {
            FontRole::SansRegular => &self.sans_regular,
            FontRole::SansBold => &self.sans_bold,
            FontRole::Serif => &self.serif,
        }
    }
}

/// Loaded faces for every [`FontRole`].
#[derive(Debug, Clone)]
pub struct FontSet {
    sans_regular: FontMetrics,
    sans_bold: FontMetrics,
    serif: FontMetrics,
}

impl FontSet {
    /// Every role must resolve to a readable font file.
    pub fn load(paths: &FontPaths) -> Result<Self> {
        for role in FontRole::ALL {
            let path = paths.get(role);
            if !path.is_file() {
                return Err(PreconditionError::MissingFont {
                    role: role.as_str(),
                    path: path.to_path_buf(),
                }
                .into());
            }
        }
        Ok(Self {
            sans_regular: FontMetrics::load(&paths.sans_regular)?,
            sans_bold: FontMetrics::load(&paths.sans_bold)?,
            serif: FontMetrics::load(&paths.serif)?,
        })
    }

    pub fn get(&self, role: FontRole) -> &FontMetrics {
        match role {
            FontRole::SansRegular => &self.sans_regular,
            FontRole::SansBold => &self.sans_bold,
            FontRole::Serif => &self.serif,
        }
    }
}
