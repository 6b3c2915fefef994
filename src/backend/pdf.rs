//! [`DocumentBackend`] over `lopdf`.
//!
//! Text positions come from interpreting page content streams. Redaction
//! rewrites the page content, swapping shown strings for equivalent
//! positioning so that nothing after them moves. Drawing appends a content
//! stream per page on save, using Type0 fonts whose codes are glyph ids.

use anyhow::{Context, Result, anyhow};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

use super::{
    DocumentBackend, PageGroup, Placement, PlacementMode, RedactOptions, TextPlacement, TextRun,
};
use crate::error::PreconditionError;
use crate::fonts::{FontMetrics, FontRole, FontSet, measure_text_width};
use crate::geometry::{RasterRect, Rect};
use crate::layout::layout_text;

/// Same-line tolerance, as a share of the font size.
const LINE_TOLERANCE: f32 = 0.3;
/// Horizontal gap, in ems, that separates two columns on one baseline.
const COLUMN_GAP: f32 = 2.5;
/// Largest baseline distance, in ems, between lines of one paragraph.
const PARAGRAPH_GAP: f32 = 1.8;
/// Font size change that always starts a new block.
const SIZE_CHANGE: f32 = 1.0;
/// TJ adjustment, in thousandths of an em, read as a word space.
const TJ_SPACE_THRESHOLD: f32 = 200.0;
/// A form covering this share of the page is page content, not a figure.
const PAGE_FORM_COVERAGE: f32 = 0.8;
const MAX_FORM_DEPTH: usize = 8;

pub struct LopdfBackend {
    doc: Document,
    page_ids: Vec<ObjectId>,
    fonts: Option<FontSet>,
    embedded: BTreeMap<FontRole, EmbeddedFont>,
    overlays: BTreeMap<usize, Vec<Operation>>,
}

struct EmbeddedFont {
    type0_id: ObjectId,
    cid_font_id: ObjectId,
    used: BTreeMap<u16, char>,
}

impl std::fmt::Debug for LopdfBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LopdfBackend")
            .field("page_count", &self.page_ids.len())
            .field("embedded_fonts", &self.embedded.len())
            .finish_non_exhaustive()
    }
}

impl LopdfBackend {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(PreconditionError::MissingSource(path.to_path_buf()).into());
        }
        let doc = Document::load(path).map_err(|err| PreconditionError::UnreadableSource {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Ok(Self::from_document(doc))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let doc = Document::load_mem(bytes).context("failed to parse PDF")?;
        Ok(Self::from_document(doc))
    }

    fn from_document(doc: Document) -> Self {
        let page_ids = doc.get_pages().values().copied().collect();
        Self {
            doc,
            page_ids,
            fonts: None,
            embedded: BTreeMap::new(),
            overlays: BTreeMap::new(),
        }
    }

    pub fn with_fonts(mut self, fonts: FontSet) -> Self {
        self.fonts = Some(fonts);
        self
    }

    fn page_id(&self, page: usize) -> Result<ObjectId> {
        self.page_ids.get(page).copied().ok_or_else(|| {
            anyhow!(
                "page index {} out of range (0..{})",
                page,
                self.page_ids.len()
            )
        })
    }

    fn frame(&self, page_id: ObjectId) -> Result<PageFrame> {
        let media_box = resolve_inherited(&self.doc, page_id, b"MediaBox")
            .map(|obj| deref(&self.doc, obj))
            .ok_or_else(|| anyhow!("MediaBox not found on page or ancestors"))?;
        let values = media_box
            .as_array()
            .map_err(|err| anyhow!("MediaBox is not an array: {}", err))?
            .iter()
            .filter_map(|obj| number(deref(&self.doc, obj)))
            .collect::<Vec<_>>();
        if values.len() != 4 {
            return Err(anyhow!("MediaBox must have 4 numbers, got {}", values.len()));
        }
        let rect = Rect::new(values[0], values[1], values[2], values[3]);
        Ok(PageFrame {
            x0: rect.x0,
            y0: rect.y0,
            width: rect.width(),
            height: rect.height(),
        })
    }

    fn page_operations(&self, page_id: ObjectId) -> Result<Vec<Operation>> {
        let content = self
            .doc
            .get_page_content(page_id)
            .context("failed to read page content")?;
        Ok(Content::decode(&content)
            .context("failed to decode page content")?
            .operations)
    }

    fn collect(
        &self,
        ops: &[Operation],
        resources: Option<&Dictionary>,
        ctm: Matrix,
        frame: &PageFrame,
        scope: Scope,
        out: &mut Collected,
    ) {
        let mut walker = Walker::new(&self.doc, resources, ctm);
        for op in ops {
            match walker.step(op) {
                Step::Text(shown) => out.texts.push(shown),
                Step::XObject { name, ctm } => {
                    let Some(stream) = walker.xobject(&name) else {
                        continue;
                    };
                    match xobject_subtype(stream) {
                        Some(b"Image") if !scope.in_figure => {
                            out.images.push(ctm.transform_rect(0.0, 0.0, 1.0, 1.0));
                        }
                        Some(b"Form") if scope.nesting < MAX_FORM_DEPTH => {
                            self.collect_form(stream, resources, ctm, frame, scope, out);
                        }
                        _ => {}
                    }
                }
                Step::Paint(_) | Step::None => {}
            }
        }
    }

    fn collect_form(
        &self,
        stream: &Stream,
        parent_resources: Option<&Dictionary>,
        ctm: Matrix,
        frame: &PageFrame,
        scope: Scope,
        out: &mut Collected,
    ) {
        let Ok(content) = stream_bytes(stream) else {
            return;
        };
        let Ok(decoded) = Content::decode(&content) else {
            return;
        };
        let form = self.form_placement(stream, parent_resources, ctm);
        let covers_page = form.bbox.is_some_and(|rect| frame.is_covered_by(&rect));
        let nested = Scope {
            nesting: scope.nesting + 1,
            in_figure: scope.in_figure || !covers_page,
        };
        if scope.in_figure || covers_page {
            self.collect(&decoded.operations, form.resources, form.ctm, frame, nested, out);
            return;
        }

        let mut inner = Collected::default();
        self.collect(&decoded.operations, form.resources, form.ctm, frame, nested, &mut inner);
        let rect = form.bbox.or_else(|| {
            inner.texts.iter().map(|shown| shown.bbox).reduce(|a, b| {
                Rect::new(a.x0.min(b.x0), a.y0.min(b.y0), a.x1.max(b.x1), a.y1.max(b.y1))
            })
        });
        if let Some(rect) = rect {
            out.figures.push((rect, inner.texts));
        }
    }

    /// Matrix, resources and user-space box of a form drawn under `ctm`.
    fn form_placement<'a>(
        &'a self,
        stream: &'a Stream,
        parent_resources: Option<&'a Dictionary>,
        ctm: Matrix,
    ) -> FormPlacement<'a> {
        let matrix = stream
            .dict
            .get(b"Matrix")
            .ok()
            .and_then(|obj| deref(&self.doc, obj).as_array().ok())
            .and_then(|values| matrix_from_operands(values))
            .unwrap_or(Matrix::IDENTITY);
        let form_ctm = matrix.multiply(&ctm);
        let resources = stream
            .dict
            .get(b"Resources")
            .ok()
            .and_then(|obj| deref(&self.doc, obj).as_dict().ok())
            .or(parent_resources);
        let bbox = stream
            .dict
            .get(b"BBox")
            .ok()
            .and_then(|obj| deref(&self.doc, obj).as_array().ok())
            .map(|values| values.iter().filter_map(number).collect::<Vec<_>>())
            .filter(|values| values.len() == 4)
            .map(|v| form_ctm.transform_rect(v[0], v[1], v[2], v[3]));
        FormPlacement {
            ctm: form_ctm,
            resources,
            bbox,
        }
    }

    /// Rewrites one content stream for [`DocumentBackend::redact`], following
    /// page-covering forms since their text is read as page text. Forms with
    /// erased text come back as copies so other pages sharing them keep
    /// their content.
    fn redact_operations<'a>(
        &'a self,
        ops: &[Operation],
        resources: Option<&'a Dictionary>,
        ctm: Matrix,
        target: &RedactTarget<'_>,
        depth: usize,
    ) -> Result<Redacted> {
        let mut walker = Walker::new(&self.doc, resources, ctm);
        let mut redacted = Redacted::default();
        for op in ops {
            match walker.step(op) {
                Step::Text(shown) if target.covers(&shown.bbox) => {
                    redacted.operations.extend(blank_show(op, shown.advance_units));
                    redacted.removed += 1;
                    continue;
                }
                Step::XObject { name, ctm } => {
                    let Some(stream) = walker.xobject(&name) else {
                        redacted.operations.push(op.clone());
                        continue;
                    };
                    match xobject_subtype(stream) {
                        Some(b"Image")
                            if !target.options.keep_images
                                && target.covers(&ctm.transform_rect(0.0, 0.0, 1.0, 1.0)) =>
                        {
                            redacted.removed += 1;
                            continue;
                        }
                        Some(b"Form") if depth < MAX_FORM_DEPTH => {
                            if let Some(copy) =
                                self.redact_form(&name, stream, resources, ctm, target, depth)?
                            {
                                redacted.removed += copy.removed;
                                redacted
                                    .operations
                                    .push(Operation::new("Do", vec![Object::Name(copy.name.clone())]));
                                redacted.forms.push(copy);
                                continue;
                            }
                        }
                        _ => {}
                    }
                }
                Step::Paint(Some(bbox)) if !target.options.keep_graphics && target.covers(&bbox) => {
                    redacted.operations.push(Operation::new("n", vec![]));
                    redacted.removed += 1;
                    continue;
                }
                _ => {}
            }
            redacted.operations.push(op.clone());
        }
        Ok(redacted)
    }

    fn redact_form<'a>(
        &'a self,
        name: &[u8],
        stream: &'a Stream,
        parent_resources: Option<&'a Dictionary>,
        ctm: Matrix,
        target: &RedactTarget<'_>,
        depth: usize,
    ) -> Result<Option<FormCopy>> {
        let form = self.form_placement(stream, parent_resources, ctm);
        if !form.bbox.is_some_and(|rect| target.frame.is_covered_by(&rect)) {
            return Ok(None);
        }
        let content = stream_bytes(stream)?;
        let decoded = Content::decode(&content).context("failed to decode form content")?;
        let inner =
            self.redact_operations(&decoded.operations, form.resources, form.ctm, target, depth + 1)?;
        if inner.removed == 0 {
            return Ok(None);
        }

        let mut dict = stream.dict.clone();
        dict.remove(b"Filter");
        dict.remove(b"DecodeParms");
        dict.remove(b"Length");
        let mut copy_name = name.to_vec();
        copy_name.extend_from_slice(b"-r");
        Ok(Some(FormCopy {
            name: copy_name,
            dict,
            resources: form.resources.cloned().unwrap_or_default(),
            content: Content {
                operations: inner.operations,
            }
            .encode()
            .context("failed to encode redacted form")?,
            removed: inner.removed,
            children: inner.forms,
        }))
    }

    fn install_font_resource(&mut self, page_id: ObjectId, role: FontRole, font_id: ObjectId) -> Result<()> {
        let mut resources = resolve_inherited(&self.doc, page_id, b"Resources")
            .and_then(|obj| deref(&self.doc, obj).as_dict().ok())
            .cloned()
            .unwrap_or_default();
        let mut fonts = resources
            .get(b"Font")
            .ok()
            .and_then(|obj| deref(&self.doc, obj).as_dict().ok())
            .cloned()
            .unwrap_or_default();
        fonts.set(role.resource_name(), Object::Reference(font_id));
        resources.set("Font", Object::Dictionary(fonts));
        let page = self
            .doc
            .get_dictionary_mut(page_id)
            .context("page is not a dictionary")?;
        page.set("Resources", Object::Dictionary(resources));
        Ok(())
    }

    fn flush_overlays(&mut self) -> Result<()> {
        let overlays = std::mem::take(&mut self.overlays);
        for (page, operations) in overlays {
            if operations.is_empty() {
                continue;
            }
            let page_id = self.page_id(page)?;
            let mut existing = match self.doc.get_dictionary(page_id)?.get(b"Contents") {
                Ok(Object::Reference(id)) => vec![Object::Reference(*id)],
                Ok(Object::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            let save_id = self
                .doc
                .add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
            let mut body = b"Q\n".to_vec();
            body.extend(Content { operations }.encode()?);
            let overlay_id = self.doc.add_object(Stream::new(Dictionary::new(), body));
            let mut contents = vec![Object::Reference(save_id)];
            contents.append(&mut existing);
            contents.push(Object::Reference(overlay_id));
            self.doc
                .get_dictionary_mut(page_id)?
                .set("Contents", Object::Array(contents));
        }
        Ok(())
    }

    fn finalize_fonts(&mut self) -> Result<()> {
        let Some(fonts) = self.fonts.as_ref() else {
            return Ok(());
        };
        let mut updates = Vec::new();
        for (role, embedded) in &self.embedded {
            let metrics = fonts.get(*role);
            let mut widths = Vec::new();
            for gid in embedded.used.keys() {
                widths.push(Object::Integer(*gid as i64));
                widths.push(Object::Array(vec![Object::Integer(
                    metrics.glyph_advance_thousandths(*gid),
                )]));
            }
            let cmap = to_unicode_cmap(&embedded.used);
            updates.push((embedded.cid_font_id, embedded.type0_id, widths, cmap));
        }
        for (cid_font_id, type0_id, widths, cmap) in updates {
            let cmap_id = self.doc.add_object(Stream::new(Dictionary::new(), cmap));
            self.doc
                .get_dictionary_mut(cid_font_id)?
                .set("W", Object::Array(widths));
            self.doc
                .get_dictionary_mut(type0_id)?
                .set("ToUnicode", Object::Reference(cmap_id));
        }
        Ok(())
    }
}

impl DocumentBackend for LopdfBackend {
    fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    fn page_size(&self, page: usize) -> Result<(f32, f32)> {
        let frame = self.frame(self.page_id(page)?)?;
        Ok((frame.width, frame.height))
    }

    fn groups(&self, page: usize) -> Result<Vec<PageGroup>> {
        let page_id = self.page_id(page)?;
        let frame = self.frame(page_id)?;
        let ops = self.page_operations(page_id)?;
        let resources = resolve_inherited(&self.doc, page_id, b"Resources")
            .and_then(|obj| deref(&self.doc, obj).as_dict().ok());

        let mut collected = Collected::default();
        self.collect(
            &ops,
            resources,
            Matrix::IDENTITY,
            &frame,
            Scope::default(),
            &mut collected,
        );

        let spans = collected
            .texts
            .iter()
            .map(|shown| shown.to_span(&frame))
            .collect::<Vec<_>>();
        let mut groups = group_text(spans);
        for rect in collected.images {
            groups.push(PageGroup::Image {
                bbox: frame.to_raster(&rect),
            });
        }
        for (rect, texts) in collected.figures {
            let runs = texts
                .iter()
                .map(|shown| shown.to_span(&frame).run)
                .collect();
            groups.push(PageGroup::Figure {
                bbox: frame.to_raster(&rect),
                runs,
            });
        }
        Ok(groups)
    }

    fn redact(&mut self, page: usize, rects: &[RasterRect], options: RedactOptions) -> Result<()> {
        if rects.is_empty() {
            return Ok(());
        }
        let page_id = self.page_id(page)?;
        let frame = self.frame(page_id)?;
        let ops = self.page_operations(page_id)?;
        let target = RedactTarget {
            frame,
            rects,
            options,
        };
        let redacted = {
            let resources = resolve_inherited(&self.doc, page_id, b"Resources")
                .and_then(|obj| deref(&self.doc, obj).as_dict().ok());
            self.redact_operations(&ops, resources, Matrix::IDENTITY, &target, 0)?
        };

        if !redacted.forms.is_empty() {
            let resources = resolve_inherited(&self.doc, page_id, b"Resources")
                .and_then(|obj| deref(&self.doc, obj).as_dict().ok())
                .cloned()
                .unwrap_or_default();
            let resources = install_form_copies(&mut self.doc, resources, redacted.forms);
            self.doc
                .get_dictionary_mut(page_id)
                .context("page is not a dictionary")?
                .set("Resources", Object::Dictionary(resources));
        }
        let encoded = Content {
            operations: redacted.operations,
        }
        .encode()
        .context("failed to encode redacted content")?;
        let stream_id = self.doc.add_object(Stream::new(Dictionary::new(), encoded));
        self.doc
            .get_dictionary_mut(page_id)
            .context("page is not a dictionary")?
            .set("Contents", Object::Reference(stream_id));
        debug!("page {}: redacted {} content operations", page, redacted.removed);
        Ok(())
    }

    fn embed_fonts(&mut self, page: usize) -> Result<()> {
        let page_id = self.page_id(page)?;
        let Some(fonts) = self.fonts.clone() else {
            return Err(anyhow!("no fonts configured for drawing"));
        };
        for role in FontRole::ALL {
            let font_id = match self.embedded.get(&role) {
                Some(embedded) => embedded.type0_id,
                None => {
                    let embedded = embed_font(&mut self.doc, role, fonts.get(role));
                    let id = embedded.type0_id;
                    self.embedded.insert(role, embedded);
                    id
                }
            };
            self.install_font_resource(page_id, role, font_id)?;
        }
        Ok(())
    }

    fn insert_text(&mut self, page: usize, placement: &TextPlacement<'_>) -> Result<Placement> {
        let page_id = self.page_id(page)?;
        let frame = self.frame(page_id)?;
        let fonts = self
            .fonts
            .as_ref()
            .ok_or_else(|| anyhow!("no fonts configured for drawing"))?;
        let metrics = fonts.get(placement.font);
        let rect = placement.rect;
        let layout = layout_text(
            placement.text,
            Some(metrics),
            placement.size,
            rect.width(),
            rect.height(),
            placement.line_height,
            placement.align,
        );
        if layout.overflow && placement.mode == PlacementMode::Fit {
            return Ok(Placement::Overflow);
        }
        let embedded = self
            .embedded
            .get_mut(&placement.font)
            .ok_or_else(|| anyhow!("font {} is not embedded on this document", placement.font.as_str()))?;

        let size = placement.size;
        let ascent = metrics.ascent_ratio().clamp(0.5, 1.2) * size;
        let [r, g, b] = placement.color;
        let mut ops = vec![
            Operation::new("q", vec![]),
            Operation::new("rg", vec![Object::Real(r), Object::Real(g), Object::Real(b)]),
            Operation::new("BT", vec![]),
            Operation::new(
                "Tf",
                vec![
                    Object::Name(placement.font.resource_name().as_bytes().to_vec()),
                    Object::Real(size),
                ],
            ),
        ];
        for (index, line) in layout.lines.iter().enumerate() {
            let x = rect.x0 + line.x_offset;
            let raster_baseline = rect.top() + ascent + index as f32 * layout.leading;
            let (user_x, user_y) = frame.to_user(x, raster_baseline);
            ops.push(Operation::new(
                "Tm",
                vec![
                    Object::Real(1.0),
                    Object::Real(0.0),
                    Object::Real(0.0),
                    Object::Real(1.0),
                    Object::Real(user_x),
                    Object::Real(user_y),
                ],
            ));
            ops.push(Operation::new("Tc", vec![Object::Real(line.char_spacing)]));
            let word_adjust = if size > 0.0 {
                -(line.word_spacing * 1000.0 / size)
            } else {
                0.0
            };
            let mut array = Vec::new();
            let mut glyphs = Vec::new();
            for ch in line.text.chars() {
                let gid = metrics.glyph_id(ch).unwrap_or(0);
                embedded.used.entry(gid).or_insert(ch);
                glyphs.extend_from_slice(&gid.to_be_bytes());
                if ch == ' ' && word_adjust != 0.0 {
                    array.push(Object::String(std::mem::take(&mut glyphs), StringFormat::Hexadecimal));
                    array.push(Object::Real(word_adjust));
                }
            }
            if !glyphs.is_empty() {
                array.push(Object::String(glyphs, StringFormat::Hexadecimal));
            }
            ops.push(Operation::new("TJ", vec![Object::Array(array)]));
        }
        ops.push(Operation::new("ET", vec![]));
        ops.push(Operation::new("Q", vec![]));
        self.overlays.entry(page).or_default().extend(ops);

        Ok(if layout.overflow {
            Placement::Overflow
        } else {
            Placement::Fitted
        })
    }

    fn save(&mut self, path: &Path, compress: bool) -> Result<()> {
        self.flush_overlays()?;
        self.finalize_fonts()?;
        if compress {
            self.doc.compress();
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        self.doc
            .save(path)
            .with_context(|| format!("failed to save PDF: {}", path.display()))?;
        Ok(())
    }
}

/// Page placement relative to its MediaBox.
#[derive(Debug, Clone, Copy)]
struct PageFrame {
    x0: f32,
    y0: f32,
    width: f32,
    height: f32,
}

impl PageFrame {
    fn to_raster(&self, rect: &Rect) -> RasterRect {
        Rect::new(
            rect.x0 - self.x0,
            rect.y0 - self.y0,
            rect.x1 - self.x0,
            rect.y1 - self.y0,
        )
        .to_raster(self.height)
    }

    fn to_user(&self, x: f32, raster_y: f32) -> (f32, f32) {
        (x + self.x0, crate::geometry::flip_y(self.height, raster_y) + self.y0)
    }

    /// A form this large is page content, not a figure.
    fn is_covered_by(&self, rect: &Rect) -> bool {
        rect.width() * rect.height() >= self.width * self.height * PAGE_FORM_COVERAGE
    }
}

struct FormPlacement<'a> {
    ctm: Matrix,
    resources: Option<&'a Dictionary>,
    bbox: Option<Rect>,
}

struct RedactTarget<'r> {
    frame: PageFrame,
    rects: &'r [RasterRect],
    options: RedactOptions,
}

impl RedactTarget<'_> {
    /// Half of the user-space box must fall inside one target rectangle.
    fn covers(&self, rect: &Rect) -> bool {
        let raster = self.frame.to_raster(rect);
        self.rects
            .iter()
            .any(|target| raster.covered_ratio(target) >= 0.5)
    }
}

#[derive(Default)]
struct Redacted {
    operations: Vec<Operation>,
    removed: usize,
    forms: Vec<FormCopy>,
}

/// A rewritten form waiting to be added under a new resource name.
struct FormCopy {
    name: Vec<u8>,
    dict: Dictionary,
    /// Effective resources of the original, extended with `children`.
    resources: Dictionary,
    content: Vec<u8>,
    removed: usize,
    children: Vec<FormCopy>,
}

/// Adds each copy to the document and registers it in `resources`.
fn install_form_copies(
    doc: &mut Document,
    mut resources: Dictionary,
    copies: Vec<FormCopy>,
) -> Dictionary {
    let mut xobjects = resources
        .get(b"XObject")
        .ok()
        .and_then(|obj| deref(doc, obj).as_dict().ok())
        .cloned()
        .unwrap_or_default();
    for copy in copies {
        let FormCopy {
            name,
            mut dict,
            resources: form_resources,
            content,
            children,
            ..
        } = copy;
        if !children.is_empty() {
            let form_resources = install_form_copies(doc, form_resources, children);
            dict.set("Resources", Object::Dictionary(form_resources));
        }
        let id = doc.add_object(Stream::new(dict, content));
        xobjects.set(name, Object::Reference(id));
    }
    resources.set("XObject", Object::Dictionary(xobjects));
    resources
}

/// Where the interpreter is while following form XObjects.
#[derive(Debug, Clone, Copy, Default)]
struct Scope {
    nesting: usize,
    in_figure: bool,
}

#[derive(Default)]
struct Collected {
    texts: Vec<Shown>,
    images: Vec<Rect>,
    figures: Vec<(Rect, Vec<Shown>)>,
}

/// A shown string with its user-space box.
#[derive(Debug, Clone)]
struct Shown {
    text: String,
    font_name: String,
    size: f32,
    color: [f32; 3],
    bbox: Rect,
    baseline: f32,
    /// Displacement of the show operation in thousandths of text space.
    advance_units: f32,
}

impl Shown {
    fn to_span(&self, frame: &PageFrame) -> Span {
        let bbox = frame.to_raster(&self.bbox);
        Span {
            baseline: frame.height - (self.baseline - frame.y0),
            run: TextRun {
                text: self.text.clone(),
                size: self.size,
                color: self.color,
                font_name: self.font_name.clone(),
                bbox,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Span {
    run: TextRun,
    /// Raster-space baseline.
    baseline: f32,
}

#[derive(Debug, Clone)]
struct Line {
    runs: Vec<TextRun>,
    bbox: RasterRect,
    baseline: f32,
    size: f32,
}

/// Groups spans into lines, lines into paragraph blocks.
fn group_text(mut spans: Vec<Span>) -> Vec<PageGroup> {
    spans.retain(|span| !span.run.text.trim().is_empty());
    if spans.is_empty() {
        return Vec::new();
    }
    spans.sort_by(|a, b| a.baseline.total_cmp(&b.baseline).then(a.run.bbox.x0.total_cmp(&b.run.bbox.x0)));

    let mut rows: Vec<Vec<Span>> = Vec::new();
    for span in spans {
        match rows.last_mut() {
            Some(row)
                if (span.baseline - row[0].baseline).abs()
                    <= row[0].run.size.max(span.run.size) * LINE_TOLERANCE =>
            {
                row.push(span)
            }
            _ => rows.push(vec![span]),
        }
    }

    let mut lines = Vec::new();
    for mut row in rows {
        row.sort_by(|a, b| a.run.bbox.x0.total_cmp(&b.run.bbox.x0));
        let mut fragment: Vec<Span> = Vec::new();
        for span in row {
            if let Some(last) = fragment.last() {
                let gap = span.run.bbox.x0 - last.run.bbox.x1;
                if gap > last.run.size.max(span.run.size) * COLUMN_GAP {
                    lines.push(build_line(std::mem::take(&mut fragment)));
                }
            }
            fragment.push(span);
        }
        if !fragment.is_empty() {
            lines.push(build_line(fragment));
        }
    }

    let mut blocks: Vec<Vec<Line>> = Vec::new();
    for line in lines {
        let target = blocks.iter().rposition(|block| {
            block
                .last()
                .is_some_and(|last| continues_block(last, &line))
        });
        match target {
            Some(index) => blocks[index].push(line),
            None => blocks.push(vec![line]),
        }
    }

    blocks
        .into_iter()
        .filter_map(|block| {
            let bbox = block.iter().map(|line| line.bbox).reduce(|a, b| a.union(&b))?;
            let runs = block.into_iter().flat_map(|line| line.runs).collect();
            Some(PageGroup::Text { bbox, runs })
        })
        .collect()
}

fn continues_block(last: &Line, line: &Line) -> bool {
    let gap = line.baseline - last.baseline;
    let overlap = last.bbox.x1.min(line.bbox.x1) - last.bbox.x0.max(line.bbox.x0);
    gap > 0.0
        && gap <= last.size.max(line.size) * PARAGRAPH_GAP
        && overlap > 0.0
        && (last.size - line.size).abs() <= SIZE_CHANGE
}

/// Merges neighbouring spans that share a style into one run, inserting a
/// space where the gap between them is wide enough to be one.
fn build_line(spans: Vec<Span>) -> Line {
    let baseline = spans.iter().map(|span| span.baseline).sum::<f32>() / spans.len() as f32;
    let total_chars = spans.iter().map(|span| span.run.text.chars().count()).sum::<usize>().max(1);
    let size = spans
        .iter()
        .map(|span| span.run.size * span.run.text.chars().count() as f32)
        .sum::<f32>()
        / total_chars as f32;

    let mut runs: Vec<TextRun> = Vec::new();
    for span in spans {
        let run = span.run;
        if let Some(last) = runs.last_mut()
            && last.font_name == run.font_name
            && (last.size - run.size).abs() < 0.05
            && last.color == run.color
        {
            let chars = run.text.chars().count().max(1) as f32;
            let avg_char = (run.bbox.width() / chars).max(run.size * 0.1);
            let gap = run.bbox.x0 - last.bbox.x1;
            let joins_cjk = last.text.chars().last().is_some_and(is_spaceless_script_char)
                && run.text.chars().next().is_some_and(is_spaceless_script_char);
            if gap > avg_char * 0.2
                && !joins_cjk
                && !last.text.ends_with(' ')
                && !run.text.starts_with(' ')
            {
                last.text.push(' ');
            }
            last.text.push_str(&run.text);
            last.bbox = last.bbox.union(&run.bbox);
            continue;
        }
        runs.push(run);
    }
    let bbox = runs
        .iter()
        .map(|run| run.bbox)
        .reduce(|a, b| a.union(&b))
        .unwrap_or(RasterRect::new(0.0, 0.0, 0.0, 0.0));
    Line {
        runs,
        bbox,
        baseline,
        size,
    }
}

/// Replacement for a text-showing operation that moves the text position
/// exactly as the original did without drawing anything.
fn blank_show(op: &Operation, advance_units: f32) -> Vec<Operation> {
    let skip = Operation::new("TJ", vec![Object::Array(vec![Object::Real(-advance_units)])]);
    match op.operator.as_str() {
        "'" => vec![Operation::new("T*", vec![]), skip],
        "\"" if op.operands.len() >= 3 => vec![
            Operation::new("Tw", vec![op.operands[0].clone()]),
            Operation::new("Tc", vec![op.operands[1].clone()]),
            Operation::new("T*", vec![]),
            skip,
        ],
        _ => vec![skip],
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix([f32; 6]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    fn translate(tx: f32, ty: f32) -> Matrix {
        Matrix([1.0, 0.0, 0.0, 1.0, tx, ty])
    }

    /// `self` applied first, then `other`.
    fn multiply(&self, other: &Matrix) -> Matrix {
        let [a, b, c, d, e, f] = self.0;
        let [oa, ob, oc, od, oe, of] = other.0;
        Matrix([
            a * oa + b * oc,
            a * ob + b * od,
            c * oa + d * oc,
            c * ob + d * od,
            e * oa + f * oc + oe,
            e * ob + f * od + of,
        ])
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let [a, b, c, d, e, f] = self.0;
        (x * a + y * c + e, x * b + y * d + f)
    }

    fn transform_rect(&self, x0: f32, y0: f32, x1: f32, y1: f32) -> Rect {
        let corners = [
            self.apply(x0, y0),
            self.apply(x1, y0),
            self.apply(x0, y1),
            self.apply(x1, y1),
        ];
        let min_x = corners.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
        let max_x = corners.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
        let min_y = corners.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
        let max_y = corners.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);
        Rect::new(min_x, min_y, max_x, max_y)
    }

    fn vertical_scale(&self) -> f32 {
        let [_, _, c, d, _, _] = self.0;
        (c * c + d * d).sqrt()
    }
}

fn matrix_from_operands(values: &[Object]) -> Option<Matrix> {
    if values.len() < 6 {
        return None;
    }
    let mut m = [0.0; 6];
    for (slot, value) in m.iter_mut().zip(values) {
        *slot = number(value)?;
    }
    Some(Matrix(m))
}

#[derive(Debug, Clone)]
struct GraphicsState {
    ctm: Matrix,
    fill: [f32; 3],
    font: Vec<u8>,
    font_size: f32,
    char_spacing: f32,
    word_spacing: f32,
    horizontal_scale: f32,
    leading: f32,
    rise: f32,
}

impl GraphicsState {
    fn new(ctm: Matrix) -> Self {
        Self {
            ctm,
            fill: [0.0, 0.0, 0.0],
            font: Vec::new(),
            font_size: 12.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            horizontal_scale: 1.0,
            leading: 0.0,
            rise: 0.0,
        }
    }
}

enum Step {
    None,
    Text(Shown),
    XObject { name: Vec<u8>, ctm: Matrix },
    Paint(Option<Rect>),
}

enum ShowPiece<'o> {
    Bytes(&'o [u8]),
    Adjust(f32),
}

/// Content stream interpreter tracking just enough state to place text.
struct Walker<'a> {
    doc: &'a Document,
    resources: Option<&'a Dictionary>,
    fonts: HashMap<Vec<u8>, FontInfo<'a>>,
    state: GraphicsState,
    stack: Vec<GraphicsState>,
    tm: Matrix,
    tlm: Matrix,
    path: Option<Rect>,
}

impl<'a> Walker<'a> {
    fn new(doc: &'a Document, resources: Option<&'a Dictionary>, ctm: Matrix) -> Self {
        Self {
            doc,
            resources,
            fonts: font_table(doc, resources),
            state: GraphicsState::new(ctm),
            stack: Vec::new(),
            tm: Matrix::IDENTITY,
            tlm: Matrix::IDENTITY,
            path: None,
        }
    }

    fn xobject(&self, name: &[u8]) -> Option<&'a Stream> {
        let xobjects = self.resources?.get(b"XObject").ok()?;
        let xobjects = deref(self.doc, xobjects).as_dict().ok()?;
        let entry = xobjects.get(name).ok()?;
        deref(self.doc, entry).as_stream().ok()
    }

    fn step(&mut self, op: &Operation) -> Step {
        let operands = &op.operands;
        let num = |index: usize| operands.get(index).and_then(number);
        match op.operator.as_str() {
            "q" => self.stack.push(self.state.clone()),
            "Q" => {
                if let Some(state) = self.stack.pop() {
                    self.state = state;
                }
            }
            "cm" => {
                if let Some(matrix) = matrix_from_operands(operands) {
                    self.state.ctm = matrix.multiply(&self.state.ctm);
                }
            }
            "g" => {
                if let Some(gray) = num(0) {
                    self.state.fill = [gray, gray, gray];
                }
            }
            "rg" => {
                if let (Some(r), Some(g), Some(b)) = (num(0), num(1), num(2)) {
                    self.state.fill = [r, g, b];
                }
            }
            "k" => {
                if let (Some(c), Some(m), Some(y), Some(k)) = (num(0), num(1), num(2), num(3)) {
                    self.state.fill = cmyk_to_rgb(c, m, y, k);
                }
            }
            "sc" | "scn" => {
                let values = operands.iter().filter_map(number).collect::<Vec<_>>();
                match values.as_slice() {
                    [gray] => self.state.fill = [*gray, *gray, *gray],
                    [r, g, b] => self.state.fill = [*r, *g, *b],
                    [c, m, y, k] => self.state.fill = cmyk_to_rgb(*c, *m, *y, *k),
                    _ => {}
                }
            }
            "BT" => {
                self.tm = Matrix::IDENTITY;
                self.tlm = Matrix::IDENTITY;
            }
            "Tf" => {
                if let Some(Object::Name(name)) = operands.first() {
                    self.state.font = name.clone();
                }
                if let Some(size) = num(1) {
                    self.state.font_size = size;
                }
            }
            "Tc" => self.state.char_spacing = num(0).unwrap_or(0.0),
            "Tw" => self.state.word_spacing = num(0).unwrap_or(0.0),
            "Tz" => self.state.horizontal_scale = num(0).unwrap_or(100.0) / 100.0,
            "TL" => self.state.leading = num(0).unwrap_or(0.0),
            "Ts" => self.state.rise = num(0).unwrap_or(0.0),
            "Td" => {
                self.move_line(num(0).unwrap_or(0.0), num(1).unwrap_or(0.0));
            }
            "TD" => {
                let ty = num(1).unwrap_or(0.0);
                self.state.leading = -ty;
                self.move_line(num(0).unwrap_or(0.0), ty);
            }
            "Tm" => {
                if let Some(matrix) = matrix_from_operands(operands) {
                    self.tm = matrix;
                    self.tlm = matrix;
                }
            }
            "T*" => self.next_line(),
            "Tj" => {
                if let Some(Object::String(bytes, _)) = operands.first() {
                    return self.show(&[ShowPiece::Bytes(bytes)]);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operands.first() {
                    let pieces = items
                        .iter()
                        .filter_map(|item| match item {
                            Object::String(bytes, _) => Some(ShowPiece::Bytes(bytes)),
                            other => number(other).map(ShowPiece::Adjust),
                        })
                        .collect::<Vec<_>>();
                    return self.show(&pieces);
                }
            }
            "'" => {
                self.next_line();
                if let Some(Object::String(bytes, _)) = operands.first() {
                    return self.show(&[ShowPiece::Bytes(bytes)]);
                }
            }
            "\"" => {
                self.state.word_spacing = num(0).unwrap_or(self.state.word_spacing);
                self.state.char_spacing = num(1).unwrap_or(self.state.char_spacing);
                self.next_line();
                if let Some(Object::String(bytes, _)) = operands.get(2) {
                    return self.show(&[ShowPiece::Bytes(bytes)]);
                }
            }
            "Do" => {
                if let Some(Object::Name(name)) = operands.first() {
                    return Step::XObject {
                        name: name.clone(),
                        ctm: self.state.ctm,
                    };
                }
            }
            "m" | "l" => {
                if let (Some(x), Some(y)) = (num(0), num(1)) {
                    self.extend_path(&[(x, y)]);
                }
            }
            "c" => {
                let points = (0..3)
                    .filter_map(|i| Some((num(i * 2)?, num(i * 2 + 1)?)))
                    .collect::<Vec<_>>();
                self.extend_path(&points);
            }
            "v" | "y" => {
                let points = (0..2)
                    .filter_map(|i| Some((num(i * 2)?, num(i * 2 + 1)?)))
                    .collect::<Vec<_>>();
                self.extend_path(&points);
            }
            "re" => {
                if let (Some(x), Some(y), Some(w), Some(h)) = (num(0), num(1), num(2), num(3)) {
                    self.extend_path(&[(x, y), (x + w, y + h)]);
                }
            }
            "S" | "s" | "f" | "F" | "f*" | "B" | "B*" | "b" | "b*" => {
                return Step::Paint(self.path.take());
            }
            "n" => self.path = None,
            _ => {}
        }
        Step::None
    }

    fn move_line(&mut self, tx: f32, ty: f32) {
        self.tlm = Matrix::translate(tx, ty).multiply(&self.tlm);
        self.tm = self.tlm;
    }

    fn next_line(&mut self) {
        let leading = if self.state.leading != 0.0 {
            self.state.leading
        } else {
            self.state.font_size * 1.2
        };
        self.move_line(0.0, -leading);
    }

    fn extend_path(&mut self, points: &[(f32, f32)]) {
        for (x, y) in points {
            let (ux, uy) = self.state.ctm.apply(*x, *y);
            let point = Rect::new(ux, uy, ux, uy);
            self.path = Some(match self.path {
                Some(rect) => Rect::new(
                    rect.x0.min(point.x0),
                    rect.y0.min(point.y0),
                    rect.x1.max(point.x1),
                    rect.y1.max(point.y1),
                ),
                None => point,
            });
        }
    }

    fn show(&mut self, pieces: &[ShowPiece<'_>]) -> Step {
        let size = self.state.font_size;
        let scale = self.state.horizontal_scale;
        let font = self.fonts.get(&self.state.font);
        let mut text = String::new();
        let mut tx = 0.0f32;
        for piece in pieces {
            match piece {
                ShowPiece::Bytes(bytes) => {
                    let decoded = match font {
                        Some(font) => font.decode(self.doc, bytes),
                        None => decode_text_simple(bytes),
                    };
                    let metrics = match font {
                        Some(font) => font.measure(bytes, &decoded),
                        None => estimated_advance(&decoded),
                    };
                    tx += (metrics.width / 1000.0 * size
                        + self.state.char_spacing * metrics.codes as f32
                        + self.state.word_spacing * metrics.spaces as f32)
                        * scale;
                    text.push_str(&decoded);
                }
                ShowPiece::Adjust(value) => {
                    tx -= value / 1000.0 * size * scale;
                    if -value > TJ_SPACE_THRESHOLD
                        && !text.is_empty()
                        && !text.ends_with(' ')
                        && !text.ends_with('\u{00A0}')
                        && text.chars().last().is_some_and(|ch| !is_spaceless_script_char(ch))
                    {
                        text.push(' ');
                    }
                }
            }
        }

        let rendering = self.tm.multiply(&self.state.ctm);
        let rise = self.state.rise;
        let bbox = rendering.transform_rect(0.0, rise - 0.2 * size, tx, rise + 0.8 * size);
        let (_, baseline) = rendering.apply(0.0, rise);
        let effective_size = size * rendering.vertical_scale();
        let font_name = font
            .map(|font| font.base_font.clone())
            .unwrap_or_else(|| String::from_utf8_lossy(&self.state.font).to_string());
        let advance_units = if size * scale != 0.0 {
            tx / (size * scale) * 1000.0
        } else {
            0.0
        };
        self.tm = Matrix::translate(tx, 0.0).multiply(&self.tm);

        Step::Text(Shown {
            text,
            font_name,
            size: effective_size,
            color: self.state.fill,
            bbox,
            baseline,
            advance_units,
        })
    }
}

fn cmyk_to_rgb(c: f32, m: f32, y: f32, k: f32) -> [f32; 3] {
    [
        (1.0 - c) * (1.0 - k),
        (1.0 - m) * (1.0 - k),
        (1.0 - y) * (1.0 - k),
    ]
}

struct FontInfo<'a> {
    dict: &'a Dictionary,
    base_font: String,
    widths: Widths,
}

enum Widths {
    Simple {
        first_char: i64,
        widths: Vec<f32>,
        missing: f32,
    },
    Composite {
        default: f32,
        widths: HashMap<u16, f32>,
    },
    Unknown,
}

struct Advance {
    /// Sum of glyph widths in thousandths of an em.
    width: f32,
    codes: usize,
    spaces: usize,
}

impl FontInfo<'_> {
    fn decode(&self, doc: &Document, bytes: &[u8]) -> String {
        match self.dict.get_font_encoding(doc) {
            Ok(encoding) => {
                Document::decode_text(&encoding, bytes).unwrap_or_else(|_| decode_text_simple(bytes))
            }
            Err(_) => decode_text_simple(bytes),
        }
    }

    fn measure(&self, bytes: &[u8], decoded: &str) -> Advance {
        match &self.widths {
            Widths::Simple {
                first_char,
                widths,
                missing,
            } => Advance {
                width: bytes
                    .iter()
                    .map(|code| {
                        let index = *code as i64 - first_char;
                        usize::try_from(index)
                            .ok()
                            .and_then(|index| widths.get(index).copied())
                            .unwrap_or(*missing)
                    })
                    .sum(),
                codes: bytes.len(),
                spaces: bytes.iter().filter(|code| **code == b' ').count(),
            },
            Widths::Composite { default, widths } => {
                let codes = bytes
                    .chunks(2)
                    .map(|pair| match pair {
                        [hi, lo] => u16::from_be_bytes([*hi, *lo]),
                        [single] => *single as u16,
                        _ => 0,
                    })
                    .collect::<Vec<_>>();
                Advance {
                    width: codes
                        .iter()
                        .map(|code| widths.get(code).copied().unwrap_or(*default))
                        .sum(),
                    codes: codes.len(),
                    spaces: 0,
                }
            }
            Widths::Unknown => estimated_advance(decoded),
        }
    }
}

fn estimated_advance(decoded: &str) -> Advance {
    Advance {
        width: measure_text_width(decoded, 1000.0, None),
        codes: decoded.chars().count(),
        spaces: decoded.chars().filter(|ch| *ch == ' ').count(),
    }
}

fn font_table<'a>(doc: &'a Document, resources: Option<&'a Dictionary>) -> HashMap<Vec<u8>, FontInfo<'a>> {
    let mut table = HashMap::new();
    let Some(fonts) = resources
        .and_then(|resources| resources.get(b"Font").ok())
        .and_then(|obj| deref(doc, obj).as_dict().ok())
    else {
        return table;
    };
    for (name, value) in fonts.iter() {
        if let Ok(dict) = deref(doc, value).as_dict() {
            table.insert(name.clone(), font_info(doc, dict));
        }
    }
    table
}

fn font_info<'a>(doc: &'a Document, dict: &'a Dictionary) -> FontInfo<'a> {
    let base_font = dict
        .get(b"BaseFont")
        .ok()
        .and_then(|obj| obj.as_name().ok())
        .map(|name| String::from_utf8_lossy(name).to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    let subtype = dict.get(b"Subtype").ok().and_then(|obj| obj.as_name().ok());
    let widths = if subtype == Some(b"Type0".as_slice()) {
        composite_widths(doc, dict)
    } else {
        simple_widths(doc, dict)
    };
    FontInfo {
        dict,
        base_font,
        widths,
    }
}

fn simple_widths(doc: &Document, dict: &Dictionary) -> Widths {
    let Some(widths) = dict
        .get(b"Widths")
        .ok()
        .and_then(|obj| deref(doc, obj).as_array().ok())
    else {
        return Widths::Unknown;
    };
    let first_char = dict
        .get(b"FirstChar")
        .ok()
        .and_then(|obj| deref(doc, obj).as_i64().ok())
        .unwrap_or(0);
    let missing = dict
        .get(b"FontDescriptor")
        .ok()
        .and_then(|obj| deref(doc, obj).as_dict().ok())
        .and_then(|descriptor| descriptor.get(b"MissingWidth").ok())
        .and_then(|obj| number(deref(doc, obj)))
        .unwrap_or(0.0);
    Widths::Simple {
        first_char,
        widths: widths
            .iter()
            .map(|obj| number(deref(doc, obj)).unwrap_or(missing))
            .collect(),
        missing,
    }
}

fn composite_widths(doc: &Document, dict: &Dictionary) -> Widths {
    let Some(descendant) = dict
        .get(b"DescendantFonts")
        .ok()
        .and_then(|obj| deref(doc, obj).as_array().ok())
        .and_then(|fonts| fonts.first())
        .and_then(|obj| deref(doc, obj).as_dict().ok())
    else {
        return Widths::Unknown;
    };
    let default = descendant
        .get(b"DW")
        .ok()
        .and_then(|obj| number(deref(doc, obj)))
        .unwrap_or(1000.0);
    let mut widths = HashMap::new();
    if let Some(items) = descendant
        .get(b"W")
        .ok()
        .and_then(|obj| deref(doc, obj).as_array().ok())
    {
        let mut index = 0;
        while index < items.len() {
            let Some(first) = number(deref(doc, &items[index])) else {
                break;
            };
            match items.get(index + 1).map(|obj| deref(doc, obj)) {
                Some(Object::Array(list)) => {
                    for (offset, width) in list.iter().enumerate() {
                        if let Some(width) = number(deref(doc, width)) {
                            widths.insert(first as u16 + offset as u16, width);
                        }
                    }
                    index += 2;
                }
                Some(last) => {
                    let (Some(last), Some(width)) = (
                        number(last),
                        items.get(index + 2).and_then(|obj| number(deref(doc, obj))),
                    ) else {
                        break;
                    };
                    for code in first as u16..=last as u16 {
                        widths.insert(code, width);
                    }
                    index += 3;
                }
                None => break,
            }
        }
    }
    Widths::Composite { default, widths }
}

fn embed_font(doc: &mut Document, role: FontRole, metrics: &FontMetrics) -> EmbeddedFont {
    let base_font = format!(
        "{}-{}",
        sanitize_pdf_font_name(metrics.family().unwrap_or("Font")),
        role.resource_name()
    );
    let data = metrics.data().to_vec();
    let mut file_dict = Dictionary::new();
    let file_key = if metrics.is_cff() {
        file_dict.set("Subtype", Object::Name(b"OpenType".to_vec()));
        "FontFile3"
    } else {
        file_dict.set("Length1", Object::Integer(data.len() as i64));
        "FontFile2"
    };
    let file_id = doc.add_object(Stream::new(file_dict, data));

    let [x_min, y_min, x_max, y_max] = metrics.bbox_thousandths();
    let mut descriptor = Dictionary::new();
    descriptor.set("Type", Object::Name(b"FontDescriptor".to_vec()));
    descriptor.set("FontName", Object::Name(base_font.clone().into_bytes()));
    descriptor.set("Flags", Object::Integer(4));
    descriptor.set(
        "FontBBox",
        Object::Array(vec![
            Object::Integer(x_min),
            Object::Integer(y_min),
            Object::Integer(x_max),
            Object::Integer(y_max),
        ]),
    );
    descriptor.set("ItalicAngle", Object::Integer(0));
    descriptor.set("Ascent", Object::Integer(metrics.ascent_thousandths()));
    descriptor.set("Descent", Object::Integer(metrics.descent_thousandths()));
    descriptor.set("CapHeight", Object::Integer(metrics.ascent_thousandths()));
    descriptor.set("StemV", Object::Integer(80));
    descriptor.set(file_key, Object::Reference(file_id));
    let descriptor_id = doc.add_object(Object::Dictionary(descriptor));

    let mut system_info = Dictionary::new();
    system_info.set("Registry", Object::string_literal("Adobe"));
    system_info.set("Ordering", Object::string_literal("Identity"));
    system_info.set("Supplement", Object::Integer(0));

    let mut cid_font = Dictionary::new();
    cid_font.set("Type", Object::Name(b"Font".to_vec()));
    if metrics.is_cff() {
        cid_font.set("Subtype", Object::Name(b"CIDFontType0".to_vec()));
    } else {
        cid_font.set("Subtype", Object::Name(b"CIDFontType2".to_vec()));
        cid_font.set("CIDToGIDMap", Object::Name(b"Identity".to_vec()));
    }
    cid_font.set("BaseFont", Object::Name(base_font.clone().into_bytes()));
    cid_font.set("CIDSystemInfo", Object::Dictionary(system_info));
    cid_font.set("FontDescriptor", Object::Reference(descriptor_id));
    cid_font.set("DW", Object::Integer(1000));
    let cid_font_id = doc.add_object(Object::Dictionary(cid_font));

    let mut type0 = Dictionary::new();
    type0.set("Type", Object::Name(b"Font".to_vec()));
    type0.set("Subtype", Object::Name(b"Type0".to_vec()));
    type0.set("BaseFont", Object::Name(base_font.into_bytes()));
    type0.set("Encoding", Object::Name(b"Identity-H".to_vec()));
    type0.set("DescendantFonts", Object::Array(vec![Object::Reference(cid_font_id)]));
    let type0_id = doc.add_object(Object::Dictionary(type0));

    EmbeddedFont {
        type0_id,
        cid_font_id,
        used: BTreeMap::new(),
    }
}

fn sanitize_pdf_font_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else if ch.is_whitespace() {
            out.push('-');
        }
    }
    if out.is_empty() {
        "Font".to_string()
    } else {
        out
    }
}

/// ToUnicode CMap mapping each used glyph id back to its character.
fn to_unicode_cmap(used: &BTreeMap<u16, char>) -> Vec<u8> {
    let mut cmap = String::from(
        "/CIDInit /ProcSet findresource begin\n12 dict begin\nbegincmap\n\
         /CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n\
         /CMapName /Adobe-Identity-UCS def\n/CMapType 2 def\n\
         1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n",
    );
    let entries = used.iter().collect::<Vec<_>>();
    for chunk in entries.chunks(100) {
        cmap.push_str(&format!("{} beginbfchar\n", chunk.len()));
        for (gid, ch) in chunk {
            let mut units = [0u16; 2];
            let hex = ch
                .encode_utf16(&mut units)
                .iter()
                .map(|unit| format!("{:04X}", unit))
                .collect::<String>();
            cmap.push_str(&format!("<{:04X}> <{}>\n", gid, hex));
        }
        cmap.push_str("endbfchar\n");
    }
    cmap.push_str("endcmap\nCMapName currentdict /CMap defineresource pop\nend\nend\n");
    cmap.into_bytes()
}

/// Looks up a page attribute, walking up the page tree through /Parent.
fn resolve_inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = page_id;
    for _ in 0..64 {
        let dict = doc.get_object(current).ok()?.as_dict().ok()?;
        if let Ok(value) = dict.get(key) {
            return Some(value);
        }
        current = dict.get(b"Parent").ok()?.as_reference().ok()?;
    }
    None
}

fn deref<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value),
        _ => None,
    }
}

fn xobject_subtype(stream: &Stream) -> Option<&[u8]> {
    stream.dict.get(b"Subtype").ok()?.as_name().ok()
}

fn stream_bytes(stream: &Stream) -> Result<Vec<u8>> {
    if stream.dict.get(b"Filter").is_ok() {
        stream
            .decompressed_content()
            .map_err(|err| anyhow!("failed to decompress stream: {}", err))
    } else {
        Ok(stream.content.clone())
    }
}

/// Scripts written without spaces between words.
fn is_spaceless_script_char(c: char) -> bool {
    matches!(
        c as u32,
        0x3000..=0x303F | 0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0x20000..=0x2EBEF
    )
}

fn decode_text_simple(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let utf16 = bytes[2..]
            .chunks(2)
            .filter_map(|pair| match pair {
                [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
                _ => None,
            })
            .collect::<Vec<_>>();
        return String::from_utf16(&utf16).unwrap_or_default();
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    bytes.iter().map(|&byte| byte as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn build_pdf(content: &[u8]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica-Bold",
        });
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.to_vec()));
        let resources = dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        };
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => resources,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::from(page_id)],
                "Count" => 1i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    fn text_groups(backend: &LopdfBackend) -> Vec<(RasterRect, Vec<TextRun>)> {
        backend
            .groups(0)
            .unwrap()
            .into_iter()
            .filter_map(|group| match group {
                PageGroup::Text { bbox, runs } => Some((bbox, runs)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn reads_page_size_from_media_box() {
        let backend = LopdfBackend::from_bytes(&build_pdf(b"")).unwrap();
        assert_eq!(backend.page_count(), 1);
        assert_eq!(backend.page_size(0).unwrap(), (612.0, 792.0));
        assert!(backend.page_size(1).is_err());
    }

    #[test]
    fn extracts_positioned_runs_in_raster_space() {
        let pdf = build_pdf(b"BT /F1 12 Tf 1 0 0 rg 72 700 Td (Hello world) Tj ET");
        let backend = LopdfBackend::from_bytes(&pdf).unwrap();
        let groups = text_groups(&backend);
        assert_eq!(groups.len(), 1);
        let (bbox, runs) = &groups[0];
        assert_eq!(runs.len(), 1);
        assert!(runs[0].text.contains("Hello"));
        assert_eq!(runs[0].size, 12.0);
        assert_eq!(runs[0].color, [1.0, 0.0, 0.0]);
        assert_eq!(runs[0].font_name, "Helvetica-Bold");
        assert!((bbox.x0 - 72.0).abs() < 0.01);
        // top edge sits 0.8 em above the baseline at y = 700
        assert!((bbox.top() - (792.0 - 709.6)).abs() < 0.01);
    }

    #[test]
    fn consecutive_lines_form_one_block_and_distant_ones_do_not() {
        let pdf = build_pdf(
            b"BT /F1 10 Tf 72 700 Td (First line) Tj 0 -12 Td (second line) Tj ET \
              BT /F1 10 Tf 72 400 Td (Far below) Tj ET",
        );
        let backend = LopdfBackend::from_bytes(&pdf).unwrap();
        let groups = text_groups(&backend);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].1.len(), 1);
    }

    #[test]
    fn columns_on_one_baseline_stay_apart() {
        let pdf = build_pdf(
            b"BT /F1 10 Tf 72 700 Td (Left column) Tj ET BT /F1 10 Tf 350 700 Td (Right column) Tj ET",
        );
        let backend = LopdfBackend::from_bytes(&pdf).unwrap();
        assert_eq!(text_groups(&backend).len(), 2);
    }

    #[test]
    fn tj_gaps_become_spaces() {
        let pdf = build_pdf(b"BT /F1 10 Tf 72 700 Td [(Hello) -250 (world)] TJ ET");
        let backend = LopdfBackend::from_bytes(&pdf).unwrap();
        let groups = text_groups(&backend);
        assert!(groups[0].1[0].text.contains("Hello world"));
    }

    #[test]
    fn image_xobjects_are_reported() {
        let mut image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 1i64,
                "Height" => 1i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8i64,
            },
            vec![0u8],
        );
        image.allows_compression = false;
        let mut doc = Document::load_mem(&build_pdf(b"")).unwrap();
        let image_id = doc.add_object(image);
        let page_id = *doc.get_pages().values().next().unwrap();
        let content_id = doc.add_object(Stream::new(
            Dictionary::new(),
            b"q 200 0 0 100 100 300 cm /Im0 Do Q".to_vec(),
        ));
        {
            let page = doc.get_dictionary_mut(page_id).unwrap();
            page.set("Contents", Object::Reference(content_id));
            page.set(
                "Resources",
                dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
            );
        }
        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        let backend = LopdfBackend::from_bytes(&buf).unwrap();
        let groups = backend.groups(0).unwrap();
        let images = groups
            .iter()
            .filter_map(|group| match group {
                PageGroup::Image { bbox } => Some(*bbox),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0], RasterRect::new(100.0, 392.0, 300.0, 492.0));
    }

    #[test]
    fn redaction_removes_covered_text_only() {
        let pdf = build_pdf(
            b"BT /F1 10 Tf 72 700 Td (Redact me) Tj ET BT /F1 10 Tf 72 400 Td (Keep me) Tj ET \
              0 0 1 rg 10 10 50 50 re f",
        );
        let mut backend = LopdfBackend::from_bytes(&pdf).unwrap();
        let target = text_groups(&backend)[0].0;
        backend.redact(0, &[target], RedactOptions::default()).unwrap();
        let remaining = text_groups(&backend);
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].1[0].text.contains("Keep"));

        let ops = backend.page_operations(backend.page_id(0).unwrap()).unwrap();
        assert!(ops.iter().any(|op| op.operator == "re"));
        assert!(ops.iter().any(|op| op.operator == "f"));
    }

    #[test]
    fn redaction_keeps_later_text_in_place() {
        let pdf = build_pdf(b"BT /F1 10 Tf 72 700 Td (Gone) Tj (Stays) Tj ET");
        let mut backend = LopdfBackend::from_bytes(&pdf).unwrap();
        let before = text_groups(&backend)[0].1[0].bbox;
        let gone = RasterRect::new(70.0, 80.0, 96.0, 100.0);
        backend.redact(0, &[gone], RedactOptions::default()).unwrap();
        let after = text_groups(&backend);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].1[0].text, "Stays");
        assert!((after[0].1[0].bbox.x1 - before.x1).abs() < 0.01);
    }

    #[test]
    fn graphics_are_dropped_only_when_asked() {
        let pdf = build_pdf(b"0 0 1 rg 100 100 50 50 re f",
        );
        let mut backend = LopdfBackend::from_bytes(&pdf).unwrap();
        let area = RasterRect::new(90.0, 630.0, 160.0, 700.0);
        backend
            .redact(
                0,
                &[area],
                RedactOptions {
                    keep_images: true,
                    keep_graphics: false,
                },
            )
            .unwrap();
        let ops = backend.page_operations(backend.page_id(0).unwrap()).unwrap();
        assert!(!ops.iter().any(|op| op.operator == "f"));
        assert!(ops.iter().any(|op| op.operator == "n"));
    }

    #[test]
    fn drawing_requires_configured_fonts() {
        let mut backend = LopdfBackend::from_bytes(&build_pdf(b"")).unwrap();
        assert!(backend.embed_fonts(0).is_err());
    }

    #[test]
    fn missing_source_is_a_precondition_error() {
        let err = LopdfBackend::open(Path::new("/nonexistent/input.pdf")).unwrap_err();
        assert!(err.downcast_ref::<PreconditionError>().is_some());
    }

    fn with_form(bbox: [i64; 4], form_content: &[u8]) -> LopdfBackend {
        let mut doc = Document::load_mem(&build_pdf(b"")).unwrap();
        let page_id = *doc.get_pages().values().next().unwrap();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let form_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Form",
                "BBox" => bbox.iter().map(|v| Object::Integer(*v)).collect::<Vec<_>>(),
                "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            },
            form_content.to_vec(),
        ));
        let content_id = doc.add_object(Stream::new(Dictionary::new(), b"q /FM1 Do Q".to_vec()));
        {
            let page = doc.get_dictionary_mut(page_id).unwrap();
            page.set("Contents", Object::Reference(content_id));
            page.set(
                "Resources",
                dictionary! { "XObject" => dictionary! { "FM1" => form_id } },
            );
        }
        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        LopdfBackend::from_bytes(&buf).unwrap()
    }

    #[test]
    fn small_forms_are_figures_with_their_text() {
        let backend = with_form(
            [100, 300, 300, 500],
            b"0 0 1 RG 100 300 200 200 re S BT /F1 8 Tf 120 320 Td (Axis) Tj ET",
        );
        let groups = backend.groups(0).unwrap();
        assert_eq!(groups.len(), 1);
        match &groups[0] {
            PageGroup::Figure { bbox, runs } => {
                assert_eq!(*bbox, RasterRect::new(100.0, 292.0, 300.0, 492.0));
                assert_eq!(runs.len(), 1);
                assert_eq!(runs[0].text, "Axis");
            }
            other => panic!("expected a figure, got {:?}", other),
        }
    }

    #[test]
    fn page_sized_forms_are_read_as_page_text() {
        let backend = with_form([0, 0, 612, 792], b"BT /F1 12 Tf 72 700 Td (Hello) Tj ET");
        let groups = text_groups(&backend);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1[0].text, "Hello");
    }

    #[test]
    fn redaction_erases_text_inside_page_sized_forms() {
        let mut backend = with_form(
            [0, 0, 612, 792],
            b"BT /F1 12 Tf 72 700 Td (Hello) Tj ET BT /F1 12 Tf 72 400 Td (Kept) Tj ET",
        );
        let hello = text_groups(&backend)
            .into_iter()
            .find(|(_, runs)| runs[0].text == "Hello")
            .unwrap()
            .0;
        backend.redact(0, &[hello], RedactOptions::default()).unwrap();

        let remaining = text_groups(&backend);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1[0].text, "Kept");
        assert!((remaining[0].0.x0 - 72.0).abs() < 0.01);
        let ops = backend.page_operations(backend.page_id(0).unwrap()).unwrap();
        let drawn = ops
            .iter()
            .find(|op| op.operator == "Do")
            .and_then(|op| op.operands.first())
            .and_then(|name| name.as_name().ok())
            .unwrap();
        assert_eq!(drawn, b"FM1-r");
    }

    #[test]
    fn redaction_leaves_figure_forms_alone() {
        let mut backend = with_form(
            [100, 300, 300, 500],
            b"BT /F1 8 Tf 120 320 Td (Axis) Tj ET",
        );
        let page = RasterRect::new(0.0, 0.0, 612.0, 792.0);
        backend.redact(0, &[page], RedactOptions::default()).unwrap();
        let groups = backend.groups(0).unwrap();
        assert!(matches!(
            &groups[..],
            [PageGroup::Figure { runs, .. }] if runs[0].text == "Axis"
        ));
    }

    fn fixture_fonts() -> FontSet {
        let font = std::path::PathBuf::from(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/Montserrat-Regular.ttf"
        ));
        FontSet::load(&crate::fonts::FontPaths {
            sans_regular: font.clone(),
            sans_bold: font.clone(),
            serif: font,
        })
        .unwrap()
    }

    #[test]
    fn drawn_text_survives_save_and_reopen() {
        let pdf = build_pdf(b"BT /F1 12 Tf 72 680 Td (Hello world) Tj ET");
        let mut backend = LopdfBackend::from_bytes(&pdf).unwrap().with_fonts(fixture_fonts());
        let source = text_groups(&backend)[0].0;
        backend.redact(0, &[source], RedactOptions::default()).unwrap();
        backend.embed_fonts(0).unwrap();

        let rect = RasterRect::new(72.0, 100.0, 400.0, 140.0);
        let placement = TextPlacement {
            rect,
            text: "Bonjour le monde",
            font: FontRole::SansRegular,
            size: 12.0,
            color: [0.0, 0.0, 0.0],
            align: crate::layout::Alignment::Left,
            line_height: 1.2,
            mode: PlacementMode::Fit,
        };
        assert_eq!(backend.insert_text(0, &placement).unwrap(), Placement::Fitted);
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.pdf");
        backend.save(&output, false).unwrap();

        let reopened = LopdfBackend::open(&output).unwrap();
        let groups = text_groups(&reopened);
        assert_eq!(groups.len(), 1);
        let (bbox, runs) = &groups[0];
        assert_eq!(runs[0].text, "Bonjour le monde");
        assert!(runs[0].font_name.starts_with("Montserrat"));
        assert!((bbox.x0 - rect.x0).abs() < 0.5);
        assert!(bbox.top() >= rect.top() && bbox.y1 <= rect.y1);
    }

    #[test]
    fn text_too_long_for_its_box_is_refused_in_fit_mode() {
        let mut backend = LopdfBackend::from_bytes(&build_pdf(b""))
            .unwrap()
            .with_fonts(fixture_fonts());
        backend.embed_fonts(0).unwrap();
        let placement = TextPlacement {
            rect: RasterRect::new(72.0, 100.0, 112.0, 110.0),
            text: "far too much text for a tiny box",
            font: FontRole::Serif,
            size: 12.0,
            color: [0.0, 0.0, 0.0],
            align: crate::layout::Alignment::Justify,
            line_height: 1.2,
            mode: PlacementMode::Fit,
        };
        assert_eq!(backend.insert_text(0, &placement).unwrap(), Placement::Overflow);
        assert!(backend.overlays.is_empty());

        let forced = TextPlacement {
            mode: PlacementMode::Force,
            ..placement
        };
        assert_eq!(backend.insert_text(0, &forced).unwrap(), Placement::Overflow);
        assert!(!backend.overlays[&0].is_empty());
    }

    #[test]
    fn saved_fonts_carry_widths_and_unicode_map() {
        let mut backend = LopdfBackend::from_bytes(&build_pdf(b""))
            .unwrap()
            .with_fonts(fixture_fonts());
        backend.embed_fonts(0).unwrap();
        let placement = TextPlacement {
            rect: RasterRect::new(72.0, 100.0, 400.0, 140.0),
            text: "ab",
            font: FontRole::SansBold,
            size: 10.0,
            color: [0.0, 0.0, 0.0],
            align: crate::layout::Alignment::Left,
            line_height: 1.2,
            mode: PlacementMode::Fit,
        };
        backend.insert_text(0, &placement).unwrap();
        let dir = tempfile::tempdir().unwrap();
        backend.save(&dir.path().join("fonts.pdf"), false).unwrap();

        let embedded = &backend.embedded[&FontRole::SansBold];
        assert_eq!(embedded.used.len(), 2);
        let cid_font = backend.doc.get_dictionary(embedded.cid_font_id).unwrap();
        assert_eq!(cid_font.get(b"W").unwrap().as_array().unwrap().len(), 4);
        let type0 = backend.doc.get_dictionary(embedded.type0_id).unwrap();
        assert!(type0.get(b"ToUnicode").is_ok());
        let unused = &backend.embedded[&FontRole::Serif];
        assert!(unused.used.is_empty());
    }

    #[test]
    fn matrix_composition_applies_left_first() {
        let scale = Matrix([2.0, 0.0, 0.0, 2.0, 0.0, 0.0]);
        let shift = Matrix::translate(10.0, 5.0);
        assert_eq!(scale.multiply(&shift).apply(1.0, 1.0), (12.0, 7.0));
        assert_eq!(shift.multiply(&scale).apply(1.0, 1.0), (22.0, 12.0));
    }

    #[test]
    fn cmap_maps_glyphs_to_utf16() {
        let mut used = BTreeMap::new();
        used.insert(0x0102, '圖');
        used.insert(0x0003, ' ');
        let cmap = String::from_utf8(to_unicode_cmap(&used)).unwrap();
        assert!(cmap.contains("2 beginbfchar"));
        assert!(cmap.contains("<0003> <0020>"));
        assert!(cmap.contains("<0102> <5716>"));
    }
}
