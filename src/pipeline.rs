//! The four stages, run in process and connected through checkpoint files.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backend::{DocumentBackend, LopdfBackend};
use crate::coverage::{CoverageReport, CoverageValidator};
use crate::document::Document;
use crate::extract::{BlockClassifier, DocumentExtractor};
use crate::fonts::FontSet;
use crate::render::{RenderLog, RenderSettings, ShapeAwareRenderer};
use crate::settings::Settings;
use crate::translator::{TranslationOrchestrator, TranslationOutcome, TranslatorConfig};

pub const INTERMEDIATE_FILE: &str = "intermediate.json";
pub const TRANSLATED_FILE: &str = "translated.json";
pub const OUTPUT_FILE: &str = "translated.pdf";
pub const RENDER_LOG_FILE: &str = "render_log.json";

pub fn extract_stage(input: &Path, output: &Path, settings: &Settings) -> Result<Document> {
    let backend = LopdfBackend::open(input)?;
    let filename = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.display().to_string());
    let classifier = BlockClassifier::new(settings.classifier.clone());
    let document = DocumentExtractor::new(&backend, classifier).extract(&filename)?;
    document.save(output)?;
    info!("wrote {}", output.display());
    Ok(document)
}

pub async fn translate_stage(
    input: &Path,
    output: &Path,
    config: TranslatorConfig,
    settings: &Settings,
) -> Result<TranslationOutcome> {
    let document = Document::load(input)?;
    let orchestrator = TranslationOrchestrator::from_config(config, settings)?;
    let outcome = orchestrator.translate(document).await?;
    outcome.document.save(output)?;
    info!("wrote {}", output.display());
    Ok(outcome)
}

/// Every precondition (fonts, checkpoint, source) is checked before anything
/// is written. Once drawing starts the render log is written on every exit.
pub fn render_stage(
    source: &Path,
    translated: &Path,
    output: &Path,
    log_path: &Path,
    settings: &RenderSettings,
) -> Result<RenderLog> {
    let fonts = FontSet::load(&settings.fonts)?;
    let document = Document::load(translated)?;
    let mut backend = LopdfBackend::open(source)?.with_fonts(fonts);
    render_document(&mut backend, &document, output, log_path, settings)
}

pub fn render_document<B: DocumentBackend>(
    backend: &mut B,
    document: &Document,
    output: &Path,
    log_path: &Path,
    settings: &RenderSettings,
) -> Result<RenderLog> {
    let mut guard = RenderLogGuard::new(log_path);
    ShapeAwareRenderer::new(backend, settings).render(document, guard.log_mut())?;
    backend
        .save(output, settings.compress)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!("wrote {}", output.display());
    guard.finish()
}

pub fn validate_stage(
    intermediate: &Path,
    log_path: &Path,
    threshold: f64,
) -> Result<CoverageReport> {
    let document = Document::load(intermediate)?;
    let log = RenderLog::load(log_path)?;
    Ok(CoverageValidator::new(threshold).validate(&document, &log))
}

/// Writes any JSON report atomically.
pub fn write_report<T: serde::Serialize>(path: &Path, report: &T) -> Result<()> {
    crate::document::write_json_atomic(path, report)
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub intermediate: PathBuf,
    pub translated: PathBuf,
    pub output: PathBuf,
    pub render_log: PathBuf,
}

impl RunPaths {
    pub fn in_dir(workdir: &Path) -> Self {
        Self {
            intermediate: workdir.join(INTERMEDIATE_FILE),
            translated: workdir.join(TRANSLATED_FILE),
            output: workdir.join(OUTPUT_FILE),
            render_log: workdir.join(RENDER_LOG_FILE),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub paths: RunPaths,
    pub failed_pages: Vec<usize>,
    pub report: CoverageReport,
}

/// Extract, translate, render and validate `input` inside `workdir`.
pub async fn run_all(
    input: &Path,
    workdir: &Path,
    config: TranslatorConfig,
    settings: &Settings,
) -> Result<RunSummary> {
    // fail on missing fonts before spending any translation calls
    FontSet::load(&settings.render.fonts)?;
    let paths = RunPaths::in_dir(workdir);
    extract_stage(input, &paths.intermediate, settings)?;
    let outcome = translate_stage(&paths.intermediate, &paths.translated, config, settings).await?;
    render_stage(
        input,
        &paths.translated,
        &paths.output,
        &paths.render_log,
        &settings.render,
    )?;
    let report = validate_stage(
        &paths.intermediate,
        &paths.render_log,
        settings.validation.coverage_threshold,
    )?;
    Ok(RunSummary {
        paths,
        failed_pages: outcome.failed_pages,
        report,
    })
}

/// Holds the render log and writes it when dropped, unless
/// [`RenderLogGuard::finish`] already did.
struct RenderLogGuard {
    path: PathBuf,
    log: RenderLog,
    written: bool,
}

impl RenderLogGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            log: RenderLog::default(),
            written: false,
        }
    }

    fn log_mut(&mut self) -> &mut RenderLog {
        &mut self.log
    }

    fn finish(mut self) -> Result<RenderLog> {
        self.log.save(&self.path)?;
        self.written = true;
        info!("wrote {}", self.path.display());
        Ok(std::mem::take(&mut self.log))
    }
}

impl Drop for RenderLogGuard {
    fn drop(&mut self) {
        if self.written {
            return;
        }
        match self.log.save(&self.path) {
            Ok(()) => warn!(
                "render stopped early; wrote partial log with {} records to {}",
                self.log.attempted(),
                self.path.display()
            ),
            Err(err) => warn!("failed to write render log: {:#}", err),
        }
    }
}
