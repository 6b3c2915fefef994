//! Layout-aware translation of PDF documents.
//!
//! The pipeline runs in four stages connected by JSON checkpoints:
//! extraction of classified text blocks, per-page translation through an
//! LLM tool call, redrawing the translations into the original geometry, and
//! a coverage check of the render log against the extracted blocks.

pub mod backend;
pub mod compare;
pub mod coverage;
pub mod document;
pub mod error;
pub mod extract;
pub mod fonts;
pub mod geometry;
pub mod languages;
pub mod layout;
pub mod logging;
pub mod pipeline;
mod providers;
pub mod render;
pub mod settings;
pub mod translations;
mod translator;

#[cfg(test)]
mod test_util;

pub use compare::{ComparisonReport, compare_files};
pub use coverage::{CoverageReport, CoverageValidator, MissingBlock};
pub use document::{Block, BlockStyle, BlockType, Document, Page, TranslationStatus};
pub use error::{PreconditionError, ServiceError};
pub use extract::{BlockClassifier, DocumentExtractor};
pub use providers::{
    Claude, OpenAI, Provider, ProviderKind, ProviderSelection, ProviderUsage, RetryPolicy,
    resolve_key, resolve_provider_selection,
};
pub use render::{RenderLog, RenderSettings, ShapeAwareRenderer};
pub use settings::{Settings, load_settings};
pub use translator::{TranslationOrchestrator, TranslationOutcome, TranslatorConfig};
