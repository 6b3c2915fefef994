use anyhow::{Result, anyhow};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{
    DocumentBackend, PageGroup, Placement, PlacementMode, RedactOptions, TextPlacement, TextRun,
};
use crate::error::ServiceError;
use crate::fonts::FontRole;
use crate::geometry::RasterRect;
use crate::layout::{Alignment, layout_text};
use crate::providers::{Provider, ProviderFuture, ProviderResponse, Sleeper, ToolSpec};

pub(crate) fn run(text: &str, size: f32, font_name: &str) -> TextRun {
    TextRun {
        text: text.to_string(),
        size,
        color: [0.0, 0.0, 0.0],
        font_name: font_name.to_string(),
        bbox: RasterRect::new(0.0, 0.0, 10.0, size),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedPlacement {
    pub rect: RasterRect,
    pub text: String,
    pub font: FontRole,
    pub size: f32,
    pub align: Alignment,
    pub line_height: f32,
    pub mode: PlacementMode,
}

/// In-memory document: fixed groups per page, and a record of every
/// mutation. Text fits when the estimated layout fits.
#[derive(Debug, Default)]
pub(crate) struct FakeBackend {
    pages: Vec<(f32, f32, Vec<PageGroup>)>,
    redactions: Vec<(usize, Vec<RasterRect>, RedactOptions)>,
    font_embeds: Vec<usize>,
    placements: Vec<RecordedPlacement>,
    saved_to: Option<PathBuf>,
}

impl FakeBackend {
    pub fn single_page(groups: Vec<PageGroup>) -> Self {
        Self {
            pages: vec![(612.0, 792.0, groups)],
            ..Self::default()
        }
    }

    pub fn redactions(&self) -> Vec<(usize, Vec<RasterRect>, RedactOptions)> {
        self.redactions.clone()
    }

    pub fn font_embeds(&self) -> Vec<usize> {
        self.font_embeds.clone()
    }

    pub fn placements(&self) -> Vec<RecordedPlacement> {
        self.placements.clone()
    }

    pub fn saved_to(&self) -> Option<PathBuf> {
        self.saved_to.clone()
    }

    fn check_page(&self, page: usize) -> Result<()> {
        if page < self.pages.len() {
            Ok(())
        } else {
            Err(anyhow!("page {} out of range", page))
        }
    }
}

impl DocumentBackend for FakeBackend {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_size(&self, page: usize) -> Result<(f32, f32)> {
        self.check_page(page)?;
        let (width, height, _) = &self.pages[page];
        Ok((*width, *height))
    }

    fn groups(&self, page: usize) -> Result<Vec<PageGroup>> {
        self.check_page(page)?;
        Ok(self.pages[page].2.clone())
    }

    fn redact(&mut self, page: usize, rects: &[RasterRect], options: RedactOptions) -> Result<()> {
        self.check_page(page)?;
        self.redactions.push((page, rects.to_vec(), options));
        Ok(())
    }

    fn embed_fonts(&mut self, page: usize) -> Result<()> {
        self.check_page(page)?;
        self.font_embeds.push(page);
        Ok(())
    }

    fn insert_text(&mut self, page: usize, placement: &TextPlacement<'_>) -> Result<Placement> {
        self.check_page(page)?;
        let layout = layout_text(
            placement.text,
            None,
            placement.size,
            placement.rect.width(),
            placement.rect.height(),
            placement.line_height,
            placement.align,
        );
        self.placements.push(RecordedPlacement {
            rect: placement.rect,
            text: placement.text.to_string(),
            font: placement.font,
            size: placement.size,
            align: placement.align,
            line_height: placement.line_height,
            mode: placement.mode,
        });
        Ok(if layout.overflow {
            Placement::Overflow
        } else {
            Placement::Fitted
        })
    }

    fn save(&mut self, path: &Path, _compress: bool) -> Result<()> {
        self.saved_to = Some(path.to_path_buf());
        Ok(())
    }
}

/// Answers tool calls from a queue and records each user input it was sent.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedProvider {
    responses: Arc<Mutex<VecDeque<std::result::Result<Value, ServiceError>>>>,
    requests: Arc<Mutex<Vec<String>>>,
    user_input: Option<String>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<std::result::Result<Value, ServiceError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Provider for ScriptedProvider {
    fn append_system_input(self, _input: String) -> Self {
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.user_input = Some(input);
        self
    }

    fn register_tool(self, _tool: ToolSpec) -> Self {
        self
    }

    fn call_tool(self, _tool_name: &str) -> ProviderFuture {
        self.requests
            .lock()
            .unwrap()
            .push(self.user_input.clone().unwrap_or_default());
        let next = self.responses.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(Ok(args)) => Ok(ProviderResponse {
                    args,
                    model: Some("scripted-model".to_string()),
                    usage: None,
                }),
                Some(Err(err)) => Err(err),
                None => Err(ServiceError::Transport {
                    provider: "scripted",
                    message: "no scripted response left".to_string(),
                }),
            }
        })
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingSleeper {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.sleeps.lock().unwrap().push(duration);
        Box::pin(std::future::ready(()))
    }
}
