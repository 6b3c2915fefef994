use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use crate::document::{Document, Page, TranslationStatus, TranslationSummary};
use crate::languages::{Language, LanguageRegistry};
use crate::providers::retry::retry;
use crate::providers::{
    Attempt, Provider, ProviderImpl, ProviderKind, ProviderOptions, RetryPolicy, Sleeper,
    TokioSleeper, build_provider,
};
use crate::settings::Settings;
use crate::translations::{
    TOOL_NAME, TranslateOptions, TranslationItem, build_payload, parse_tool_args,
    render_system_prompt, tool_spec, validate_translations,
};

/// Everything the translation stage needs, resolved up front.
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub provider: ProviderKind,
    pub key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub lang: String,
    pub formality: String,
    pub retry: RetryPolicy,
    /// Minimum pause between service calls for consecutive pages.
    pub page_delay: Duration,
    pub timeout: Duration,
}

impl TranslatorConfig {
    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            key: self.key.clone(),
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranslationOutcome {
    pub document: Document,
    pub status: TranslationStatus,
    pub failed_pages: Vec<usize>,
}

struct PageTranslation {
    items: Vec<TranslationItem>,
    model: Option<String>,
}

pub struct TranslationOrchestrator<P: Provider, S: Sleeper = TokioSleeper> {
    provider: P,
    config: TranslatorConfig,
    language: &'static Language,
    system_prompt: String,
    sleeper: S,
}

impl TranslationOrchestrator<ProviderImpl> {
    pub fn from_config(config: TranslatorConfig, settings: &Settings) -> Result<Self> {
        let provider = build_provider(config.provider, config.provider_options())?;
        Self::new(provider, config, settings)
    }
}

impl<P: Provider> TranslationOrchestrator<P> {
    pub fn new(provider: P, config: TranslatorConfig, settings: &Settings) -> Result<Self> {
        Self::with_sleeper(provider, config, settings, TokioSleeper)
    }
}

impl<P: Provider, S: Sleeper> TranslationOrchestrator<P, S> {
    pub fn with_sleeper(
        provider: P,
        config: TranslatorConfig,
        settings: &Settings,
        sleeper: S,
    ) -> Result<Self> {
        let registry = LanguageRegistry::load();
        let language = registry.resolve(&config.lang)?;
        let options = TranslateOptions {
            lang: language.code.to_string(),
            formality: config.formality.clone(),
        };
        let system_prompt = render_system_prompt(&options, TOOL_NAME, settings, &registry)?;
        Ok(Self {
            provider,
            config,
            language,
            system_prompt,
            sleeper,
        })
    }

    /// Translates every page in order. A page whose attempts are exhausted
    /// keeps its source text and is listed in `failed_pages`.
    pub async fn translate(&self, mut document: Document) -> Result<TranslationOutcome> {
        let mut failed_pages = Vec::new();
        let mut reported_model = None;
        let mut called_service = false;

        for page in document.pages.iter_mut() {
            let payload = build_payload(page);
            if payload.is_empty() {
                debug!("page {}: nothing to translate", page.page_index);
                continue;
            }
            if called_service && !self.config.page_delay.is_zero() {
                self.sleeper.sleep(self.config.page_delay).await;
            }
            called_service = true;

            match self.translate_page(page.page_index, &payload).await {
                Ok(translation) => {
                    let merged = merge_translations(page, &translation.items);
                    info!(
                        "page {}: translated {}/{} blocks",
                        page.page_index,
                        merged,
                        payload.len()
                    );
                    if reported_model.is_none() {
                        reported_model = translation.model;
                    }
                }
                Err(err) => {
                    warn!(
                        "page {}: keeping source text after failed translation: {:#}",
                        page.page_index, err
                    );
                    failed_pages.push(page.page_index);
                }
            }
        }

        let status = if failed_pages.is_empty() {
            TranslationStatus::Complete
        } else {
            TranslationStatus::Partial
        };
        info!(
            "translation {} ({} failed pages)",
            status.as_str(),
            failed_pages.len()
        );
        document.translation = Some(TranslationSummary {
            status,
            failed_pages: failed_pages.clone(),
            target_language: self.language.code.to_string(),
            model: reported_model.or_else(|| Some(self.config.model.clone())),
            translated_at: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
        });
        Ok(TranslationOutcome {
            document,
            status,
            failed_pages,
        })
    }

    async fn translate_page(
        &self,
        page_index: usize,
        payload: &[TranslationItem],
    ) -> Result<PageTranslation> {
        let user_input =
            serde_json::to_string(payload).with_context(|| "failed to serialize page payload")?;
        let label = format!("page {}", page_index);
        let language = self.language;
        retry(&self.config.retry, &self.sleeper, &label, |attempt| {
            let provider = self
                .provider
                .clone()
                .register_tool(tool_spec(TOOL_NAME))
                .append_system_input(self.system_prompt.clone())
                .append_user_input(user_input.clone());
            async move {
                debug!(
                    "page {}: attempt {} with {} blocks",
                    page_index,
                    attempt,
                    payload.len()
                );
                let response = match provider.call_tool(TOOL_NAME).await {
                    Ok(response) => response,
                    Err(err) => return Attempt::from_service_error(err),
                };
                let items = match parse_tool_args(response.args) {
                    Ok(items) => items,
                    Err(err) => return Attempt::retryable(err),
                };
                if let Err(err) = validate_translations(&items, payload.len(), language) {
                    return Attempt::retryable(err);
                }
                Attempt::Success(PageTranslation {
                    items,
                    model: response.model,
                })
            }
        })
        .await
    }
}

/// Writes translated text into the page's translatable blocks by id.
/// Ids the page does not have are ignored; blocks without a non-empty
/// translation keep their content. Returns the number of blocks changed.
pub fn merge_translations(page: &mut Page, items: &[TranslationItem]) -> usize {
    let translated: HashMap<&str, String> = items
        .iter()
        .filter_map(|item| {
            let text = fold_lines(&item.content);
            (!text.is_empty()).then_some((item.id.as_str(), text))
        })
        .collect();
    let mut merged = 0;
    for block in page.blocks.iter_mut() {
        if !block.is_translatable() {
            continue;
        }
        if let Some(text) = translated.get(block.id.as_str()) {
            block.content = text.clone();
            merged += 1;
        }
    }
    merged
}

fn fold_lines(text: &str) -> String {
    text.trim().lines().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, BlockStyle, BlockType};
    use crate::error::ServiceError;
    use crate::geometry::Rect;
    use crate::test_util::{RecordingSleeper, ScriptedProvider};
    use serde_json::{Value, json};

    fn config() -> TranslatorConfig {
        TranslatorConfig {
            provider: ProviderKind::OpenRouter,
            key: "test-key".to_string(),
            model: "google/gemini-2.0-flash-exp:free".to_string(),
            base_url: None,
            lang: "zh-hant".to_string(),
            formality: "academic".to_string(),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(8),
            },
            page_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }

    fn block(page: usize, index: usize, kind: BlockType, content: &str) -> Block {
        Block {
            id: format!("p{}_b{}", page, index),
            kind,
            bbox: Rect::new(72.0, 700.0 - index as f32 * 20.0, 540.0, 715.0 - index as f32 * 20.0),
            content: content.to_string(),
            style: BlockStyle::default(),
            metadata: Value::Null,
        }
    }

    fn page(page_index: usize, blocks: Vec<Block>) -> Page {
        Page {
            page_index,
            width: 612.0,
            height: 792.0,
            blocks,
        }
    }

    fn body_page(page_index: usize, count: usize) -> Page {
        page(
            page_index,
            (0..count)
                .map(|index| {
                    let content = format!("Sentence {}", index);
                    block(page_index, index, BlockType::Body, &content)
                })
                .collect(),
        )
    }

    fn translations(page_index: usize, indices: impl Iterator<Item = usize>) -> Value {
        let items = indices
            .map(|index| {
                json!({
                    "id": format!("p{}_b{}", page_index, index),
                    "type": "body",
                    "content": format!("第 {} 句", index)
                })
            })
            .collect::<Vec<_>>();
        json!({ "translations": items })
    }

    fn orchestrator(
        provider: ScriptedProvider,
        sleeper: RecordingSleeper,
    ) -> TranslationOrchestrator<ScriptedProvider, RecordingSleeper> {
        let settings = Settings::builtin().unwrap();
        TranslationOrchestrator::with_sleeper(provider, config(), &settings, sleeper).unwrap()
    }

    #[tokio::test]
    async fn partial_response_merges_what_came_back() {
        let provider = ScriptedProvider::new(vec![Ok(translations(0, 0..8))]);
        let sleeper = RecordingSleeper::default();
        let document = Document::new("paper.pdf", vec![body_page(0, 10)]);

        let outcome = orchestrator(provider, sleeper.clone())
            .translate(document)
            .await
            .unwrap();

        assert_eq!(outcome.status, TranslationStatus::Complete);
        assert!(outcome.failed_pages.is_empty());
        let blocks = &outcome.document.pages[0].blocks;
        for block in &blocks[..8] {
            assert!(block.content.starts_with("第 "), "{}", block.content);
        }
        assert_eq!(blocks[8].content, "Sentence 8");
        assert_eq!(blocks[9].content, "Sentence 9");
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn payload_carries_only_id_type_and_content() {
        let provider = ScriptedProvider::new(vec![Ok(translations(0, 0..1))]);
        let mut source = body_page(0, 1);
        source.blocks.push(block(0, 1, BlockType::Image, "[IMAGE]"));
        let document = Document::new("paper.pdf", vec![source]);

        orchestrator(provider.clone(), RecordingSleeper::default())
            .translate(document)
            .await
            .unwrap();

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        let sent: Value = serde_json::from_str(&requests[0]).unwrap();
        assert_eq!(
            sent,
            json!([{"id": "p0_b0", "type": "body", "content": "Sentence 0"}])
        );
    }

    #[tokio::test]
    async fn retries_rate_limits_with_backoff_then_succeeds() {
        let provider = ScriptedProvider::new(vec![
            Err(ServiceError::RateLimited {
                provider: "scripted",
                status: 429,
                message: "slow down".to_string(),
                retry_after: None,
            }),
            Ok(json!({"translations": [{"id": "p0_b0", "content": "Still English"}]})),
            Ok(translations(0, 0..2)),
        ]);
        let sleeper = RecordingSleeper::default();
        let document = Document::new("paper.pdf", vec![body_page(0, 2)]);

        let outcome = orchestrator(provider, sleeper.clone())
            .translate(document)
            .await
            .unwrap();

        assert_eq!(outcome.status, TranslationStatus::Complete);
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(outcome.document.pages[0].blocks[0].content, "第 0 句");
    }

    #[tokio::test]
    async fn fatal_error_fails_the_page_without_more_attempts() {
        let provider = ScriptedProvider::new(vec![
            Err(ServiceError::Rejected {
                provider: "scripted",
                status: 401,
                message: "invalid key".to_string(),
            }),
            Ok(translations(1, 0..2)),
        ]);
        let sleeper = RecordingSleeper::default();
        let document = Document::new("paper.pdf", vec![body_page(0, 2), body_page(1, 2)]);

        let outcome = orchestrator(provider.clone(), sleeper.clone())
            .translate(document)
            .await
            .unwrap();

        assert_eq!(outcome.status, TranslationStatus::Partial);
        assert_eq!(outcome.failed_pages, vec![0]);
        assert_eq!(outcome.document.pages[0].blocks[0].content, "Sentence 0");
        assert_eq!(outcome.document.pages[1].blocks[1].content, "第 1 句");
        assert_eq!(provider.requests().len(), 2);
        // only the pause between the two pages
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(1)]);

        let summary = outcome.document.translation.unwrap();
        assert_eq!(summary.failed_pages, vec![0]);
        assert_eq!(summary.target_language, "zh-hant");
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_page_failed() {
        let untranslated =
            || Ok(json!({"translations": [{"id": "p0_b0", "content": "Sentence 0"}]}));
        let provider = ScriptedProvider::new(vec![untranslated(), untranslated(), untranslated()]);
        let document = Document::new("paper.pdf", vec![body_page(0, 1)]);
        let before = document.clone();

        let outcome = orchestrator(provider.clone(), RecordingSleeper::default())
            .translate(document)
            .await
            .unwrap();

        assert_eq!(outcome.failed_pages, vec![0]);
        assert_eq!(outcome.document.pages, before.pages);
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn pages_without_translatable_blocks_are_skipped() {
        let provider = ScriptedProvider::new(vec![]);
        let image_only = page(0, vec![block(0, 0, BlockType::Image, "[IMAGE]")]);
        let document = Document::new("paper.pdf", vec![image_only]);

        let outcome = orchestrator(provider.clone(), RecordingSleeper::default())
            .translate(document)
            .await
            .unwrap();

        assert_eq!(outcome.status, TranslationStatus::Complete);
        assert!(provider.requests().is_empty());
    }

    #[test]
    fn merge_folds_newlines_and_ignores_unknown_or_empty() {
        let mut target = page(
            0,
            vec![
                block(0, 0, BlockType::Heading, "Introduction"),
                block(0, 1, BlockType::Body, "Body"),
                block(0, 2, BlockType::Chart, "axis"),
            ],
        );
        let item = |id: &str, content: &str| TranslationItem {
            id: id.to_string(),
            kind: String::new(),
            content: content.to_string(),
        };
        let merged = merge_translations(
            &mut target,
            &[
                item("p0_b0", "  引言\n第一節  "),
                item("p0_b1", "   "),
                item("p0_b2", "軸"),
                item("p9_b9", "多餘"),
            ],
        );
        assert_eq!(merged, 1);
        assert_eq!(target.blocks[0].content, "引言 第一節");
        assert_eq!(target.blocks[1].content, "Body");
        assert_eq!(target.blocks[2].content, "axis");
    }
}
