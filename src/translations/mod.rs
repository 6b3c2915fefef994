use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tera::{Context as TeraContext, Tera};
use tracing::warn;

use crate::document::Page;
use crate::languages::{Language, LanguageRegistry};
use crate::providers::{ToolSpec, extract_json_value};
use crate::settings::Settings;

pub const TOOL_NAME: &str = "deliver_translations";

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.tera");

#[derive(Debug, Clone)]
pub struct TranslateOptions {
    pub lang: String,
    pub formality: String,
}

/// One block as sent to, and returned by, the translation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationItem {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
}

pub fn tool_spec(tool_name: &str) -> ToolSpec {
    let parameters = json!({
        "type": "object",
        "properties": {
            "translations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "type": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["id", "content"]
                }
            }
        },
        "required": ["translations"]
    });

    ToolSpec {
        name: tool_name.to_string(),
        description: "Return the translated blocks, one per input block, with ids unchanged."
            .to_string(),
        parameters,
    }
}

/// The translatable blocks of a page, reduced to what the service needs.
pub fn build_payload(page: &Page) -> Vec<TranslationItem> {
    page.translatable_blocks()
        .map(|block| TranslationItem {
            id: block.id.clone(),
            kind: block.kind.as_str().to_string(),
            content: block.content.clone(),
        })
        .collect()
}

pub fn render_system_prompt(
    options: &TranslateOptions,
    tool_name: &str,
    settings: &Settings,
    registry: &LanguageRegistry,
) -> Result<String> {
    let language = registry.resolve(&options.lang)?;
    let formality = options.formality.trim();
    let guidance = style_guidance(formality, settings)?;
    let mut context = TeraContext::new();
    context.insert("target_lang", language.code);
    context.insert("target_name", language.name);
    context.insert("formality", formality);
    context.insert("style_guidance", guidance.trim());
    context.insert("tool_name", tool_name);

    Tera::one_off(SYSTEM_PROMPT_TEMPLATE, &context, false)
        .with_context(|| "failed to render system prompt")
}

/// Accepts `{"translations": [...]}`, a bare list, or either of those
/// serialized into a string.
pub fn parse_tool_args(value: Value) -> Result<Vec<TranslationItem>> {
    let list = match value {
        Value::Object(mut map) => map
            .remove("translations")
            .ok_or_else(|| anyhow!("tool response has no 'translations' key"))?,
        Value::String(text) => {
            let inner = extract_json_value(&text)
                .ok_or_else(|| anyhow!("tool response is a string without JSON"))?;
            if matches!(inner, Value::String(_)) {
                return Err(anyhow!("tool response is a nested string"));
            }
            return parse_tool_args(inner);
        }
        other => other,
    };
    let list = match list {
        // some models double-encode the list
        Value::String(text) => {
            serde_json::from_str(&text).with_context(|| "failed to parse 'translations' string")?
        }
        other => other,
    };
    if !list.is_array() {
        return Err(anyhow!("'translations' is not a list"));
    }
    serde_json::from_value(list).with_context(|| "failed to parse translated items")
}

/// Rejects responses that cannot be merged. A count mismatch is only logged;
/// the merge keeps the original text for anything missing.
pub fn validate_translations(
    items: &[TranslationItem],
    requested: usize,
    language: &Language,
) -> Result<()> {
    if items.is_empty() {
        return Err(anyhow!("translation list is empty"));
    }
    if !items
        .iter()
        .any(|item| language.has_script_text(&item.content))
    {
        return Err(anyhow!(
            "no {} text found in the translations",
            language.name
        ));
    }
    if items.len() != requested {
        warn!(
            "expected {} translations, got {}; missing blocks keep their source text",
            requested,
            items.len()
        );
    }
    Ok(())
}

fn style_guidance(formality: &str, settings: &Settings) -> Result<String> {
    if formality.is_empty() {
        return Err(anyhow!("formality is empty"));
    }
    settings
        .formally
        .get(formality)
        .cloned()
        .ok_or_else(|| anyhow!("missing formality guidance for '{}'", formality))
}
