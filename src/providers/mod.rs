use anyhow::{Context, Result, anyhow};
use reqwest::RequestBuilder;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::{PreconditionError, ServiceError};

mod claude;
mod openai;
pub(crate) mod retry;

pub use claude::Claude;
pub use openai::OpenAI;
pub use retry::{Attempt, RetryPolicy, Sleeper, TokioSleeper};

pub(crate) const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    OpenRouter,
    Claude,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Claude => "claude",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => openai::DEFAULT_MODEL,
            ProviderKind::OpenRouter => openai::OPENROUTER_DEFAULT_MODEL,
            ProviderKind::Claude => claude::DEFAULT_MODEL,
        }
    }

    pub fn env_key(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "OPENAI_API_KEY",
            ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
            ProviderKind::Claude => "ANTHROPIC_API_KEY",
        }
    }

    pub fn from_name(name: &str) -> Option<ProviderKind> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAI),
            "openrouter" => Some(ProviderKind::OpenRouter),
            "claude" | "anthropic" => Some(ProviderKind::Claude),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub requested_model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderResponse {
    pub args: serde_json::Value,
    pub model: Option<String>,
    pub usage: Option<ProviderUsage>,
}

/// The turns and tools of one request, accumulated by the builder methods
/// of each provider.
#[derive(Debug, Clone, Default)]
pub(crate) struct Conversation {
    system: Vec<String>,
    user: Vec<String>,
    tools: Vec<ToolSpec>,
}

impl Conversation {
    pub(crate) fn push_system(&mut self, text: String) {
        self.system.push(text);
    }

    pub(crate) fn push_user(&mut self, text: String) {
        self.user.push(text);
    }

    /// Registering a tool twice keeps the later definition.
    pub(crate) fn register(&mut self, tool: ToolSpec) {
        self.tools.retain(|existing| existing.name != tool.name);
        self.tools.push(tool);
    }

    /// All system turns as one instruction block.
    pub(crate) fn system_prompt(&self) -> Option<String> {
        let joined = self
            .system
            .iter()
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        (!joined.is_empty()).then_some(joined)
    }

    pub(crate) fn user_turns(&self) -> &[String] {
        &self.user
    }

    pub(crate) fn tool(
        &self,
        provider: &'static str,
        name: &str,
    ) -> std::result::Result<&ToolSpec, ServiceError> {
        self.tools
            .iter()
            .find(|tool| tool.name == name)
            .ok_or_else(|| ServiceError::Malformed {
                provider,
                message: format!("tool '{}' not registered", name),
            })
    }
}

pub type ProviderFuture =
    Pin<Box<dyn Future<Output = std::result::Result<ProviderResponse, ServiceError>> + Send>>;

pub trait Provider: Clone + Send + Sync {
    fn append_system_input(self, input: String) -> Self;
    fn append_user_input(self, input: String) -> Self;
    fn register_tool(self, tool: ToolSpec) -> Self;
    fn call_tool(self, tool_name: &str) -> ProviderFuture;
}

#[derive(Debug, Clone)]
pub enum ProviderImpl {
    OpenAI(OpenAI),
    Claude(Claude),
}

impl Provider for ProviderImpl {
    fn append_system_input(self, input: String) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.append_system_input(input))
            }
            ProviderImpl::Claude(provider) => {
                ProviderImpl::Claude(provider.append_system_input(input))
            }
        }
    }

    fn append_user_input(self, input: String) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.append_user_input(input))
            }
            ProviderImpl::Claude(provider) => {
                ProviderImpl::Claude(provider.append_user_input(input))
            }
        }
    }

    fn register_tool(self, tool: ToolSpec) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => ProviderImpl::OpenAI(provider.register_tool(tool)),
            ProviderImpl::Claude(provider) => ProviderImpl::Claude(provider.register_tool(tool)),
        }
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.call_tool(tool_name),
            ProviderImpl::Claude(provider) => provider.call_tool(tool_name),
        }
    }
}

/// Connection details shared by every provider.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

pub fn build_provider(kind: ProviderKind, options: ProviderOptions) -> Result<ProviderImpl> {
    let client = reqwest::Client::builder()
        .timeout(options.timeout)
        .build()
        .context("failed to build HTTP client")?;
    let provider = match kind {
        ProviderKind::OpenAI => {
            let mut provider = OpenAI::new(options.key, client).with_model(options.model);
            if let Some(base_url) = options.base_url {
                provider = provider.with_base_url(base_url);
            }
            ProviderImpl::OpenAI(provider)
        }
        ProviderKind::OpenRouter => {
            let base_url = options
                .base_url
                .unwrap_or_else(|| OPENROUTER_BASE_URL.to_string());
            ProviderImpl::OpenAI(
                OpenAI::new(options.key, client)
                    .with_label(ProviderKind::OpenRouter.as_str())
                    .with_model(options.model)
                    .with_base_url(base_url),
            )
        }
        ProviderKind::Claude => {
            let mut provider = Claude::new(options.key, client).with_model(options.model);
            if let Some(base_url) = options.base_url {
                provider = provider.with_base_url(base_url);
            }
            ProviderImpl::Claude(provider)
        }
    };
    Ok(provider)
}

pub fn resolve_provider_selection(
    model_arg: Option<&str>,
    configured_provider: Option<&str>,
) -> Result<ProviderSelection> {
    if let Some(model) = model_arg {
        return parse_model_arg(model);
    }
    if let Some(name) = configured_provider.filter(|name| !name.trim().is_empty()) {
        let provider = ProviderKind::from_name(name)
            .ok_or_else(|| anyhow!("unknown provider '{}' in settings", name))?;
        return Ok(ProviderSelection {
            provider,
            requested_model: None,
        });
    }
    default_provider_selection()
}

/// Explicit key first, then the provider's environment variable.
pub fn resolve_key(provider: ProviderKind, override_key: Option<&str>) -> Result<String> {
    if let Some(key) = override_key.filter(|key| !key.trim().is_empty()) {
        return Ok(key.to_string());
    }
    get_env(provider.env_key())
        .ok_or_else(|| PreconditionError::MissingCredential(provider.env_key()).into())
}

fn default_provider_selection() -> Result<ProviderSelection> {
    for provider in [
        ProviderKind::OpenAI,
        ProviderKind::OpenRouter,
        ProviderKind::Claude,
    ] {
        if get_env(provider.env_key()).is_some() {
            return Ok(ProviderSelection {
                provider,
                requested_model: None,
            });
        }
    }
    Ok(ProviderSelection {
        provider: ProviderKind::OpenAI,
        requested_model: None,
    })
}

fn parse_model_arg(model_arg: &str) -> Result<ProviderSelection> {
    let raw = model_arg.trim();
    if raw.is_empty() {
        return Err(anyhow!("model argument is empty"));
    }

    if let Some(provider) = ProviderKind::from_name(raw) {
        return Ok(ProviderSelection {
            provider,
            requested_model: None,
        });
    }

    if let Some((provider_part, model_part)) = raw.split_once(':')
        && let Some(provider) = ProviderKind::from_name(provider_part)
    {
        let model = Some(model_part.trim().to_string()).filter(|model| !model.is_empty());
        return Ok(ProviderSelection {
            provider,
            requested_model: model,
        });
    }

    Err(anyhow!(
        "unable to infer provider from model '{}'. Use provider:model (openai:, openrouter:, claude:)",
        raw
    ))
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Sends a request and returns the body of a successful response.
pub(crate) async fn send(
    provider: &'static str,
    request: RequestBuilder,
    extract_error: fn(&str) -> Option<String>,
) -> std::result::Result<String, ServiceError> {
    let response = request.send().await.map_err(|err| ServiceError::Transport {
        provider,
        message: err.to_string(),
    })?;
    let status = response.status();
    let retry_after = retry::retry_after(response.headers());
    let text = response.text().await.map_err(|err| ServiceError::Transport {
        provider,
        message: err.to_string(),
    })?;
    if status.is_success() {
        return Ok(text);
    }
    let message = extract_error(&text).unwrap_or_else(|| text.clone());
    Err(retry::classify_failure(
        provider,
        status,
        &text,
        message,
        retry_after,
    ))
}

/// Finds a JSON value in free text, accepting a ```json fenced block.
pub fn extract_json_value(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```")
            && let Ok(value) = serde_json::from_str(after[..end].trim())
        {
            return Some(value);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

pub(crate) fn format_error_parts(
    message: Option<String>,
    kind: Option<String>,
    code: Option<String>,
) -> String {
    let mut parts = Vec::new();
    if let Some(message) = message
        && !message.trim().is_empty()
    {
        parts.push(message);
    }
    if let Some(kind) = kind
        && !kind.trim().is_empty()
    {
        parts.push(format!("type: {}", kind));
    }
    if let Some(code) = code
        && !code.trim().is_empty()
    {
        parts.push(format!("code: {}", code));
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn model_arg_accepts_provider_and_pair() {
        assert_eq!(
            parse_model_arg("claude").unwrap(),
            ProviderSelection {
                provider: ProviderKind::Claude,
                requested_model: None
            }
        );
        assert_eq!(
            parse_model_arg("openrouter:google/gemini-2.0-flash-exp:free").unwrap(),
            ProviderSelection {
                provider: ProviderKind::OpenRouter,
                requested_model: Some("google/gemini-2.0-flash-exp:free".to_string())
            }
        );
        assert!(parse_model_arg("mystery-model").is_err());
    }

    #[test]
    fn configured_provider_is_used_without_model_arg() {
        let selection = resolve_provider_selection(None, Some("anthropic")).unwrap();
        assert_eq!(selection.provider, ProviderKind::Claude);
        assert!(resolve_provider_selection(None, Some("nope")).is_err());
    }

    #[test]
    fn explicit_key_wins() {
        assert_eq!(
            resolve_key(ProviderKind::OpenAI, Some("sk-test")).unwrap(),
            "sk-test"
        );
    }

    #[test]
    fn conversation_merges_system_turns_and_replaces_tools() {
        let mut conversation = Conversation::default();
        assert_eq!(conversation.system_prompt(), None);
        conversation.push_system(" Translate. ".to_string());
        conversation.push_system(String::new());
        conversation.push_system("Keep ids.".to_string());
        assert_eq!(
            conversation.system_prompt().as_deref(),
            Some("Translate.\n\nKeep ids.")
        );

        let tool = |description: &str| ToolSpec {
            name: "deliver_translations".to_string(),
            description: description.to_string(),
            parameters: json!({}),
        };
        conversation.register(tool("first"));
        conversation.register(tool("second"));
        let found = conversation.tool("openai", "deliver_translations").unwrap();
        assert_eq!(found.description, "second");
        assert!(matches!(
            conversation.tool("openai", "missing"),
            Err(ServiceError::Malformed { .. })
        ));
    }

    #[test]
    fn json_is_found_in_fenced_text() {
        let text = "Here you go:\n```json\n{\"translations\": []}\n```";
        assert_eq!(extract_json_value(text), Some(json!({"translations": []})));
        let bare = "Sure. {\"translations\": [{\"id\": \"a\"}]} Done.";
        assert_eq!(
            extract_json_value(bare),
            Some(json!({"translations": [{"id": "a"}]}))
        );
        assert_eq!(extract_json_value("no json here"), None);
    }
}
