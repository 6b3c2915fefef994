use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Conversation, Provider, ProviderFuture, ProviderResponse, ProviderUsage, ToolSpec,
    extract_json_value, format_error_parts, send,
};
use crate::error::ServiceError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub(crate) const OPENROUTER_DEFAULT_MODEL: &str = "google/gemini-2.0-flash-exp:free";
/// Low but non-zero: terminology stays stable across pages without the
/// degenerate repetition some models show at zero.
const TEMPERATURE: f32 = 0.2;

/// Chat-completions client. Also drives OpenAI-compatible endpoints such as
/// OpenRouter through [`OpenAI::with_base_url`].
#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    base_url: String,
    label: &'static str,
    client: reqwest::Client,
    conversation: Conversation,
}

impl OpenAI {
    pub fn new(key: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            label: "openai",
            client,
            conversation: Conversation::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        if !base_url.trim().is_empty() {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        self
    }

    pub(crate) fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    fn request_body<'a>(&'a self, tool: &'a ToolSpec) -> ChatRequest<'a> {
        let mut messages = Vec::new();
        if let Some(system) = self.conversation.system_prompt() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(self.conversation.user_turns().iter().map(|text| ChatMessage {
            role: "user",
            content: text.clone(),
        }));
        ChatRequest {
            model: &self.model,
            temperature: TEMPERATURE,
            messages,
            tools: vec![ChatTool {
                kind: "function",
                function: FunctionSpec {
                    name: &tool.name,
                    description: &tool.description,
                    parameters: &tool.parameters,
                },
            }],
            tool_choice: ToolChoice {
                kind: "function",
                function: ToolChoiceName { name: &tool.name },
            },
        }
    }
}

impl Provider for OpenAI {
    fn append_system_input(mut self, input: String) -> Self {
        self.conversation.push_system(input);
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.conversation.push_user(input);
        self
    }

    fn register_tool(mut self, tool: ToolSpec) -> Self {
        self.conversation.register(tool);
        self
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let label = self.label;
            let tool = self.conversation.tool(label, &tool_name)?;
            let body = self.request_body(tool);
            let request = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.key)
                .json(&body);
            let text = send(label, request, extract_openai_error).await?;
            extract_tool_response(&text, &tool_name, &self.model).map_err(|err| {
                ServiceError::Malformed {
                    provider: label,
                    message: format!("{:#}", err),
                }
            })
        })
    }
}

/// Tool-call arguments from a chat completion, falling back to a JSON object
/// written into the message content when the model ignored the tool.
fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: ChatResponse =
        serde_json::from_str(text).with_context(|| "failed to parse chat completion JSON")?;
    let choice = payload
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no choices returned"))?;
    // arguments cut off mid-list would parse as garbage or lose blocks
    if choice.finish_reason.as_deref() == Some("length") {
        return Err(anyhow!("completion stopped at the token limit"));
    }

    let args = match choice.message.tool_calls.first() {
        Some(call) if call.function.name != tool_name => {
            return Err(anyhow!("unexpected tool name '{}'", call.function.name));
        }
        Some(call) => serde_json::from_str(&call.function.arguments)
            .with_context(|| "failed to parse tool arguments")?,
        None => choice
            .message
            .content
            .as_deref()
            .and_then(extract_json_value)
            .ok_or_else(|| anyhow!("no tool call or JSON content returned"))?,
    };

    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    });
    Ok(ProviderResponse { args, model, usage })
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Envelope {
        error: Option<ApiError>,
    }

    #[derive(Deserialize)]
    struct ApiError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<Value>,
    }

    let error = serde_json::from_str::<Envelope>(body).ok()?.error?;
    let code = error.code.map(|code| match code {
        Value::String(code) => code,
        other => other.to_string(),
    });
    Some(format_error_parts(error.message, error.kind, code))
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage>,
    tools: Vec<ChatTool<'a>>,
    tool_choice: ToolChoice<'a>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionSpec<'a>,
}

#[derive(Debug, Serialize)]
struct FunctionSpec<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Serialize)]
struct ToolChoice<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ToolChoiceName<'a>,
}

#[derive(Debug, Serialize)]
struct ToolChoiceName<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}
