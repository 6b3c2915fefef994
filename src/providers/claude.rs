use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Conversation, Provider, ProviderFuture, ProviderResponse, ProviderUsage, ToolSpec,
    extract_json_value, format_error_parts, send,
};
use crate::error::ServiceError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
pub(crate) const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;
const LABEL: &str = "claude";

#[derive(Debug, Clone)]
pub struct Claude {
    key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
    conversation: Conversation,
}

impl Claude {
    pub fn new(key: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
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

    /// Full messages endpoint, not a base path.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        if !base_url.trim().is_empty() {
            self.base_url = base_url;
        }
        self
    }

    fn request_body<'a>(&'a self, tool: &'a ToolSpec) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: self.conversation.system_prompt(),
            messages: self
                .conversation
                .user_turns()
                .iter()
                .map(|text| UserTurn {
                    role: "user",
                    content: [TextPart { kind: "text", text }],
                })
                .collect(),
            tools: [ToolDefinition {
                name: &tool.name,
                description: &tool.description,
                input_schema: &tool.parameters,
            }],
            tool_choice: ForcedTool {
                kind: "tool",
                name: &tool.name,
            },
        }
    }
}

impl Provider for Claude {
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
            let tool = self.conversation.tool(LABEL, &tool_name)?;
            let body = self.request_body(tool);
            let request = self
                .client
                .post(&self.base_url)
                .header("x-api-key", &self.key)
                .header("anthropic-version", API_VERSION)
                .json(&body);
            let text = send(LABEL, request, extract_claude_error).await?;
            extract_tool_response(&text, &tool_name, &self.model).map_err(|err| {
                ServiceError::Malformed {
                    provider: LABEL,
                    message: format!("{:#}", err),
                }
            })
        })
    }
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: MessagesResponse =
        serde_json::from_str(text).context("failed to parse Claude response JSON")?;
    if payload.stop_reason.as_deref() == Some("max_tokens") {
        return Err(anyhow!("response stopped at max_tokens"));
    }

    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage
            .input_tokens
            .zip(usage.output_tokens)
            .map(|(input, output)| input + output),
    });

    let mut content = payload.content;
    let tool_use = content
        .iter()
        .position(|block| block.kind == "tool_use" && block.name.as_deref() == Some(tool_name));
    let args = match tool_use {
        Some(index) => content
            .swap_remove(index)
            .input
            .ok_or_else(|| anyhow!("tool_use block has no input"))?,
        None => content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .find_map(extract_json_value)
            .ok_or_else(|| anyhow!("no tool call returned from Claude"))?,
    };
    Ok(ProviderResponse { args, model, usage })
}

fn extract_claude_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Envelope {
        error: Option<ApiError>,
    }

    #[derive(Deserialize)]
    struct ApiError {
        #[serde(rename = "type")]
        kind: Option<String>,
        message: Option<String>,
    }

    let error = serde_json::from_str::<Envelope>(body).ok()?.error?;
    Some(format_error_parts(error.message, error.kind, None))
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<UserTurn<'a>>,
    tools: [ToolDefinition<'a>; 1],
    tool_choice: ForcedTool<'a>,
}

#[derive(Debug, Serialize)]
struct UserTurn<'a> {
    role: &'static str,
    content: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ToolDefinition<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Serialize)]
struct ForcedTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    name: Option<String>,
    input: Option<Value>,
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_json_snapshot;
    use serde_json::json;

    const FIXTURE: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/claude_tool_response.json"
    ));

    #[test]
    fn claude_extract_tool_args_snapshot() {
        let response =
            extract_tool_response(FIXTURE, "deliver_translations", "claude-3-5-sonnet-latest")
                .unwrap();
        assert_json_snapshot!(response);
    }

    #[test]
    fn max_tokens_stop_is_an_error() {
        let payload = FIXTURE.replace(
            "\"stop_reason\": \"tool_use\"",
            "\"stop_reason\": \"max_tokens\"",
        );
        let err = extract_tool_response(&payload, "deliver_translations", DEFAULT_MODEL)
            .unwrap_err();
        assert!(err.to_string().contains("max_tokens"));
    }

    #[test]
    fn text_reply_with_json_is_accepted() {
        let payload = json!({
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "```json\n{\"translations\": []}\n```"}],
            "stop_reason": "end_turn"
        })
        .to_string();
        let response =
            extract_tool_response(&payload, "deliver_translations", DEFAULT_MODEL).unwrap();
        assert_eq!(response.args, json!({"translations": []}));
        assert!(response.usage.is_none());
    }

    #[test]
    fn system_turns_go_to_the_top_level_field() {
        let tool = ToolSpec {
            name: "deliver_translations".to_string(),
            description: "Return translations".to_string(),
            parameters: json!({"type": "object"}),
        };
        let provider = Claude::new("key", reqwest::Client::new())
            .append_system_input("Translate.".to_string())
            .append_user_input("[]".to_string())
            .register_tool(tool.clone());
        let body = serde_json::to_value(provider.request_body(&tool)).unwrap();
        assert_eq!(body["system"], "Translate.");
        assert_eq!(
            body["messages"],
            json!([{"role": "user", "content": [{"type": "text", "text": "[]"}]}])
        );
        assert_eq!(body["tool_choice"], json!({"type": "tool", "name": "deliver_translations"}));

        let bare = Claude::new("key", reqwest::Client::new()).register_tool(tool.clone());
        let body = serde_json::to_value(bare.request_body(&tool)).unwrap();
        assert!(body.get("system").is_none());
    }

    #[test]
    fn overloaded_error_is_summarized() {
        let body = r#"{"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}"#;
        assert_eq!(
            extract_claude_error(body).unwrap(),
            "Overloaded | type: overloaded_error"
        );
    }
}
