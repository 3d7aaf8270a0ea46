// Anthropic adapter using reqwest + SSE streaming against the native
// messages API. Supports forced tool selection and tool_use/tool_result
// content blocks; structured output is not part of this API surface and is
// dropped with a warning when requested.

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::provider::{
    AdapterCapabilities, AssistantToolCall, ChatMessage, ChunkEvent, ProviderAdapter,
    ProviderError, RawChunkStream, Role, RoundRequest, RoundResponse, TokenUsage, ToolChoice,
    ToolSpec,
};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn build_request(&self, round: &RoundRequest, stream: bool) -> CreateMessageRequest {
        if round.response_format.is_some() {
            log::warn!("anthropic: response_format is not supported, dropping");
        }

        let (messages, system) = convert_messages(&round.messages);

        let tools = if round.tools.is_empty() {
            None
        } else {
            Some(round.tools.iter().map(convert_tool).collect())
        };

        let tool_choice = tools.as_ref().map(|_| match &round.tool_choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::None => json!({"type": "none"}),
            ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
        });

        CreateMessageRequest {
            model: round.model.clone(),
            max_tokens: round.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: round.temperature,
            stream: Some(stream),
            tools,
            tool_choice,
        }
    }

    async fn post(
        &self,
        round: &RoundRequest,
        body: &CreateMessageRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_key = round
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::Config("API key is required for anthropic".into()))?;

        let response = self
            .client
            .post(format!("{}/messages", ANTHROPIC_API_BASE))
            .header("Content-Type", "application/json")
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::http(status, format!("anthropic: {}", text)));
        }

        Ok(response)
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &'static str {
        "anthropic"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_forced_tool_choice: true,
            streams_with_tools: true,
            detects_duplicate_tool_calls: false,
            tools_with_response_format: false,
            requires_api_key: true,
            model_prefix: None,
        }
    }

    async fn chat(&self, round: &RoundRequest) -> Result<RoundResponse, ProviderError> {
        let body = self.build_request(round, false);
        let response = self.post(round, &body).await?;
        let parsed: CreateMessageResponse = response.json().await?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ResponseBlock::Text { text } => content.push_str(&text),
                ResponseBlock::ToolUse { id, name, input } => {
                    tool_calls.push(AssistantToolCall {
                        id,
                        name,
                        arguments: input,
                    });
                }
                ResponseBlock::Other => {}
            }
        }

        Ok(RoundResponse {
            content,
            tool_calls,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
            finish_reason: parsed.stop_reason,
        })
    }

    async fn open_stream(&self, round: &RoundRequest) -> Result<RawChunkStream, ProviderError> {
        let body = self.build_request(round, true);
        let response = self.post(round, &body).await?;

        let event_stream = response.bytes_stream().eventsource();

        // message_start carries the prompt token count, message_delta the
        // completion count; merge them so the decoder sees one usage report.
        let chunks = async_stream::stream! {
            futures::pin_mut!(event_stream);
            let mut prompt_tokens: u64 = 0;

            while let Some(event_result) = event_stream.next().await {
                match event_result {
                    Ok(event) => {
                        if event.event == "message_stop" {
                            break;
                        }
                        if event.data.trim().is_empty() {
                            continue;
                        }
                        let data: serde_json::Value = match serde_json::from_str(&event.data) {
                            Ok(v) => v,
                            Err(err) => {
                                yield Err(ProviderError::Stream(format!(
                                    "anthropic: failed to parse chunk: {}",
                                    err
                                )));
                                break;
                            }
                        };

                        if event.event == "message_start" {
                            prompt_tokens = data
                                .pointer("/message/usage/input_tokens")
                                .and_then(|v| v.as_u64())
                                .unwrap_or(0);
                        }

                        let mut wrapped = json!({"event": event.event, "data": data});
                        if event.event == "message_delta" {
                            wrapped["data"]["usage"]["input_tokens"] = json!(prompt_tokens);
                        }
                        yield Ok(wrapped);
                    }
                    Err(err) => {
                        yield Err(ProviderError::Stream(format!(
                            "anthropic: stream error: {}",
                            err
                        )));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(chunks))
    }

    fn decode_chunk(&self, chunk: &serde_json::Value) -> ChunkEvent {
        let event = chunk.get("event").and_then(|e| e.as_str()).unwrap_or("");
        let data = chunk.get("data").cloned().unwrap_or_default();

        match event {
            "content_block_delta" => ChunkEvent {
                text: data
                    .pointer("/delta/text")
                    .and_then(|t| t.as_str())
                    .map(String::from),
                usage: None,
                tool_call: false,
            },
            "content_block_start" => ChunkEvent {
                text: None,
                usage: None,
                tool_call: data.pointer("/content_block/type").and_then(|t| t.as_str())
                    == Some("tool_use"),
            },
            "message_delta" => ChunkEvent {
                text: None,
                usage: Some(TokenUsage::new(
                    data.pointer("/usage/input_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                    data.pointer("/usage/output_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                )),
                tool_call: false,
            },
            _ => ChunkEvent::default(),
        }
    }
}

/// Fold the common message sequence into Anthropic's shape: the first system
/// message becomes the top-level `system` field, tool results become
/// tool_result blocks in user messages, and consecutive tool results are
/// grouped into a single user turn.
fn convert_messages(history: &[ChatMessage]) -> (Vec<WireMessage>, Option<String>) {
    let mut messages: Vec<WireMessage> = Vec::new();
    let mut system: Option<String> = None;
    let mut pending_results: Vec<WireBlock> = Vec::new();

    let flush_results = |messages: &mut Vec<WireMessage>, pending: &mut Vec<WireBlock>| {
        if !pending.is_empty() {
            messages.push(WireMessage {
                role: "user".to_string(),
                content: WireContent::Blocks(std::mem::take(pending)),
            });
        }
    };

    for msg in history {
        match msg.role {
            Role::System => {
                if system.is_none() {
                    system = msg.content.clone();
                }
            }
            Role::User => {
                flush_results(&mut messages, &mut pending_results);
                messages.push(WireMessage {
                    role: "user".to_string(),
                    content: WireContent::Text(msg.content.clone().unwrap_or_default()),
                });
            }
            Role::Assistant => {
                flush_results(&mut messages, &mut pending_results);
                let mut blocks = Vec::new();
                if let Some(text) = msg.content.as_ref().filter(|c| !c.is_empty()) {
                    blocks.push(WireBlock::Text { text: text.clone() });
                }
                if let Some(calls) = &msg.tool_calls {
                    for call in calls {
                        blocks.push(WireBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.arguments.clone(),
                        });
                    }
                }
                if !blocks.is_empty() {
                    messages.push(WireMessage {
                        role: "assistant".to_string(),
                        content: WireContent::Blocks(blocks),
                    });
                }
            }
            Role::Tool => {
                if let Some(call_id) = &msg.tool_call_id {
                    pending_results.push(WireBlock::ToolResult {
                        tool_use_id: call_id.clone(),
                        content: msg.content.clone().unwrap_or_default(),
                    });
                }
            }
        }
    }
    flush_results(&mut messages, &mut pending_results);

    (messages, system)
}

fn convert_tool(tool: &ToolSpec) -> WireToolDef {
    WireToolDef {
        name: tool.id.clone(),
        description: Some(tool.description.clone()),
        input_schema: tool.parameters.clone(),
    }
}

// ============================== Wire types ==============================

#[derive(Debug, Serialize)]
struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum WireBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct WireToolDef {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CreateMessageResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round(tool_choice: ToolChoice) -> RoundRequest {
        RoundRequest {
            model: "claude-sonnet-4-20250514".into(),
            api_key: Some("key".into()),
            messages: vec![
                ChatMessage::system("You are terse."),
                ChatMessage::user("hello"),
            ],
            tools: vec![ToolSpec::new(
                "search",
                "Search documentation",
                json!({"type": "object"}),
            )],
            tool_choice,
            response_format: None,
            temperature: None,
            max_tokens: None,
            reasoning_effort: None,
            verbosity: None,
        }
    }

    #[test]
    fn test_system_prompt_lifted_to_top_level() {
        let adapter = AnthropicAdapter::new();
        let body = adapter.build_request(&round(ToolChoice::Auto), false);
        assert_eq!(body.system.as_deref(), Some("You are terse."));
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_forced_tool_choice_wire_shape() {
        let adapter = AnthropicAdapter::new();
        let body = adapter.build_request(&round(ToolChoice::Tool("search".into())), false);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["tool_choice"]["type"], "tool");
        assert_eq!(value["tool_choice"]["name"], "search");
        assert_eq!(value["tools"][0]["name"], "search");
        assert!(value["tools"][0].get("input_schema").is_some());
    }

    #[test]
    fn test_consecutive_tool_results_grouped_into_one_turn() {
        let history = vec![
            ChatMessage::user("go"),
            ChatMessage::assistant_tool_calls(vec![
                AssistantToolCall {
                    id: "a".into(),
                    name: "one".into(),
                    arguments: json!({}),
                },
                AssistantToolCall {
                    id: "b".into(),
                    name: "two".into(),
                    arguments: json!({}),
                },
            ]),
            ChatMessage::tool("a", "ra"),
            ChatMessage::tool("b", "rb"),
        ];
        let (messages, _) = convert_messages(&history);
        assert_eq!(messages.len(), 3);
        let last = serde_json::to_value(&messages[2]).unwrap();
        assert_eq!(last["role"], "user");
        assert_eq!(last["content"].as_array().unwrap().len(), 2);
        assert_eq!(last["content"][0]["type"], "tool_result");
        assert_eq!(last["content"][1]["tool_use_id"], "b");
    }

    #[test]
    fn test_decode_chunk_events() {
        let adapter = AnthropicAdapter::new();

        let delta = json!({
            "event": "content_block_delta",
            "data": {"delta": {"type": "text_delta", "text": "hi"}}
        });
        assert_eq!(adapter.decode_chunk(&delta).text.as_deref(), Some("hi"));

        let tool_start = json!({
            "event": "content_block_start",
            "data": {"content_block": {"type": "tool_use", "name": "search"}}
        });
        assert!(adapter.decode_chunk(&tool_start).tool_call);

        let usage = json!({
            "event": "message_delta",
            "data": {"usage": {"input_tokens": 12, "output_tokens": 5}}
        });
        assert_eq!(
            adapter.decode_chunk(&usage).usage,
            Some(TokenUsage::new(12, 5))
        );
    }
}
