// OpenAI-compatible adapter using reqwest + SSE streaming.
// One implementation serves every chat-completions backend (OpenAI, Groq,
// Cerebras, Mistral, local Ollama); a profile fixes the per-backend
// differences: base URL, key requirement, forced tool choice, route prefix.

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::provider::{
    AdapterCapabilities, AssistantToolCall, ChatMessage, ChunkEvent, ProviderAdapter,
    ProviderError, RawChunkStream, Role, RoundRequest, RoundResponse, TokenUsage, ToolChoice,
    ToolSpec,
};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";
const CEREBRAS_API_BASE: &str = "https://api.cerebras.ai/v1";
const MISTRAL_API_BASE: &str = "https://api.mistral.ai/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Per-backend knobs for the shared chat-completions implementation.
#[derive(Debug, Clone)]
pub struct CompatProfile {
    pub id: &'static str,
    pub base_url: String,
    pub supports_forced_tool_choice: bool,
    pub detects_duplicate_tool_calls: bool,
    pub requires_api_key: bool,
    pub model_prefix: Option<&'static str>,
    /// Newer OpenAI models take `max_completion_tokens`; the rest of the
    /// family still uses `max_tokens`.
    pub uses_max_completion_tokens: bool,
}

/// Adapter for every OpenAI-compatible chat-completions backend.
pub struct OpenAiCompatible {
    client: reqwest::Client,
    profile: CompatProfile,
}

impl OpenAiCompatible {
    pub fn new(profile: CompatProfile) -> Self {
        Self {
            client: reqwest::Client::new(),
            profile,
        }
    }

    pub fn openai() -> Self {
        Self::new(CompatProfile {
            id: "openai",
            base_url: OPENAI_API_BASE.to_string(),
            supports_forced_tool_choice: true,
            detects_duplicate_tool_calls: false,
            requires_api_key: true,
            model_prefix: None,
            uses_max_completion_tokens: true,
        })
    }

    pub fn groq() -> Self {
        Self::new(CompatProfile {
            id: "groq",
            base_url: GROQ_API_BASE.to_string(),
            supports_forced_tool_choice: false,
            detects_duplicate_tool_calls: false,
            requires_api_key: true,
            model_prefix: Some("groq/"),
            uses_max_completion_tokens: false,
        })
    }

    pub fn cerebras() -> Self {
        Self::new(CompatProfile {
            id: "cerebras",
            base_url: CEREBRAS_API_BASE.to_string(),
            supports_forced_tool_choice: false,
            detects_duplicate_tool_calls: true,
            requires_api_key: true,
            model_prefix: Some("cerebras/"),
            uses_max_completion_tokens: false,
        })
    }

    pub fn mistral() -> Self {
        Self::new(CompatProfile {
            id: "mistral",
            base_url: MISTRAL_API_BASE.to_string(),
            supports_forced_tool_choice: true,
            detects_duplicate_tool_calls: false,
            requires_api_key: true,
            model_prefix: None,
            uses_max_completion_tokens: false,
        })
    }

    /// Local Ollama daemon through its OpenAI-compatible surface. Base URL
    /// comes from `OLLAMA_URL`.
    pub fn ollama() -> Self {
        let base = std::env::var("OLLAMA_URL").unwrap_or_else(|_| OLLAMA_DEFAULT_URL.to_string());
        Self::new(CompatProfile {
            id: "ollama",
            base_url: format!("{}/v1", base.trim_end_matches('/')),
            supports_forced_tool_choice: false,
            detects_duplicate_tool_calls: false,
            requires_api_key: false,
            model_prefix: Some("ollama/"),
            uses_max_completion_tokens: false,
        })
    }

    fn require_key<'a>(&self, round: &'a RoundRequest) -> Result<Option<&'a str>, ProviderError> {
        match round.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(Some(key)),
            _ if self.profile.requires_api_key => Err(ProviderError::Config(format!(
                "API key is required for {}",
                self.profile.id
            ))),
            _ => Ok(None),
        }
    }

    fn build_request(&self, round: &RoundRequest, stream: bool) -> ChatCompletionRequest {
        let messages = round.messages.iter().map(convert_message).collect();
        let tools = if round.tools.is_empty() {
            None
        } else {
            Some(round.tools.iter().map(convert_tool).collect())
        };

        let tool_choice = match (&round.tool_choice, tools.is_some()) {
            (_, false) => None,
            (ToolChoice::Auto, true) => Some(serde_json::json!("auto")),
            (ToolChoice::None, true) => Some(serde_json::json!("none")),
            (ToolChoice::Tool(name), true) => {
                if self.profile.supports_forced_tool_choice {
                    Some(serde_json::json!({
                        "type": "function",
                        "function": {"name": name}
                    }))
                } else {
                    // Backend has no forced selection; degrade to auto
                    Some(serde_json::json!("auto"))
                }
            }
        };

        let response_format = round.response_format.as_ref().map(|format| {
            serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format.name,
                    "strict": format.strict,
                    "schema": format.schema,
                }
            })
        });

        let (max_tokens, max_completion_tokens) = if self.profile.uses_max_completion_tokens {
            (None, round.max_tokens)
        } else {
            (round.max_tokens, None)
        };

        ChatCompletionRequest {
            model: round.model.clone(),
            messages,
            temperature: round.temperature,
            max_tokens,
            max_completion_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            tools,
            tool_choice,
            response_format,
            reasoning_effort: round.reasoning_effort.clone(),
            verbosity: round.verbosity.clone(),
        }
    }

    async fn post(
        &self,
        round: &RoundRequest,
        body: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_key = self.require_key(round)?;

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.profile.base_url))
            .header("Content-Type", "application/json");
        if let Some(key) = api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.json(body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::http(
                status,
                format!("{}: {}", self.profile.id, text),
            ));
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiCompatible {
    fn id(&self) -> &'static str {
        self.profile.id
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_forced_tool_choice: self.profile.supports_forced_tool_choice,
            streams_with_tools: true,
            detects_duplicate_tool_calls: self.profile.detects_duplicate_tool_calls,
            tools_with_response_format: true,
            requires_api_key: self.profile.requires_api_key,
            model_prefix: self.profile.model_prefix,
        }
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        // Only the local daemon benefits from a reachability probe; remote
        // backends are validated per request.
        if self.profile.id != "ollama" {
            return Ok(());
        }
        let url = format!("{}/models", self.profile.base_url);
        match self.client.get(&url).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                log::warn!("ollama daemon not reachable at {}: {}", url, err);
                Ok(())
            }
        }
    }

    async fn chat(&self, round: &RoundRequest) -> Result<RoundResponse, ProviderError> {
        let body = self.build_request(round, false);
        let response = self.post(round, &body).await?;
        let parsed: ChatCompletionResponse = response.json().await?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::api(format!("{}: empty choices", self.profile.id)))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| AssistantToolCall {
                id: call.id,
                name: call.function.name,
                arguments: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::Object(Default::default())),
            })
            .collect();

        Ok(RoundResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            finish_reason: choice.finish_reason,
        })
    }

    async fn open_stream(&self, round: &RoundRequest) -> Result<RawChunkStream, ProviderError> {
        let body = self.build_request(round, true);
        let response = self.post(round, &body).await?;

        let event_stream = response.bytes_stream().eventsource();
        let backend = self.profile.id;

        let chunks = async_stream::stream! {
            futures::pin_mut!(event_stream);
            while let Some(event_result) = event_stream.next().await {
                match event_result {
                    Ok(event) => {
                        if event.data == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<serde_json::Value>(&event.data) {
                            Ok(value) => yield Ok(value),
                            Err(err) => {
                                yield Err(ProviderError::Stream(format!(
                                    "{}: failed to parse chunk: {}",
                                    backend, err
                                )));
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        yield Err(ProviderError::Stream(format!(
                            "{}: stream error: {}",
                            backend, err
                        )));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(chunks))
    }

    fn decode_chunk(&self, chunk: &serde_json::Value) -> ChunkEvent {
        let choices = chunk.get("choices").and_then(|c| c.as_array());
        let first = choices.and_then(|c| c.first());

        let text = first
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|t| t.as_str())
            .map(String::from);

        let tool_call = first
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("tool_calls"))
            .map(|t| !t.is_null())
            .unwrap_or(false);

        // Usage arrives in a trailing chunk with an empty choices array
        let usage = chunk.get("usage").filter(|u| !u.is_null()).map(|u| {
            TokenUsage::new(
                u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                u.get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            )
        });

        ChunkEvent {
            text,
            usage,
            tool_call,
        }
    }
}

// ============================== Wire types ==============================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbosity: Option<String>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Clone)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String, // Always "function"
    function: WireFunction,
}

#[derive(Debug, Serialize, Clone)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "role")]
enum WireMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    #[serde(rename = "tool")]
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String, // Always "function"
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireFunctionCall {
    name: String,
    arguments: String, // JSON string
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize, Clone)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    #[allow(dead_code)]
    total_tokens: u64,
}

fn convert_message(msg: &ChatMessage) -> WireMessage {
    match msg.role {
        Role::System => WireMessage::System {
            content: msg.content.clone().unwrap_or_default(),
        },
        Role::User => WireMessage::User {
            content: msg.content.clone().unwrap_or_default(),
        },
        Role::Assistant => {
            let tool_calls = msg.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|tc| WireToolCall {
                        id: tc.id.clone(),
                        tool_type: "function".to_string(),
                        function: WireFunctionCall {
                            name: tc.name.clone(),
                            arguments: serde_json::to_string(&tc.arguments).unwrap_or_default(),
                        },
                    })
                    .collect()
            });
            WireMessage::Assistant {
                content: msg.content.clone(),
                tool_calls,
            }
        }
        Role::Tool => WireMessage::Tool {
            content: msg.content.clone().unwrap_or_default(),
            tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
        },
    }
}

fn convert_tool(tool: &ToolSpec) -> WireTool {
    WireTool {
        tool_type: "function".to_string(),
        function: WireFunction {
            name: tool.id.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        },
    }
}
