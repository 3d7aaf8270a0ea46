// Google Gemini adapter using reqwest against the native generateContent
// API. The API key travels as a `?key=` query parameter. Streaming uses
// `:streamGenerateContent`, which frames the response as a JSON array of
// objects rather than SSE; a brace-balanced scanner cuts the byte stream
// into complete objects, handling string escapes.
//
// Function calls cannot be carried reliably mid-stream, so the loop engine
// keeps Gemini rounds non-streaming while tools are declared and only the
// final post-tools answer is streamed.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::helpers::sanitize_schema;
use super::provider::{
    AdapterCapabilities, AssistantToolCall, ChatMessage, ChunkEvent, ProviderAdapter,
    ProviderError, RawChunkStream, Role, RoundRequest, RoundResponse, TokenUsage, ToolChoice,
    ToolSpec,
};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiAdapter {
    client: reqwest::Client,
    /// functionCall parts carry no id; synthesized ids map back to the
    /// function name so tool results can be converted to functionResponse
    /// parts on the next round.
    call_names: RwLock<HashMap<String, String>>,
    call_counter: AtomicU64,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            call_names: RwLock::new(HashMap::new()),
            call_counter: AtomicU64::new(1),
        }
    }

    fn next_call_id(&self, name: &str) -> String {
        let idx = self.call_counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("gemini_call_{}", idx);
        if let Ok(mut map) = self.call_names.write() {
            map.insert(id.clone(), name.to_string());
        }
        id
    }

    fn function_name_for(&self, call_id: &str) -> String {
        self.call_names
            .read()
            .ok()
            .and_then(|m| m.get(call_id).cloned())
            .unwrap_or_else(|| "tool".to_string())
    }

    fn build_request(&self, round: &RoundRequest) -> GenerateContentRequest {
        let (contents, system_instruction) = self.convert_messages(&round.messages);

        let tools = if round.tools.is_empty() {
            None
        } else {
            Some(vec![GeminiTool {
                function_declarations: round.tools.iter().map(convert_tool).collect(),
            }])
        };

        let tool_config = tools.as_ref().map(|_| {
            let (mode, allowed) = match &round.tool_choice {
                ToolChoice::Auto => ("AUTO", None),
                ToolChoice::None => ("NONE", None),
                ToolChoice::Tool(name) => ("ANY", Some(vec![name.clone()])),
            };
            GeminiToolConfig {
                function_calling_config: GeminiFunctionCallingConfig {
                    mode: mode.to_string(),
                    allowed_function_names: allowed,
                },
            }
        });

        // The API rejects responseSchema alongside function declarations
        let (response_mime_type, response_schema) = match (&round.response_format, &tools) {
            (Some(format), None) => (
                Some("application/json".to_string()),
                Some(sanitize_schema(&format.schema)),
            ),
            (Some(_), Some(_)) => {
                log::warn!("gemini: response_format cannot be combined with tools, dropping");
                (None, None)
            }
            (None, _) => (None, None),
        };

        GenerateContentRequest {
            contents,
            tools,
            tool_config,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                temperature: round.temperature,
                max_output_tokens: round.max_tokens,
                response_mime_type,
                response_schema,
            }),
        }
    }

    fn convert_messages(
        &self,
        history: &[ChatMessage],
    ) -> (Vec<GeminiContent>, Option<GeminiContent>) {
        let mut contents = Vec::new();
        let mut system_instruction: Option<GeminiContent> = None;

        for msg in history {
            match msg.role {
                Role::System => {
                    if system_instruction.is_none() {
                        system_instruction = Some(GeminiContent {
                            role: None,
                            parts: vec![GeminiPart {
                                text: msg.content.clone(),
                                ..Default::default()
                            }],
                        });
                    }
                }
                Role::User => {
                    contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![GeminiPart {
                            text: msg.content.clone(),
                            ..Default::default()
                        }],
                    });
                }
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if let Some(text) = msg.content.as_ref().filter(|c| !c.is_empty()) {
                        parts.push(GeminiPart {
                            text: Some(text.clone()),
                            ..Default::default()
                        });
                    }
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            parts.push(GeminiPart {
                                function_call: Some(GeminiFunctionCall {
                                    name: call.name.clone(),
                                    args: call.arguments.clone(),
                                }),
                                ..Default::default()
                            });
                        }
                    }
                    if !parts.is_empty() {
                        contents.push(GeminiContent {
                            role: Some("model".to_string()),
                            parts,
                        });
                    }
                }
                Role::Tool => {
                    if let Some(call_id) = &msg.tool_call_id {
                        let name = self.function_name_for(call_id);
                        let response = msg
                            .content
                            .as_deref()
                            .map(parse_tool_response_json)
                            .unwrap_or_else(|| json!({}));
                        contents.push(GeminiContent {
                            role: Some("user".to_string()),
                            parts: vec![GeminiPart {
                                function_response: Some(GeminiFunctionResponse { name, response }),
                                ..Default::default()
                            }],
                        });
                    }
                }
            }
        }

        (contents, system_instruction)
    }

    fn parse_candidate(&self, response: &GenerateContentResponse) -> RoundResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut finish_reason = None;

        if let Some(candidate) = response
            .candidates
            .as_ref()
            .and_then(|c| c.first())
        {
            finish_reason = candidate.finish_reason.clone();
            if let Some(candidate_content) = &candidate.content {
                for part in &candidate_content.parts {
                    if let Some(text) = &part.text {
                        content.push_str(text);
                    }
                    if let Some(call) = &part.function_call {
                        let id = self.next_call_id(&call.name);
                        tool_calls.push(AssistantToolCall {
                            id,
                            name: call.name.clone(),
                            arguments: call.args.clone(),
                        });
                    }
                }
            }
        }

        RoundResponse {
            content,
            tool_calls,
            usage: response.usage_metadata.as_ref().map(convert_usage),
            finish_reason,
        }
    }

    async fn post(
        &self,
        round: &RoundRequest,
        method: &str,
        body: &GenerateContentRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_key = round
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::Config("API key is required for google".into()))?;

        let url = format!(
            "{}/models/{}:{}?key={}",
            GEMINI_API_BASE, round.model, method, api_key
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::http(status, format!("gemini: {}", text)));
        }

        Ok(response)
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> &'static str {
        "google"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_forced_tool_choice: true,
            streams_with_tools: false,
            detects_duplicate_tool_calls: false,
            tools_with_response_format: false,
            requires_api_key: true,
            model_prefix: None,
        }
    }

    async fn chat(&self, round: &RoundRequest) -> Result<RoundResponse, ProviderError> {
        let body = self.build_request(round);
        let response = self.post(round, "generateContent", &body).await?;
        let parsed: GenerateContentResponse = response.json().await?;

        let round_response = self.parse_candidate(&parsed);
        if round_response.finish_reason.as_deref() == Some("UNEXPECTED_TOOL_CALL") {
            log::warn!("gemini: UNEXPECTED_TOOL_CALL finish reason, continuing");
        }
        Ok(round_response)
    }

    async fn open_stream(&self, round: &RoundRequest) -> Result<RawChunkStream, ProviderError> {
        let body = self.build_request(round);
        let response = self.post(round, "streamGenerateContent", &body).await?;

        let mut byte_stream = response.bytes_stream();

        let chunks = async_stream::stream! {
            let mut scanner = JsonObjectScanner::new();
            while let Some(piece) = byte_stream.next().await {
                match piece {
                    Ok(bytes) => {
                        for object in scanner.push(&bytes) {
                            match serde_json::from_str::<serde_json::Value>(&object) {
                                Ok(value) => yield Ok(value),
                                Err(err) => {
                                    yield Err(ProviderError::Stream(format!(
                                        "gemini: failed to parse chunk: {}",
                                        err
                                    )));
                                    return;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        yield Err(ProviderError::Stream(format!(
                            "gemini: stream error: {}",
                            err
                        )));
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(chunks))
    }

    fn decode_chunk(&self, chunk: &serde_json::Value) -> ChunkEvent {
        let parts = chunk
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array());

        let mut text = String::new();
        let mut tool_call = false;
        if let Some(parts) = parts {
            for part in parts {
                if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                    text.push_str(t);
                }
                if part.get("functionCall").is_some() {
                    tool_call = true;
                }
            }
        }

        let usage = chunk.get("usageMetadata").map(|u| {
            TokenUsage::new(
                u.get("promptTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                u.get("candidatesTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            )
        });

        ChunkEvent {
            text: (!text.is_empty()).then_some(text),
            usage,
            tool_call,
        }
    }
}

fn parse_tool_response_json(payload: &str) -> serde_json::Value {
    serde_json::from_str(payload).unwrap_or_else(|_| {
        json!({
            "result": payload
        })
    })
}

fn convert_tool(tool: &ToolSpec) -> GeminiFunctionDeclaration {
    GeminiFunctionDeclaration {
        name: tool.id.clone(),
        description: Some(tool.description.clone()),
        parameters: sanitize_schema(&tool.parameters),
    }
}

fn convert_usage(usage: &UsageMetadata) -> TokenUsage {
    TokenUsage::new(
        usage.prompt_token_count.unwrap_or(0),
        usage.candidates_token_count.unwrap_or(0),
    )
}

// ============================================================================
// Stream framing
// ============================================================================

/// Cuts a streamed JSON array (`[{...},{...},...]`) into complete top-level
/// objects. Brace depth is tracked across chunk boundaries; braces inside
/// strings and escaped quotes are ignored.
pub struct JsonObjectScanner {
    buf: String,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl JsonObjectScanner {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    /// Feed a chunk of bytes; returns every object completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(bytes);
        let mut complete = Vec::new();

        for ch in text.chars() {
            if self.depth == 0 {
                // Between objects: skip array punctuation and whitespace
                if ch == '{' {
                    self.depth = 1;
                    self.buf.push(ch);
                }
                continue;
            }

            self.buf.push(ch);

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if ch == '\\' {
                    self.escaped = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        complete.push(std::mem::take(&mut self.buf));
                    }
                }
                _ => {}
            }
        }

        complete
    }
}

impl Default for JsonObjectScanner {
    fn default() -> Self {
        Self::new()
    }
}

// ============================== Wire types ==============================

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(rename = "toolConfig", skip_serializing_if = "Option::is_none")]
    tool_config: Option<GeminiToolConfig>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(rename = "functionResponse", skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiToolConfig {
    #[serde(rename = "functionCallingConfig")]
    function_calling_config: GeminiFunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionCallingConfig {
    mode: String,
    #[serde(
        rename = "allowedFunctionNames",
        skip_serializing_if = "Option::is_none"
    )]
    allowed_function_names: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(rename = "responseSchema", skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize, Clone)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
}
