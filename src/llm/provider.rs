use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Core Trait
// ============================================================================

/// Unified interface over one remote LLM backend.
///
/// An adapter translates the engine's round requests into the backend's wire
/// format and parses the backend's responses back into the common shape. The
/// multi-round tool-calling loop lives in [`crate::llm::engine`]; adapters
/// only ever see a single round-trip at a time.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable backend identifier used by the registry (e.g. `"openai"`).
    fn id(&self) -> &'static str;

    /// Static description of what this backend can and cannot do.
    fn capabilities(&self) -> AdapterCapabilities;

    /// One-time setup (endpoint probing, credential sanity). Optional.
    async fn initialize(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// One non-streaming round-trip.
    async fn chat(&self, round: &RoundRequest) -> Result<RoundResponse, ProviderError>;

    /// Open a streaming round-trip and return the raw chunk stream. Each item
    /// is one backend-shaped JSON object; [`ProviderAdapter::decode_chunk`]
    /// interprets it so the normaliser stays backend-agnostic.
    async fn open_stream(&self, round: &RoundRequest) -> Result<RawChunkStream, ProviderError>;

    /// Decode one raw chunk into the normalised event shape.
    fn decode_chunk(&self, chunk: &serde_json::Value) -> ChunkEvent;
}

/// What a backend supports. The loop engine consults this instead of matching
/// on adapter ids.
#[derive(Debug, Clone, Copy)]
pub struct AdapterCapabilities {
    /// Backend honours an explicit `{type: function, function: {name}}` tool
    /// choice. When false, forced selections degrade to auto.
    pub supports_forced_tool_choice: bool,
    /// Backend can carry function calls reliably inside a stream. When
    /// false, the final post-tools round is issued without tools declared.
    pub streams_with_tools: bool,
    /// Backend is known to re-issue identical tool calls; the engine keeps a
    /// signature set and breaks the loop on a repeat.
    pub detects_duplicate_tool_calls: bool,
    /// Backend accepts a JSON-schema response format alongside tools. When
    /// false the format is dropped (with a warning) whenever tools are sent.
    pub tools_with_response_format: bool,
    /// Requests without an API key fail before any network I/O.
    pub requires_api_key: bool,
    /// Route prefix stripped from incoming model ids (e.g. `"groq/"`).
    pub model_prefix: Option<&'static str>,
}

// ============================================================================
// Request Types
// ============================================================================

/// Message role in conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message in conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls made by the assistant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<AssistantToolCall>>,
    /// Correlation id for tool-result messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<AssistantToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Tool call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// How strongly the caller wants a tool invoked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolUsageControl {
    Auto,
    Force,
    None,
}

/// Tool definition for function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub id: String,
    pub description: String,
    /// JSON Schema for the accepted parameters
    pub parameters: serde_json::Value,
    #[serde(default = "ToolSpec::default_usage")]
    pub usage_control: ToolUsageControl,
}

impl ToolSpec {
    fn default_usage() -> ToolUsageControl {
        ToolUsageControl::Auto
    }

    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            parameters,
            usage_control: ToolUsageControl::Auto,
        }
    }

    pub fn forced(mut self) -> Self {
        self.usage_control = ToolUsageControl::Force;
        self
    }
}

/// Structured-output request: a named JSON schema the answer must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: serde_json::Value,
    #[serde(default)]
    pub strict: bool,
}

/// Input to the orchestrator: one logical request against one backend model.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    /// Backend-specific model id, possibly carrying a route prefix
    pub model: String,
    /// Absent for local backends
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    /// Extra user-role context appended after the system prompt
    pub context: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub response_format: Option<ResponseFormat>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
    pub verbosity: Option<String>,
    pub stream: bool,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Tool selection directive for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    /// Suppress tool calls entirely (loop-terminating follow-up)
    None,
    /// Force one named tool (only honoured by backends that support it)
    Tool(String),
}

/// One round-trip as seen by an adapter. The engine has already assembled the
/// message sequence, filtered `usage_control = none` tools and stripped the
/// route prefix from the model id.
#[derive(Debug, Clone)]
pub struct RoundRequest {
    pub model: String,
    pub api_key: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
    pub response_format: Option<ResponseFormat>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
    pub verbosity: Option<String>,
}

/// One parsed round-trip result.
#[derive(Debug, Clone, Default)]
pub struct RoundResponse {
    pub content: String,
    pub tool_calls: Vec<AssistantToolCall>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

// ============================================================================
// Response Types
// ============================================================================

/// Token accounting for one request (or one round when reported per round).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    /// Additive aggregation across round-trips.
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

/// A completed tool invocation as reported to the caller. Failed invocations
/// appear here too; only successful outputs are mirrored into
/// [`ProviderResponse::tool_results`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub success: bool,
}

/// Attribution of one contiguous slice of the request lifetime.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Model,
    Tool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSegment {
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: i64,
}

/// Exhaustive timing report for one request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTiming {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: i64,
    pub model_time: i64,
    pub tools_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_response_time: Option<i64>,
    pub iterations: u32,
    pub time_segments: Vec<TimeSegment>,
}

/// Result of a non-streaming request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub content: String,
    pub model: String,
    pub tokens: TokenUsage,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ExecutedToolCall>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<serde_json::Value>,
    pub timing: ProviderTiming,
}

/// Byte stream of UTF-8 assistant text deltas.
pub type TextDeltaStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Result of a streaming request: the byte stream plus a progressively filled
/// execution record. `content` and the final timing land in `execution` when
/// the stream closes.
pub struct StreamingExecution {
    pub stream: TextDeltaStream,
    pub execution: Arc<Mutex<ProviderResponse>>,
}

/// What the orchestrator hands back: either a complete response or a live
/// stream with its execution record.
pub enum ProviderOutput {
    Complete(ProviderResponse),
    Streaming(StreamingExecution),
}

impl std::fmt::Debug for ProviderOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderOutput::Complete(response) => {
                f.debug_tuple("Complete").field(response).finish()
            }
            ProviderOutput::Streaming(_) => f.debug_tuple("Streaming").finish(),
        }
    }
}

impl ProviderOutput {
    /// Convenience accessor for tests and non-streaming callers.
    pub fn into_complete(self) -> Option<ProviderResponse> {
        match self {
            ProviderOutput::Complete(r) => Some(r),
            ProviderOutput::Streaming(_) => None,
        }
    }
}

// ============================================================================
// Stream Chunk Types
// ============================================================================

/// Raw stream of backend-shaped JSON chunk objects.
pub type RawChunkStream =
    Pin<Box<dyn Stream<Item = Result<serde_json::Value, ProviderError>> + Send>>;

/// Normalised view of one raw chunk, produced by an adapter's decoder.
#[derive(Debug, Clone, Default)]
pub struct ChunkEvent {
    /// Assistant text delta carried by this chunk, if any
    pub text: Option<String>,
    /// Usage report, typically only present on the terminal chunk
    pub usage: Option<TokenUsage>,
    /// A function-call candidate appeared mid-stream; the normaliser closes
    /// early so the engine can fall back to a non-streaming follow-up
    pub tool_call: bool,
}

// ============================================================================
// In-flight Tool Call State
// ============================================================================

/// Lifecycle of a single tool call inside the loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallState {
    Pending,
    Generating,
    Executing,
    Review,
    Success,
    Error,
    Rejected,
    Background,
    Aborted,
}

impl ToolCallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ToolCallState::Success
                | ToolCallState::Error
                | ToolCallState::Rejected
                | ToolCallState::Aborted
        )
    }
}

/// In-flight record for one tool call. Terminal states never regress.
#[derive(Debug, Clone)]
pub struct TrackedToolCall {
    pub id: String,
    pub name: String,
    pub state: ToolCallState,
    pub params: serde_json::Value,
    pub display: Option<String>,
}

impl TrackedToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state: ToolCallState::Pending,
            params,
            display: None,
        }
    }

    /// Move to `next`, unless the current state is terminal. Re-asserting the
    /// same terminal state is a no-op. Returns whether the transition took.
    pub fn advance(&mut self, next: ToolCallState) -> bool {
        if self.state.is_terminal() {
            return self.state == next;
        }
        self.state = next;
        true
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared abort flag for one request. Checked between model rounds and before
/// each tool dispatch; streaming readers are cancelled by dropping the
/// consumer side of the byte stream.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Provider error types
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("API error: {message}")]
    Api {
        status: Option<u16>,
        message: String,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("request aborted")]
    Aborted,
}

impl ProviderError {
    pub fn api(message: impl Into<String>) -> Self {
        ProviderError::Api {
            status: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ProviderError::Api {
            status: Some(status),
            message: format!("HTTP {}: {}", status, message.into()),
        }
    }
}

/// Terminal failure of one request, carrying whatever timing had been
/// accumulated when the error surfaced.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ProviderFailure {
    pub error: ProviderError,
    pub timing: ProviderTiming,
}
