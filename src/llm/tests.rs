//! Loop-engine scenarios against a scripted adapter: no network, each test
//! scripts the model's rounds and asserts on the requests the engine built.

use futures::StreamExt;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::engine::{LoopEngine, Orchestrator, MAX_ITERATIONS};
use super::provider::*;
use super::registry::ProviderRegistry;
use crate::tools::{ToolDispatcher, ToolRegistry};

/// Adapter that replays scripted rounds and records every request.
struct ScriptedAdapter {
    caps: AdapterCapabilities,
    rounds: Mutex<VecDeque<RoundResponse>>,
    chat_requests: Mutex<Vec<RoundRequest>>,
    stream_requests: Mutex<Vec<RoundRequest>>,
    stream_chunks: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedAdapter {
    fn new(rounds: Vec<RoundResponse>) -> Self {
        Self {
            caps: AdapterCapabilities {
                supports_forced_tool_choice: true,
                streams_with_tools: true,
                detects_duplicate_tool_calls: false,
                tools_with_response_format: true,
                requires_api_key: false,
                model_prefix: None,
            },
            rounds: Mutex::new(rounds.into()),
            chat_requests: Mutex::new(Vec::new()),
            stream_requests: Mutex::new(Vec::new()),
            stream_chunks: Mutex::new(Vec::new()),
        }
    }

    fn with_caps(mut self, caps: AdapterCapabilities) -> Self {
        self.caps = caps;
        self
    }

    fn with_stream_chunks(self, chunks: Vec<serde_json::Value>) -> Self {
        *self.stream_chunks.lock().unwrap() = chunks;
        self
    }

    fn chat_request(&self, idx: usize) -> RoundRequest {
        self.chat_requests.lock().unwrap()[idx].clone()
    }

    fn chat_count(&self) -> usize {
        self.chat_requests.lock().unwrap().len()
    }

    fn stream_count(&self) -> usize {
        self.stream_requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> &'static str {
        "scripted"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.caps
    }

    async fn chat(&self, round: &RoundRequest) -> Result<RoundResponse, ProviderError> {
        self.chat_requests.lock().unwrap().push(round.clone());
        self.rounds
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::api("script exhausted"))
    }

    async fn open_stream(&self, round: &RoundRequest) -> Result<RawChunkStream, ProviderError> {
        self.stream_requests.lock().unwrap().push(round.clone());
        let chunks: Vec<Result<serde_json::Value, ProviderError>> = self
            .stream_chunks
            .lock()
            .unwrap()
            .clone()
            .into_iter()
            .map(Ok)
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn decode_chunk(&self, chunk: &serde_json::Value) -> ChunkEvent {
        ChunkEvent {
            text: chunk.get("text").and_then(|t| t.as_str()).map(String::from),
            usage: chunk.get("usage").map(|u| {
                TokenUsage::new(
                    u["prompt"].as_u64().unwrap_or(0),
                    u["completion"].as_u64().unwrap_or(0),
                )
            }),
            tool_call: chunk
                .get("tool_call")
                .and_then(|t| t.as_bool())
                .unwrap_or(false),
        }
    }
}

fn tool_call(id: &str, name: &str, args: serde_json::Value) -> AssistantToolCall {
    AssistantToolCall {
        id: id.into(),
        name: name.into(),
        arguments: args,
    }
}

fn content_round(content: &str, usage: Option<TokenUsage>) -> RoundResponse {
    RoundResponse {
        content: content.into(),
        tool_calls: vec![],
        usage,
        finish_reason: Some("stop".into()),
    }
}

fn tool_round(calls: Vec<AssistantToolCall>, usage: Option<TokenUsage>) -> RoundResponse {
    RoundResponse {
        content: String::new(),
        tool_calls: calls,
        usage,
        finish_reason: Some("tool_calls".into()),
    }
}

fn search_registry(counter: Arc<AtomicUsize>) -> Arc<dyn ToolDispatcher> {
    Arc::new(ToolRegistry::new().register("search", move |params| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"hits": [params["q"].as_str().unwrap_or_default()]}))
        }
    }))
}

fn request_with_tools(tools: Vec<ToolSpec>) -> ProviderRequest {
    let mut request = ProviderRequest::new("test-model");
    request.system_prompt = Some("You are a workflow assistant.".into());
    request.messages = vec![ChatMessage::user("run it")];
    request.tools = tools;
    request
}

#[tokio::test]
async fn test_single_tool_round_trip() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        tool_round(
            vec![tool_call("call_1", "search", json!({"q": "x"}))],
            Some(TokenUsage::new(10, 5)),
        ),
        content_round("done", Some(TokenUsage::new(20, 2))),
    ]));
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = LoopEngine::new(adapter.clone(), search_registry(executions.clone()));

    let request = request_with_tools(vec![ToolSpec::new("search", "Search", json!({}))]);
    let response = engine.execute(request).await.unwrap().into_complete().unwrap();

    assert_eq!(response.content, "done");
    assert_eq!(response.tokens, TokenUsage { prompt: 30, completion: 7, total: 37 });
    assert_eq!(response.tool_calls.len(), 1);
    assert!(response.tool_calls[0].success);
    assert_eq!(response.tool_results.len(), 1);
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // Two model segments around one tool segment, strictly ordered
    let timing = &response.timing;
    assert_eq!(timing.iterations, 2);
    let kinds: Vec<SegmentKind> = timing.time_segments.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![SegmentKind::Model, SegmentKind::Tool, SegmentKind::Model]);
    for pair in timing.time_segments.windows(2) {
        assert!(pair[0].end_time <= pair[1].start_time);
    }

    // The follow-up request carried the assistant tool calls and the result
    let follow_up = adapter.chat_request(1);
    let assistant = &follow_up.messages[follow_up.messages.len() - 2];
    assert_eq!(assistant.role, Role::Assistant);
    assert!(assistant.tool_calls.is_some());
    let tool_msg = follow_up.messages.last().unwrap();
    assert_eq!(tool_msg.role, Role::Tool);
    assert!(tool_msg.content.as_ref().unwrap().contains("hits"));
}

#[tokio::test]
async fn test_forced_tools_fire_in_sequence() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        tool_round(vec![tool_call("c1", "a", json!({}))], None),
        tool_round(vec![tool_call("c2", "b", json!({}))], None),
        content_round("after", None),
    ]));
    let tools: Arc<dyn ToolDispatcher> = Arc::new(
        ToolRegistry::new()
            .register("a", |_| async { Ok(json!("ra")) })
            .register("b", |_| async { Ok(json!("rb")) }),
    );
    let engine = LoopEngine::new(adapter.clone(), tools);

    let request = request_with_tools(vec![
        ToolSpec::new("a", "Tool A", json!({})).forced(),
        ToolSpec::new("b", "Tool B", json!({})).forced(),
    ]);
    let response = engine.execute(request).await.unwrap().into_complete().unwrap();
    assert_eq!(response.content, "after");

    assert_eq!(adapter.chat_request(0).tool_choice, ToolChoice::Tool("a".into()));
    assert_eq!(adapter.chat_request(1).tool_choice, ToolChoice::Tool("b".into()));
    // Every forced tool has fired: back to auto for good
    assert_eq!(adapter.chat_request(2).tool_choice, ToolChoice::Auto);
}

#[tokio::test]
async fn test_forced_tools_degrade_without_backend_support() {
    let caps = AdapterCapabilities {
        supports_forced_tool_choice: false,
        streams_with_tools: true,
        detects_duplicate_tool_calls: false,
        tools_with_response_format: true,
        requires_api_key: false,
        model_prefix: None,
    };
    let adapter = Arc::new(
        ScriptedAdapter::new(vec![
            tool_round(vec![tool_call("c1", "a", json!({}))], None),
            content_round("ok", None),
        ])
        .with_caps(caps),
    );
    let tools: Arc<dyn ToolDispatcher> =
        Arc::new(ToolRegistry::new().register("a", |_| async { Ok(json!(1)) }));
    let engine = LoopEngine::new(adapter.clone(), tools);

    let request = request_with_tools(vec![ToolSpec::new("a", "Tool A", json!({})).forced()]);
    engine.execute(request).await.unwrap();

    assert_eq!(adapter.chat_request(0).tool_choice, ToolChoice::Auto);
    assert_eq!(adapter.chat_request(1).tool_choice, ToolChoice::Auto);
}

#[tokio::test]
async fn test_duplicate_signature_forces_terminal_round() {
    let caps = AdapterCapabilities {
        supports_forced_tool_choice: false,
        streams_with_tools: true,
        detects_duplicate_tool_calls: true,
        tools_with_response_format: true,
        requires_api_key: false,
        model_prefix: None,
    };
    let adapter = Arc::new(
        ScriptedAdapter::new(vec![
            tool_round(vec![tool_call("c1", "search", json!({"q": "x"}))], None),
            tool_round(vec![tool_call("c2", "search", json!({"q": "x"}))], None),
            content_round("stopping", None),
        ])
        .with_caps(caps),
    );
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = LoopEngine::new(adapter.clone(), search_registry(executions.clone()));

    let request = request_with_tools(vec![ToolSpec::new("search", "Search", json!({}))]);
    let response = engine.execute(request).await.unwrap().into_complete().unwrap();

    assert_eq!(response.content, "stopping");
    // The identical (name, arguments) pair ran once
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    // After the repeat, the follow-up suppressed tools entirely
    assert_eq!(adapter.chat_request(2).tool_choice, ToolChoice::None);
    let fed_back = adapter.chat_request(2);
    let duplicate_notice = fed_back
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .last()
        .unwrap();
    assert!(duplicate_notice
        .content
        .as_ref()
        .unwrap()
        .contains("Duplicate tool call suppressed"));
}

#[tokio::test]
async fn test_tool_failure_is_contained() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        tool_round(
            vec![
                tool_call("c1", "broken", json!({})),
                tool_call("c2", "search", json!({"q": "y"})),
            ],
            None,
        ),
        content_round("recovered", None),
    ]));
    let executions = Arc::new(AtomicUsize::new(0));
    let counter = executions.clone();
    let tools: Arc<dyn ToolDispatcher> = Arc::new(
        ToolRegistry::new()
            .register("broken", |_| async { Err("exploded".to_string()) })
            .register("search", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"ok": true}))
                }
            }),
    );
    let engine = LoopEngine::new(adapter.clone(), tools);

    let request = request_with_tools(vec![
        ToolSpec::new("broken", "Broken", json!({})),
        ToolSpec::new("search", "Search", json!({})),
    ]);
    let response = engine.execute(request).await.unwrap().into_complete().unwrap();

    assert_eq!(response.content, "recovered");
    // The batch continued past the failure
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    // Every invocation is reported; only successes land in tool_results
    assert_eq!(response.tool_calls.len(), 2);
    assert!(!response.tool_calls[0].success);
    assert!(response.tool_calls[0].result.is_none());
    assert!(response.tool_calls[1].success);
    assert_eq!(response.tool_results.len(), 1);

    // The model saw the structured error payload
    let follow_up = adapter.chat_request(1);
    let error_msg = follow_up
        .messages
        .iter()
        .find(|m| {
            m.role == Role::Tool
                && m.content.as_deref().unwrap_or_default().contains("exploded")
        })
        .expect("error payload fed back");
    let payload: serde_json::Value =
        serde_json::from_str(error_msg.content.as_ref().unwrap()).unwrap();
    assert_eq!(payload["error"], true);
    assert_eq!(payload["tool"], "broken");
}

#[tokio::test]
async fn test_iteration_bound_terminates_without_error() {
    // The model never stops asking for tools
    let rounds: Vec<RoundResponse> = (0..20)
        .map(|i| {
            tool_round(
                vec![tool_call(&format!("c{}", i), "search", json!({"q": i}))],
                Some(TokenUsage::new(1, 1)),
            )
        })
        .collect();
    let adapter = Arc::new(ScriptedAdapter::new(rounds));
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = LoopEngine::new(adapter.clone(), search_registry(executions.clone()));

    let request = request_with_tools(vec![ToolSpec::new("search", "Search", json!({}))]);
    let response = engine.execute(request).await.unwrap().into_complete().unwrap();

    assert_eq!(response.timing.iterations, MAX_ITERATIONS);
    assert_eq!(adapter.chat_count(), MAX_ITERATIONS as usize);
    // Token additivity across every round that reported usage
    assert_eq!(response.tokens.total, 2 * MAX_ITERATIONS as u64);
}

#[tokio::test]
async fn test_streaming_after_tools_without_tool_support_in_stream() {
    let caps = AdapterCapabilities {
        supports_forced_tool_choice: true,
        streams_with_tools: false,
        detects_duplicate_tool_calls: false,
        tools_with_response_format: false,
        requires_api_key: false,
        model_prefix: None,
    };
    let adapter = Arc::new(
        ScriptedAdapter::new(vec![
            tool_round(vec![tool_call("c1", "search", json!({"q": "x"}))], Some(TokenUsage::new(5, 1))),
            // Probe round: no further calls, so the final answer streams
            content_round("probe", Some(TokenUsage::new(6, 2))),
        ])
        .with_caps(caps)
        .with_stream_chunks(vec![
            json!({"text": "fin"}),
            json!({"text": "al"}),
            json!({"usage": {"prompt": 7, "completion": 3}}),
        ]),
    );
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = LoopEngine::new(adapter.clone(), search_registry(executions.clone()));

    let mut request = request_with_tools(vec![ToolSpec::new("search", "Search", json!({}))]);
    request.stream = true;

    let output = engine.execute(request).await.unwrap();
    let ProviderOutput::Streaming(streaming) = output else {
        panic!("expected streaming output");
    };

    let bytes: Vec<u8> = streaming
        .stream
        .map(|chunk| chunk.unwrap().to_vec())
        .concat()
        .await;
    assert_eq!(String::from_utf8(bytes).unwrap(), "final");

    let execution = streaming.execution.lock().unwrap();
    assert_eq!(execution.content, "final");
    assert_eq!(execution.tool_calls.len(), 1);
    // Usage accumulated across both resolution rounds and the stream
    assert_eq!(execution.tokens.total, 5 + 1 + 6 + 2 + 7 + 3);
    // Two non-streaming rounds plus the streamed final
    assert_eq!(execution.timing.iterations, 3);

    // This backend cannot stream with tools declared
    assert_eq!(adapter.stream_count(), 1);
    let stream_round = adapter.stream_requests.lock().unwrap()[0].clone();
    assert!(stream_round.tools.is_empty());
    assert_eq!(stream_round.tool_choice, ToolChoice::Auto);
}

#[tokio::test]
async fn test_streaming_with_zero_tool_iterations_replays_answer() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![content_round(
        "direct answer",
        Some(TokenUsage::new(4, 4)),
    )]));
    let engine = LoopEngine::new(adapter.clone(), Arc::new(ToolRegistry::new()));

    let mut request = request_with_tools(vec![ToolSpec::new("search", "Search", json!({}))]);
    request.stream = true;

    let output = engine.execute(request).await.unwrap();
    let ProviderOutput::Streaming(streaming) = output else {
        panic!("expected streaming output");
    };
    let bytes: Vec<u8> = streaming
        .stream
        .map(|chunk| chunk.unwrap().to_vec())
        .concat()
        .await;
    assert_eq!(String::from_utf8(bytes).unwrap(), "direct answer");

    // No second model call was paid for the replay
    assert_eq!(adapter.chat_count(), 1);
    assert_eq!(adapter.stream_count(), 0);
}

#[tokio::test]
async fn test_streaming_without_tools_streams_immediately() {
    let adapter = Arc::new(
        ScriptedAdapter::new(vec![])
            .with_stream_chunks(vec![json!({"text": "hi"}), json!({"usage": {"prompt": 2, "completion": 1}})]),
    );
    let engine = LoopEngine::new(adapter.clone(), Arc::new(ToolRegistry::new()));

    let mut request = ProviderRequest::new("test-model");
    request.messages = vec![ChatMessage::user("hello")];
    request.stream = true;

    let output = engine.execute(request).await.unwrap();
    let ProviderOutput::Streaming(streaming) = output else {
        panic!("expected streaming output");
    };
    let bytes: Vec<u8> = streaming
        .stream
        .map(|chunk| chunk.unwrap().to_vec())
        .concat()
        .await;
    assert_eq!(String::from_utf8(bytes).unwrap(), "hi");

    assert_eq!(adapter.chat_count(), 0);
    assert_eq!(adapter.stream_count(), 1);
    let execution = streaming.execution.lock().unwrap();
    assert_eq!(execution.tokens.total, 3);
}

#[tokio::test]
async fn test_message_assembly_order() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![content_round("ok", None)]));
    let engine = LoopEngine::new(adapter.clone(), Arc::new(ToolRegistry::new()));

    let mut request = ProviderRequest::new("test-model");
    request.system_prompt = Some("sys".into());
    request.context = Some("ctx".into());
    request.messages = vec![ChatMessage::user("question")];
    engine.execute(request).await.unwrap();

    let round = adapter.chat_request(0);
    assert_eq!(round.messages.len(), 3);
    assert_eq!(round.messages[0].role, Role::System);
    assert_eq!(round.messages[1].role, Role::User);
    assert_eq!(round.messages[1].content.as_deref(), Some("ctx"));
    assert_eq!(round.messages[2].content.as_deref(), Some("question"));
}

#[tokio::test]
async fn test_none_tools_are_never_sent() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![content_round("ok", None)]));
    let engine = LoopEngine::new(adapter.clone(), Arc::new(ToolRegistry::new()));

    let mut request = request_with_tools(vec![
        ToolSpec::new("keep", "Kept tool", json!({})),
        ToolSpec {
            id: "drop".into(),
            description: "Dropped tool".into(),
            parameters: json!({}),
            usage_control: ToolUsageControl::None,
        },
    ]);
    request.stream = false;
    engine.execute(request).await.unwrap();

    let round = adapter.chat_request(0);
    assert_eq!(round.tools.len(), 1);
    assert_eq!(round.tools[0].id, "keep");
}

#[tokio::test]
async fn test_fenced_json_stripped_from_answer() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![content_round(
        "```json\n{\"answer\":42}\n```",
        None,
    )]));
    let engine = LoopEngine::new(adapter, Arc::new(ToolRegistry::new()));

    let response = engine
        .execute(ProviderRequest::new("test-model"))
        .await
        .unwrap()
        .into_complete()
        .unwrap();
    assert_eq!(response.content, "{\"answer\":42}");
}

#[tokio::test]
async fn test_abort_before_first_round() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![content_round("never", None)]));
    let engine = LoopEngine::new(adapter.clone(), Arc::new(ToolRegistry::new()));

    let abort = AbortSignal::new();
    abort.abort();
    let failure = engine
        .execute_with_abort(ProviderRequest::new("test-model"), abort)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, ProviderError::Aborted));
    assert_eq!(failure.timing.iterations, 0);
    assert_eq!(adapter.chat_count(), 0);
}

#[tokio::test]
async fn test_provider_error_carries_partial_timing() {
    // Script only one round; the follow-up hits "script exhausted"
    let adapter = Arc::new(ScriptedAdapter::new(vec![tool_round(
        vec![tool_call("c1", "search", json!({"q": "x"}))],
        Some(TokenUsage::new(3, 1)),
    )]));
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = LoopEngine::new(adapter, search_registry(executions));

    let request = request_with_tools(vec![ToolSpec::new("search", "Search", json!({}))]);
    let failure = engine.execute(request).await.unwrap_err();

    assert!(matches!(failure.error, ProviderError::Api { .. }));
    // One model round and one tool ran before the failure
    assert_eq!(failure.timing.iterations, 1);
    assert_eq!(failure.timing.time_segments.len(), 2);
}

#[tokio::test]
async fn test_orchestrator_rejects_unknown_provider() {
    let orchestrator = Orchestrator::new(
        Arc::new(ProviderRegistry::new()),
        Arc::new(ToolRegistry::new()),
    );
    let failure = orchestrator
        .execute("nope", ProviderRequest::new("some-model"))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, ProviderError::Config(_)));
}
