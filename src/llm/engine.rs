//! Tool-call loop engine.
//!
//! Model-agnostic driver for the multi-round tool dialogue: issue the
//! initial call, execute whatever tools the model requests, feed results
//! back, and repeat until the model answers in plain content or the
//! iteration bound is reached. Streaming requests resolve tools first and
//! only stream the final answer.

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::helpers::{strip_json_fences, strip_model_prefix, tool_call_signature};
use super::provider::{
    AbortSignal, ChatMessage, ExecutedToolCall, ProviderAdapter, ProviderError, ProviderFailure,
    ProviderOutput, ProviderRequest, ProviderResponse, RoundRequest, StreamingExecution,
    TokenUsage, ToolCallState, ToolChoice, ToolSpec, ToolUsageControl, TrackedToolCall,
};
use super::registry::ProviderRegistry;
use super::stream::{normalise, replay, CompletionCallback};
use super::telemetry::ExecutionTimer;
use crate::tools::ToolDispatcher;

/// Upper bound on model round-trips per request. Reaching it is not an
/// error; the last model content becomes the answer.
pub const MAX_ITERATIONS: u32 = 10;

/// Façade over the registry: resolves the backend and runs the loop.
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    tools: Arc<dyn ToolDispatcher>,
}

impl Orchestrator {
    pub fn new(registry: Arc<ProviderRegistry>, tools: Arc<dyn ToolDispatcher>) -> Self {
        Self { registry, tools }
    }

    /// Execute against an explicit backend id, falling back to model-prefix
    /// routing when the id is unknown.
    pub async fn execute(
        &self,
        provider: &str,
        request: ProviderRequest,
    ) -> Result<ProviderOutput, ProviderFailure> {
        let adapter = match self.registry.get(provider) {
            Some(adapter) => adapter,
            None => match self.registry.resolve_model(&request.model) {
                Some((adapter, _)) => adapter,
                None => {
                    return Err(ProviderFailure {
                        error: ProviderError::Config(format!("unknown provider '{}'", provider)),
                        timing: ExecutionTimer::start().snapshot(),
                    })
                }
            },
        };
        LoopEngine::new(adapter, self.tools.clone())
            .execute(request)
            .await
    }
}

/// The per-request loop driver.
pub struct LoopEngine {
    adapter: Arc<dyn ProviderAdapter>,
    tools: Arc<dyn ToolDispatcher>,
}

impl LoopEngine {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, tools: Arc<dyn ToolDispatcher>) -> Self {
        Self { adapter, tools }
    }

    pub async fn execute(&self, request: ProviderRequest) -> Result<ProviderOutput, ProviderFailure> {
        self.execute_with_abort(request, AbortSignal::new()).await
    }

    pub async fn execute_with_abort(
        &self,
        request: ProviderRequest,
        abort: AbortSignal,
    ) -> Result<ProviderOutput, ProviderFailure> {
        let caps = self.adapter.capabilities();
        let mut timer = ExecutionTimer::start();

        let model = strip_model_prefix(&request.model, caps.model_prefix).to_string();

        // Message assembly: system prompt, then context, then caller history
        let mut messages: Vec<ChatMessage> = Vec::new();
        if let Some(system_prompt) = &request.system_prompt {
            messages.push(ChatMessage::system(system_prompt.clone()));
        }
        if let Some(context) = &request.context {
            messages.push(ChatMessage::user(context.clone()));
        }
        messages.extend(request.messages.iter().cloned());

        // Tools with usage_control = none are never sent
        let tools: Vec<ToolSpec> = request
            .tools
            .iter()
            .filter(|t| t.usage_control != ToolUsageControl::None)
            .cloned()
            .collect();

        let response_format = match (&request.response_format, tools.is_empty()) {
            (Some(_), false) if !caps.tools_with_response_format => {
                log::warn!(
                    "{}: response_format cannot be combined with tools, dropping",
                    self.adapter.id()
                );
                None
            }
            (format, _) => format.clone(),
        };

        let forced_tools: Vec<String> = tools
            .iter()
            .filter(|t| t.usage_control == ToolUsageControl::Force)
            .map(|t| t.id.clone())
            .collect();
        let mut used_forced_tools: Vec<String> = Vec::new();

        // Streaming with no tools declared needs no resolution phase
        if request.stream && tools.is_empty() {
            let round = self.round(&request, &model, messages, vec![], ToolChoice::Auto, &response_format);
            return self
                .stream_final(round, timer, TokenUsage::default(), Vec::new(), Vec::new())
                .await;
        }

        let mut total_tokens = TokenUsage::default();
        let mut executed_calls: Vec<ExecutedToolCall> = Vec::new();
        let mut tool_results: Vec<serde_json::Value> = Vec::new();
        let mut seen_signatures: HashSet<String> = HashSet::new();
        let mut duplicate_seen = false;
        let mut tool_iterations = 0u32;
        let mut content = String::new();

        loop {
            if abort.is_aborted() {
                return Err(self.fail(ProviderError::Aborted, &timer));
            }

            let tool_choice = if duplicate_seen {
                ToolChoice::None
            } else {
                next_tool_choice(&forced_tools, &used_forced_tools, caps.supports_forced_tool_choice)
            };

            let round = self.round(
                &request,
                &model,
                messages.clone(),
                tools.clone(),
                tool_choice,
                &response_format,
            );

            let round_started = Utc::now();
            let response = match self.adapter.chat(&round).await {
                Ok(response) => response,
                Err(error) => return Err(self.fail(error, &timer)),
            };
            timer.record_model(&model, round_started, Utc::now());

            if let Some(usage) = &response.usage {
                total_tokens.absorb(usage);
            }
            content = strip_json_fences(&response.content);

            log::debug!(
                "{}: iteration {} ({} tool calls, {} tokens so far)",
                self.adapter.id(),
                timer.iterations(),
                response.tool_calls.len(),
                total_tokens.total
            );

            if response.tool_calls.is_empty() {
                break;
            }

            // Feed the assistant turn (with its tool calls) back verbatim
            let mut assistant = ChatMessage::assistant_tool_calls(response.tool_calls.clone());
            if !response.content.is_empty() {
                assistant.content = Some(response.content.clone());
            }
            messages.push(assistant);

            tool_iterations += 1;

            for call in &response.tool_calls {
                if abort.is_aborted() {
                    return Err(self.fail(ProviderError::Aborted, &timer));
                }

                let mut tracked = TrackedToolCall::new(&call.id, &call.name, call.arguments.clone());

                if caps.detects_duplicate_tool_calls
                    && !seen_signatures.insert(tool_call_signature(call))
                {
                    duplicate_seen = true;
                    tracked.advance(ToolCallState::Rejected);
                    log::warn!(
                        "{}: duplicate tool call '{}' suppressed",
                        self.adapter.id(),
                        call.name
                    );
                    let payload = json!({
                        "error": true,
                        "message": "Duplicate tool call suppressed",
                        "tool": call.name,
                    });
                    messages.push(ChatMessage::tool(&call.id, payload.to_string()));
                    continue;
                }

                tracked.advance(ToolCallState::Executing);
                let tool_started = Utc::now();
                let outcome = self.tools.execute_tool(&call.name, &call.arguments).await;
                let tool_ended = Utc::now();
                timer.record_tool(&call.name, tool_started, tool_ended);

                if outcome.success {
                    tracked.advance(ToolCallState::Success);
                    tool_results.push(outcome.output.clone());
                    let body = serde_json::to_string(&outcome.output).unwrap_or_default();
                    messages.push(ChatMessage::tool(&call.id, body));
                } else {
                    tracked.advance(ToolCallState::Error);
                    let message = outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string());
                    log::warn!(
                        "{}: tool '{}' failed: {}",
                        self.adapter.id(),
                        call.name,
                        message
                    );
                    let payload = json!({
                        "error": true,
                        "message": message,
                        "tool": call.name,
                    });
                    messages.push(ChatMessage::tool(&call.id, payload.to_string()));
                }

                executed_calls.push(ExecutedToolCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    start_time: tool_started,
                    end_time: tool_ended,
                    duration: (tool_ended - tool_started).num_milliseconds(),
                    result: outcome.success.then(|| outcome.output.clone()),
                    success: outcome.success,
                });
            }

            // Track which forced tools have fired so far
            for call in &response.tool_calls {
                if forced_tools.contains(&call.name) && !used_forced_tools.contains(&call.name) {
                    used_forced_tools.push(call.name.clone());
                }
            }

            if timer.iterations() >= MAX_ITERATIONS {
                log::warn!(
                    "{}: iteration bound reached, returning last content",
                    self.adapter.id()
                );
                break;
            }
        }

        if request.stream {
            if tool_iterations > 0 {
                // Re-issue the final answer as a stream. Auto choice avoids
                // re-triggering forced tools; backends that cannot stream
                // with tools declared get the final call without them.
                let stream_tools = if caps.streams_with_tools { tools } else { Vec::new() };
                let round = self.round(
                    &request,
                    &model,
                    messages,
                    stream_tools,
                    ToolChoice::Auto,
                    &response_format,
                );
                return self
                    .stream_final(round, timer, total_tokens, executed_calls, tool_results)
                    .await;
            }

            // No tool iteration happened: replay the resolved answer instead
            // of paying a second model call
            let execution = Arc::new(Mutex::new(ProviderResponse {
                content: content.clone(),
                model: model.clone(),
                tokens: total_tokens.clone(),
                tool_calls: executed_calls,
                tool_results,
                timing: timer.snapshot(),
            }));
            let stream = replay(content, None, Box::new(|_| {}));
            return Ok(ProviderOutput::Streaming(StreamingExecution { stream, execution }));
        }

        Ok(ProviderOutput::Complete(ProviderResponse {
            content,
            model,
            tokens: total_tokens,
            tool_calls: executed_calls,
            tool_results,
            timing: timer.snapshot(),
        }))
    }

    fn round(
        &self,
        request: &ProviderRequest,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolSpec>,
        tool_choice: ToolChoice,
        response_format: &Option<super::provider::ResponseFormat>,
    ) -> RoundRequest {
        RoundRequest {
            model: model.to_string(),
            api_key: request.api_key.clone(),
            messages,
            tools,
            tool_choice,
            response_format: response_format.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            reasoning_effort: request.reasoning_effort.clone(),
            verbosity: request.verbosity.clone(),
        }
    }

    async fn stream_final(
        &self,
        round: RoundRequest,
        timer: ExecutionTimer,
        total_tokens: TokenUsage,
        executed_calls: Vec<ExecutedToolCall>,
        tool_results: Vec<serde_json::Value>,
    ) -> Result<ProviderOutput, ProviderFailure> {
        let stream_started = Utc::now();
        let raw = match self.adapter.open_stream(&round).await {
            Ok(raw) => raw,
            Err(error) => return Err(self.fail(error, &timer)),
        };

        let execution = Arc::new(Mutex::new(ProviderResponse {
            content: String::new(),
            model: round.model.clone(),
            tokens: total_tokens,
            tool_calls: executed_calls,
            tool_results,
            timing: timer.snapshot(),
        }));

        let backend = self.adapter.id();
        let model = round.model.clone();
        let execution_slot = execution.clone();
        let mut timer = timer;
        let on_complete: CompletionCallback = Box::new(move |outcome| {
            timer.record_model(&model, stream_started, Utc::now());
            if outcome.ended_by_tool_call {
                log::warn!("{}: function call inside final stream, closing early", backend);
            }
            if let Ok(mut execution) = execution_slot.lock() {
                execution.content = strip_json_fences(&outcome.content);
                if let Some(usage) = &outcome.usage {
                    execution.tokens.absorb(usage);
                }
                execution.timing = timer.snapshot();
            }
        });

        let decoder = self.adapter.clone();
        let stream = normalise(raw, move |chunk| decoder.decode_chunk(chunk), on_complete);

        Ok(ProviderOutput::Streaming(StreamingExecution { stream, execution }))
    }

    fn fail(&self, error: ProviderError, timer: &ExecutionTimer) -> ProviderFailure {
        log::error!("{}: request failed: {}", self.adapter.id(), error);
        ProviderFailure {
            error,
            timing: timer.snapshot(),
        }
    }
}

/// Pick the tool choice for the next round: force the first forced tool that
/// has not fired yet, fall back to auto once all have (or when the backend
/// cannot force at all).
fn next_tool_choice(forced: &[String], used: &[String], supported: bool) -> ToolChoice {
    if !supported {
        return ToolChoice::Auto;
    }
    match forced.iter().find(|tool| !used.contains(tool)) {
        Some(tool) => ToolChoice::Tool(tool.clone()),
        None => ToolChoice::Auto,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_tool_choice_sequencing() {
        let forced = vec!["a".to_string(), "b".to_string()];

        assert_eq!(
            next_tool_choice(&forced, &[], true),
            ToolChoice::Tool("a".into())
        );
        assert_eq!(
            next_tool_choice(&forced, &["a".to_string()], true),
            ToolChoice::Tool("b".into())
        );
        assert_eq!(
            next_tool_choice(&forced, &["a".to_string(), "b".to_string()], true),
            ToolChoice::Auto
        );
        // Backends without forced selection always get auto
        assert_eq!(next_tool_choice(&forced, &[], false), ToolChoice::Auto);
    }
}
