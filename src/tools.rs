//! Tool execution seam.
//!
//! Tool implementations live outside this crate; the loop engine only needs
//! a callable that takes a tool name plus JSON parameters and reports
//! success with an output or failure with a message. [`ToolRegistry`] is the
//! standard dispatcher: a map of named async handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Anything that can execute tools on behalf of the loop engine.
#[async_trait::async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn execute_tool(&self, name: &str, params: &serde_json::Value) -> ToolOutcome;
}

type ToolHandler = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>
        + Send
        + Sync,
>;

/// Registry of named tool handlers.
///
/// ```no_run
/// use flowcore::tools::ToolRegistry;
///
/// let registry = ToolRegistry::new().register("echo", |params| async move {
///     Ok(params)
/// });
/// ```
pub struct ToolRegistry {
    handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Box::new(move |params| Box::pin(handler(params))));
        self
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ToolDispatcher for ToolRegistry {
    async fn execute_tool(&self, name: &str, params: &serde_json::Value) -> ToolOutcome {
        let Some(handler) = self.handlers.get(name) else {
            return ToolOutcome::failure(format!("Tool '{}' not registered", name));
        };
        match handler(params.clone()).await {
            Ok(output) => ToolOutcome::success(output),
            Err(error) => ToolOutcome::failure(error),
        }
    }
}
