//! Tool bridge
//!
//! Exposes a curated subset of the host tool registry to guest code as
//! members of one namespace object. Every bridged call:
//!
//! 1. fails fast when the run is already cancelled
//! 2. validates its argument object against the tool's input schema
//! 3. runs the tool with the run's cancellation token
//! 4. coerces the result to plain JSON, or to a fixed error object when
//!    that is impossible

use crate::config::ExecutionConfig;
use crate::error::{Result, RuntimeError};
use crate::host::{HostCallContext, HostFunction};
use crate::sandbox::Sandbox;
use crate::schema::ArgumentSchema;
use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use toolscript_types::{ToolDescriptor, Value};

/// Error text of the object substituted for results JSON cannot carry
pub const NOT_SERIALIZABLE_MESSAGE: &str = "Result not JSON-serializable";

/// Per-call context handed to a tool
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    /// Cancelled when the sandbox run times out or is aborted
    pub abort_signal: CancellationToken,
    pub call_id: String,
    /// Conversation history; bridged calls have none
    pub prior_messages: Vec<Json>,
}

/// Execute capability of a host tool
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, args: Json, cx: ToolCallContext) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> ToolExecutor for F
where
    F: Fn(Json, ToolCallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn execute(&self, args: Json, cx: ToolCallContext) -> anyhow::Result<Value> {
        self(args, cx).await
    }
}

/// A registry entry; tools without an executor are described but not runnable
#[derive(Clone)]
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub executor: Option<Arc<dyn ToolExecutor>>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("descriptor", &self.descriptor)
            .field("executable", &self.executor.is_some())
            .finish()
    }
}

/// The host's tools, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runnable tool, replacing any tool of the same name
    pub fn register(&mut self, descriptor: ToolDescriptor, executor: impl ToolExecutor + 'static) {
        let executor: Arc<dyn ToolExecutor> = Arc::new(executor);
        self.insert(RegisteredTool {
            descriptor,
            executor: Some(executor),
        });
    }

    /// Add a tool that can be described but not executed here
    pub fn register_descriptor(&mut self, descriptor: ToolDescriptor) {
        self.insert(RegisteredTool {
            descriptor,
            executor: None,
        });
    }

    pub fn insert(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.descriptor.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

struct BridgedTool {
    descriptor: ToolDescriptor,
    schema: ArgumentSchema,
    executor: Arc<dyn ToolExecutor>,
}

impl BridgedTool {
    async fn invoke(&self, args: Vec<Value>, cx: HostCallContext) -> Result<Value> {
        let tool = &self.descriptor.name;
        if cx.signal.is_cancelled() {
            return Err(RuntimeError::Aborted);
        }

        let args = match args.into_iter().next() {
            None | Some(Value::Undefined) => Value::Object(Vec::new()),
            Some(args) => args,
        };
        let args = args.to_json().map_err(|err| RuntimeError::InvalidArguments {
            tool: tool.clone(),
            issues: vec![format!("(root): {}", err)],
        })?;
        let issues = self.schema.issues(&args);
        if !issues.is_empty() {
            tracing::debug!(tool = %tool, issues = issues.len(), "bridged call rejected");
            return Err(RuntimeError::InvalidArguments {
                tool: tool.clone(),
                issues,
            });
        }

        let context = ToolCallContext {
            abort_signal: cx.signal,
            call_id: cx.call_id,
            prior_messages: Vec::new(),
        };
        let result = self
            .executor
            .execute(args, context)
            .await
            .map_err(|err| RuntimeError::ToolFailed {
                tool: tool.clone(),
                message: format!("{:#}", err),
            })?;
        Ok(coerce_result(tool, result))
    }
}

/// Round-trip through JSON, the way the guest would see a serialized result
fn coerce_result(tool: &str, result: Value) -> Value {
    match result.to_json() {
        Ok(json) => Value::from_json(json),
        Err(err) => {
            tracing::warn!(tool = %tool, error = %err, "tool result is not JSON-serializable");
            Value::object([("error", Value::from(NOT_SERIALIZABLE_MESSAGE))])
        }
    }
}

/// Partition of the registry into tools guest code may call and the rest
#[derive(Clone)]
pub struct ToolBridge {
    namespace: String,
    bridged: Vec<Arc<BridgedTool>>,
    non_bridgeable: Vec<String>,
}

impl ToolBridge {
    /// A tool is bridgeable when it has an executor and is not excluded
    pub fn new(registry: &ToolRegistry, config: &ExecutionConfig) -> Self {
        let mut bridged = Vec::new();
        let mut non_bridgeable = Vec::new();
        for tool in registry.iter() {
            let name = &tool.descriptor.name;
            match &tool.executor {
                Some(executor) if !config.is_excluded(name) => {
                    bridged.push(Arc::new(BridgedTool {
                        schema: ArgumentSchema::compile(name, &tool.descriptor.input_schema),
                        descriptor: tool.descriptor.clone(),
                        executor: Arc::clone(executor),
                    }));
                }
                _ => non_bridgeable.push(name.clone()),
            }
        }
        tracing::debug!(
            bridged = bridged.len(),
            non_bridgeable = non_bridgeable.len(),
            "tool bridge built"
        );
        Self {
            namespace: config.namespace.clone(),
            bridged,
            non_bridgeable,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn bridgeable_tool_names(&self) -> Vec<&str> {
        self.bridged
            .iter()
            .map(|tool| tool.descriptor.name.as_str())
            .collect()
    }

    pub fn bridgeable_descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.bridged.iter().map(|tool| &tool.descriptor)
    }

    pub fn non_bridgeable_tool_names(&self) -> Vec<&str> {
        self.non_bridgeable.iter().map(String::as_str).collect()
    }

    /// Install the namespace object with every bridgeable tool on `sandbox`
    pub fn register(&self, sandbox: &Sandbox) -> Result<()> {
        let methods = self.bridged.iter().map(|tool| {
            let name = tool.descriptor.name.clone();
            let tool = Arc::clone(tool);
            let call = move |args: Vec<Value>, cx: HostCallContext| {
                let tool = Arc::clone(&tool);
                async move { tool.invoke(args, cx).await.map_err(anyhow::Error::from) }
            };
            let function: Arc<dyn HostFunction> = Arc::new(call);
            (name, function)
        });
        sandbox.register_object(self.namespace.clone(), methods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(args: Json, _cx: ToolCallContext) -> impl Future<Output = anyhow::Result<Value>> {
        async move { Ok(Value::from_json(args)) }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDescriptor::new("file_read", "Read", json!({"type": "object"})), echo);
        registry.register(ToolDescriptor::new("code_execution", "Nested", json!({"type": "object"})), echo);
        registry.register_descriptor(ToolDescriptor::new("web_search", "Provider side", json!({"type": "object"})));
        registry
    }

    #[test]
    fn test_partition() {
        let bridge = ToolBridge::new(&registry(), &ExecutionConfig::default());
        assert_eq!(bridge.bridgeable_tool_names(), vec!["file_read"]);
        assert_eq!(bridge.non_bridgeable_tool_names(), vec!["code_execution", "web_search"]);
        assert_eq!(bridge.namespace(), "mux");
    }

    #[test]
    fn test_exclusions_come_from_config() {
        let config = ExecutionConfig {
            excluded_tools: vec!["file_read".into()],
            ..ExecutionConfig::default()
        };
        let bridge = ToolBridge::new(&registry(), &config);
        assert_eq!(bridge.bridgeable_tool_names(), vec!["code_execution"]);
    }

    #[test]
    fn test_coerce_result() {
        let plain = Value::object([("when", Value::Date("2024-01-01T00:00:00.000Z".into())), ("gone", Value::Undefined)]);
        assert_eq!(
            coerce_result("t", plain).to_json().unwrap(),
            json!({"when": "2024-01-01T00:00:00.000Z"})
        );

        let big = Value::object([("n", Value::BigInt(1.into()))]);
        assert_eq!(
            coerce_result("t", big).to_json().unwrap(),
            json!({"error": NOT_SERIALIZABLE_MESSAGE})
        );
    }

    #[tokio::test]
    async fn test_invoke_validates_and_cancels() {
        let tool = BridgedTool {
            descriptor: ToolDescriptor::new("file_read", "Read", json!({})),
            schema: ArgumentSchema::compile(
                "file_read",
                &json!({"type": "object", "properties": {"filePath": {"type": "string"}}, "required": ["filePath"]}),
            ),
            executor: Arc::new(echo),
        };
        let cx = |signal: CancellationToken| HostCallContext {
            signal,
            call_id: "mux-file_read-1".into(),
        };

        let ok = tool
            .invoke(vec![Value::object([("filePath", Value::from("a.txt"))])], cx(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(ok.get("filePath"), Some(Value::from("a.txt")));

        let err = tool.invoke(vec![], cx(CancellationToken::new())).await.unwrap_err();
        assert!(err.to_string().starts_with("Invalid arguments for file_read: (root): "));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = tool.invoke(vec![], cx(cancelled)).await.unwrap_err();
        assert_eq!(err.to_string(), "Execution aborted");
    }
}
