//! Caller-facing execution pipeline
//!
//! [`CodeExecution`] ties the stages together: static analysis and type
//! validation against declarations generated from the bridged tools, then
//! a run in a fresh sandbox. Each stage can be called on its own;
//! [`CodeExecution::execute`] gates the run on the first two.

use crate::bridge::{ToolBridge, ToolRegistry};
use crate::config::ExecutionConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use toolscript_check::{
    AnalysisError, AnalysisResult, CacheStats, DeclarationCache, Declarations, StaticAnalyzer,
    TypeValidator, ValidationResult,
};
use toolscript_types::{EvalResult, SandboxEvent};

/// Per-run options
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Requested timeout; clamped to the configured maximum
    pub timeout_secs: Option<u64>,
    /// External cancellation, linked to the sandbox's abort
    pub abort_signal: Option<CancellationToken>,
    pub on_event: Option<Arc<dyn Fn(&SandboxEvent) + Send + Sync>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_abort_signal(mut self, signal: CancellationToken) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    pub fn with_event_handler(mut self, handler: impl Fn(&SandboxEvent) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(handler));
        self
    }
}

/// Analyze, validate and run guest code against a tool bridge
pub struct CodeExecution {
    bridge: ToolBridge,
    config: ExecutionConfig,
    cache: DeclarationCache,
    analyzer: StaticAnalyzer,
    validator: TypeValidator,
}

impl CodeExecution {
    pub fn new(bridge: ToolBridge, config: ExecutionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache: DeclarationCache::new(config.namespace.clone()),
            analyzer: StaticAnalyzer::new(config.namespace.clone())?,
            validator: TypeValidator::new()?,
            bridge,
            config,
        })
    }

    /// Bridge the registry with `config` and build the pipeline on it
    pub fn from_registry(registry: &ToolRegistry, config: ExecutionConfig) -> Result<Self> {
        let bridge = ToolBridge::new(registry, &config);
        Self::new(bridge, config)
    }

    pub fn bridge(&self) -> &ToolBridge {
        &self.bridge
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Declarations of the bridged tools, regenerated only when they change
    pub fn declarations(&self) -> Arc<Declarations> {
        self.cache.declarations(self.bridge.bridgeable_descriptors())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn analyze(&self, code: &str) -> Result<AnalysisResult> {
        Ok(self.analyzer.analyze(code)?)
    }

    pub fn validate(&self, code: &str) -> Result<ValidationResult> {
        let declarations = self.declarations();
        Ok(self.validator.validate(code, &declarations)?)
    }

    /// Run `code` in a fresh sandbox with the bridged tools installed
    ///
    /// Guest failures are reported in the [`EvalResult`]; `Err` means the
    /// sandbox itself could not be set up.
    pub async fn run(&self, code: &str, options: RunOptions) -> Result<EvalResult> {
        let sandbox = Sandbox::create()?;
        sandbox.set_limits(self.config.limits(options.timeout_secs))?;
        if let Some(handler) = options.on_event {
            sandbox.on_event(move |event| handler(event));
        }
        self.bridge.register(&sandbox)?;

        let sandbox = Arc::new(sandbox);
        let link = options.abort_signal.map(|signal| {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move {
                signal.cancelled().await;
                tracing::warn!("run aborted by caller");
                sandbox.abort();
            })
        });

        let result = sandbox.eval(code).await;

        if let Some(link) = link {
            link.abort();
            // The link task may still hold the sandbox until it observes
            // the abort, so wait for it before disposing.
            let _ = link.await;
        }
        // Disposing joins the worker thread.
        if tokio::task::spawn_blocking(move || sandbox.dispose())
            .await
            .is_err()
        {
            tracing::warn!("sandbox dispose task failed");
        }
        Ok(result)
    }

    /// Analyze and type-check `code`, then run it when both pass
    pub async fn execute(&self, code: &str, options: RunOptions) -> Result<EvalResult> {
        let started = Instant::now();
        let declarations = self.declarations();
        let analysis = self
            .analyzer
            .analyze_with_types(code, &self.validator, &declarations)?;
        if !analysis.valid {
            tracing::debug!(errors = analysis.errors.len(), "execution rejected before running");
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            return Ok(EvalResult::rejected(gate_message(&analysis.errors), duration_ms));
        }
        self.run(code, options).await
    }

    /// Model-facing description of the code execution tool
    pub fn tool_description(&self) -> String {
        let ns = &self.config.namespace;
        let mut out = String::new();
        out.push_str("Execute sandboxed JavaScript to batch tools and transform outputs.\n\n");
        out.push_str("**When to use:** Prefer this tool when making 2+ tool calls, especially when later calls depend on earlier results. Reduces round-trip latency.\n\n");
        out.push_str("**Available tools (TypeScript definitions):**\n```typescript\n");
        out.push_str(&self.declarations().source);
        out.push_str("```\n\n**Usage notes:**\n");
        let _ = writeln!(out, "- `{}.*` functions are synchronous; do not use `await`", ns);
        out.push_str("- Use `return` to provide a final result to the model\n");
        out.push_str("- Use `console.log/warn/error` for debugging; output is captured\n");
        out.push_str("- Results are JSON-serialized; non-serializable values return `{ error: \"...\" }`\n");
        out.push_str("- On failure, partial results (completed tool calls) are returned for debugging\n\n");
        let _ = write!(
            out,
            "**Security:** The sandbox has no access to `require`, `import`, `process`, `fetch`, or the filesystem outside of `{}.*` tools.",
            ns
        );
        out
    }
}

fn gate_message(errors: &[AnalysisError]) -> String {
    let mut message = String::from("Code analysis failed:");
    for error in errors {
        let location = match (error.line, error.column) {
            (Some(line), Some(column)) => format!(" (line {}, col {})", line, column),
            (Some(line), None) => format!(" (line {})", line),
            _ => String::new(),
        };
        let _ = write!(message, "\n- {}{}", error.message, location);
    }
    message
}
