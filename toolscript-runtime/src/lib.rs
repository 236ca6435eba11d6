//! # toolscript runtime
//!
//! Runs agent-authored scripts inside a bounded QuickJS sandbox:
//! - [`sandbox`]: the interpreter wrapper with host calls, limits and abort
//! - [`bridge`]: host tools exposed to guest code under one namespace
//! - [`pipeline`]: analysis, validation and execution behind one entry point
//!
//! ## Example
//!
//! ```ignore
//! let mut registry = ToolRegistry::new();
//! registry.register(descriptor, |args: serde_json::Value, cx: ToolCallContext| async move {
//!     Ok(Value::from_json(args))
//! });
//!
//! let execution = CodeExecution::from_registry(&registry, ExecutionConfig::default())?;
//! let result = execution
//!     .execute("return mux.echo({ text: 'hi' });", RunOptions::new())
//!     .await?;
//! assert!(result.success);
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod limits;
mod marshal;
pub mod pipeline;
pub mod sandbox;
pub mod schema;

pub use bridge::{
    RegisteredTool, ToolBridge, ToolCallContext, ToolExecutor, ToolRegistry,
    NOT_SERIALIZABLE_MESSAGE,
};
pub use config::{ConfigError, ExecutionConfig};
pub use error::{Result, RuntimeError};
pub use host::{EventHandler, HostCallContext, HostFunction};
pub use limits::SandboxLimits;
pub use pipeline::{CodeExecution, RunOptions};
pub use sandbox::Sandbox;

pub use toolscript_types::{
    ConsoleLevel, ConsoleRecord, EvalResult, SandboxEvent, ToolCallRecord, ToolDescriptor, Value,
};
