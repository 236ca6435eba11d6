//! Shared types for toolscript
//!
//! This crate provides the data model used across the toolscript crates:
//! marshaled values, execution traces and tool descriptors.

pub mod record;
pub mod tool;
pub mod value;

pub use record::{ConsoleLevel, ConsoleRecord, EvalResult, SandboxEvent, ToolCallRecord};
pub use tool::{ToolDescriptor, MCP_TOOL_PREFIX};
pub use value::{
    JsonError, SharedValue, UnserializableKind, Value, CIRCULAR_SENTINEL, UNSERIALIZABLE_TAG,
};
