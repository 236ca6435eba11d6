//! Execution traces
//!
//! Everything a sandbox run reports back to the host: the final outcome, the
//! ordered host-call trace, captured console output, and the live events
//! emitted while the run is in progress.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Console method used by the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

/// One console call made by guest code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleRecord {
    pub level: ConsoleLevel,
    pub args: Vec<Value>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

/// One bridged host call made by guest code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Value::is_absent")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration_ms")]
    pub duration_ms: u64,
}

impl ToolCallRecord {
    pub fn succeeded(tool_name: impl Into<String>, args: Value, result: Value, duration_ms: u64) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
            result: Some(result),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(
        tool_name: impl Into<String>,
        args: Value,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
            result: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of one guest script execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_absent")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub console_output: Vec<ConsoleRecord>,
    #[serde(rename = "duration_ms")]
    pub duration_ms: u64,
}

impl EvalResult {
    pub fn success(
        result: Value,
        tool_calls: Vec<ToolCallRecord>,
        console_output: Vec<ConsoleRecord>,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            tool_calls,
            console_output,
            duration_ms,
        }
    }

    pub fn failure(
        error: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
        console_output: Vec<ConsoleRecord>,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            tool_calls,
            console_output,
            duration_ms,
        }
    }

    /// Failure with no trace at all, for runs rejected before execution
    pub fn rejected(error: impl Into<String>, duration_ms: u64) -> Self {
        Self::failure(error, Vec::new(), Vec::new(), duration_ms)
    }

    pub fn is_timeout(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| e.to_ascii_lowercase().contains("timeout"))
    }
}

/// Live progress notification emitted while a run is in flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SandboxEvent {
    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        tool_name: String,
        args: Value,
        start_time: u64,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallEnd {
        tool_name: String,
        args: Value,
        #[serde(default, skip_serializing_if = "Value::is_absent")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        start_time: u64,
        end_time: u64,
    },
    Console(ConsoleRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eval_result_wire_names() {
        let result = EvalResult::success(
            Value::from(2),
            vec![ToolCallRecord::succeeded("add", Value::from(1), Value::from(2), 3)],
            Vec::new(),
            7,
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], json!(true));
        assert_eq!(json["toolCalls"][0]["toolName"], json!("add"));
        assert_eq!(json["toolCalls"][0]["duration_ms"], json!(3));
        assert_eq!(json["consoleOutput"], json!([]));
        assert_eq!(json["duration_ms"], json!(7));
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_undefined_result_is_left_off_the_wire() {
        let result = EvalResult::success(Value::Undefined, Vec::new(), Vec::new(), 1);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("result").is_none());

        let result = EvalResult::success(Value::Null, Vec::new(), Vec::new(), 1);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["result"], json!(null));
    }

    #[test]
    fn test_event_tags() {
        let event = SandboxEvent::ToolCallStart {
            tool_name: "file_read".into(),
            args: Value::Null,
            start_time: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], json!("tool-call-start"));
        assert_eq!(json["toolName"], json!("file_read"));

        let console = SandboxEvent::Console(ConsoleRecord {
            level: ConsoleLevel::Warn,
            args: vec![Value::from("careful")],
            timestamp: 5,
        });
        let json = serde_json::to_value(&console).unwrap();
        assert_eq!(json["type"], json!("console"));
        assert_eq!(json["level"], json!("warn"));
    }

    #[test]
    fn test_timeout_detection() {
        let result = EvalResult::rejected("Execution timeout: exceeded 100ms", 100);
        assert!(result.is_timeout());
        assert!(!EvalResult::rejected("Error: boom", 1).is_timeout());
    }
}
