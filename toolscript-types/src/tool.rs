//! Host tool descriptors

use serde::{Deserialize, Serialize};

/// Prefix shared by tools proxied from MCP servers
pub const MCP_TOOL_PREFIX: &str = "mcp__";

/// Static description of a host tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the argument object
    pub input_schema: serde_json::Value,
    /// JSON Schema of the result, when the tool declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
        }
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn is_mcp(&self) -> bool {
        self.name.starts_with(MCP_TOOL_PREFIX)
    }
}
