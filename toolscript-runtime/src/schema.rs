//! Tool argument validation against input schemas

use jsonschema::Validator;
use serde_json::Value as Json;

/// Compiled input schema of one tool
pub struct ArgumentSchema {
    validator: Option<Validator>,
}

impl ArgumentSchema {
    /// Compile `schema`
    ///
    /// A schema that does not compile disables validation for the tool
    /// instead of making it unusable.
    pub fn compile(tool_name: &str, schema: &Json) -> Self {
        let validator = match jsonschema::validator_for(schema) {
            Ok(validator) => Some(validator),
            Err(err) => {
                tracing::warn!(tool = %tool_name, error = %err, "input schema does not compile, skipping validation");
                None
            }
        };
        Self { validator }
    }

    pub fn is_enforced(&self) -> bool {
        self.validator.is_some()
    }

    /// Every violation in `args`, as `<path>: <message>`
    pub fn issues(&self, args: &Json) -> Vec<String> {
        let Some(validator) = &self.validator else {
            return Vec::new();
        };
        validator
            .iter_errors(args)
            .map(|error| {
                let path = error.instance_path.to_string();
                let path = if path.is_empty() { "(root)".to_string() } else { path };
                format!("{}: {}", path, error)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file_read_schema() -> ArgumentSchema {
        ArgumentSchema::compile(
            "file_read",
            &json!({
                "type": "object",
                "properties": {
                    "filePath": { "type": "string" },
                    "limit": { "type": "number" }
                },
                "required": ["filePath"]
            }),
        )
    }

    #[test]
    fn test_valid_arguments() {
        let schema = file_read_schema();
        assert!(schema.is_enforced());
        assert!(schema.issues(&json!({"filePath": "a.txt", "limit": 3})).is_empty());
    }

    #[test]
    fn test_issue_paths() {
        let schema = file_read_schema();
        let issues = schema.issues(&json!({"limit": "x"}));
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|i| i.starts_with("(root): ") && i.contains("filePath")));
        assert!(issues.iter().any(|i| i.starts_with("/limit: ")));
    }

    #[test]
    fn test_broken_schema_is_not_enforced() {
        let schema = ArgumentSchema::compile("odd", &json!({"type": 12}));
        assert!(!schema.is_enforced());
        assert!(schema.issues(&json!({"anything": true})).is_empty());
    }
}
