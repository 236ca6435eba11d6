//! Tool signature generation
//!
//! Turns host tool descriptors into ambient declarations for the guest
//! namespace. The output has two faces: declaration text (embedded in the
//! tool description shown to the model, and handy when debugging) and a
//! typed model the [`crate::validator`] checks guest code against.
//!
//! Host calls complete before guest code continues, so every generated
//! function returns its result type directly rather than a promise.

use crate::types::{is_identifier, property_key, Field, Literal, ObjectType, TsType};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use toolscript_types::ToolDescriptor;

/// Name of the shared result shape of MCP-proxied tools
pub const MCP_RESULT_TYPE: &str = "MCPCallToolResult";

const MAX_REF_DEPTH: usize = 16;

const CONSOLE_DECLARATION: &str = "declare var console: {
  log(...args: unknown[]): void;
  warn(...args: unknown[]): void;
  error(...args: unknown[]): void;
};
";

/// Generated signature of one tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSignature {
    pub tool_name: String,
    pub description: String,
    /// Argument shape, named `<Pascal>Args`
    pub args: ObjectType,
    /// Result type; an alias when the tool declares a result shape
    pub result: TsType,
    /// Rendered declarations, indented for the namespace body
    pub source: String,
}

impl ToolSignature {
    pub fn generate(tool: &ToolDescriptor) -> Self {
        let base = pascal_case(&tool.name);
        let args_name = format!("{}Args", base);

        let args = match schema_to_type(&tool.input_schema, &tool.input_schema, 0) {
            TsType::Object(obj) => obj.named(args_name.clone()),
            _ => ObjectType::default()
                .named(args_name.clone())
                .with_index(TsType::Unknown),
        };

        let result = if let Some(schema) = &tool.output_schema {
            TsType::alias(
                format!("{}Result", base),
                schema_to_type(schema, schema, 0),
            )
        } else if tool.is_mcp() {
            mcp_result_type()
        } else {
            TsType::Unknown
        };

        let source = render_tool(tool, &args, &result);
        Self {
            tool_name: tool.name.clone(),
            description: tool.description.clone(),
            args,
            result,
            source,
        }
    }

    /// Callable type installed on the namespace
    pub fn function_type(&self) -> TsType {
        TsType::Function(Box::new(crate::types::FunctionType {
            params: vec![Field {
                name: "args".into(),
                ty: TsType::Object(self.args.clone()),
                optional: !self.args.has_required_fields(),
                description: None,
            }],
            ret: self.result.clone(),
        }))
    }

    fn uses_mcp_result(&self) -> bool {
        matches!(&self.result, TsType::Alias(name, _) if name == MCP_RESULT_TYPE)
    }
}

/// Declarations for a whole namespace
#[derive(Debug, Clone, PartialEq)]
pub struct Declarations {
    pub namespace: String,
    pub tools: BTreeMap<String, Arc<ToolSignature>>,
    pub source: String,
}

impl Declarations {
    /// Assemble the namespace from per-tool signatures
    pub fn assemble(
        namespace: impl Into<String>,
        signatures: impl IntoIterator<Item = Arc<ToolSignature>>,
    ) -> Self {
        let namespace = namespace.into();
        let tools: BTreeMap<String, Arc<ToolSignature>> = signatures
            .into_iter()
            .map(|sig| (sig.tool_name.clone(), sig))
            .collect();

        let mut source = String::from(CONSOLE_DECLARATION);
        if tools.values().any(|sig| sig.uses_mcp_result()) {
            source.push('\n');
            source.push_str(&render_mcp_result());
        }
        let _ = writeln!(source, "\ndeclare namespace {} {{", namespace);
        let mut first = true;
        for sig in tools.values() {
            if sig.source.is_empty() {
                continue;
            }
            if !first {
                source.push('\n');
            }
            first = false;
            source.push_str(&sig.source);
        }
        source.push_str("}\n");

        Self {
            namespace,
            tools,
            source,
        }
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSignature> {
        self.tools.get(name).map(|sig| sig.as_ref())
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }
}

impl fmt::Display for Declarations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Generate declarations for a set of tools, in name order
pub fn generate_declarations<'a>(
    namespace: &str,
    tools: impl IntoIterator<Item = &'a ToolDescriptor>,
) -> Declarations {
    let signatures = tools
        .into_iter()
        .map(|tool| Arc::new(ToolSignature::generate(tool)));
    Declarations::assemble(namespace, signatures)
}

/// `file_read` -> `FileRead`, `mcp__github__list_issues` -> `McpGithubListIssues`
pub fn pascal_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for segment in name.split(|c: char| !c.is_ascii_alphanumeric()) {
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, 'T');
    }
    if out.is_empty() {
        out.push_str("Tool");
    }
    out
}

/// Convert a JSON Schema into a type
///
/// `root` is the document local `$ref`s resolve against.
pub fn schema_to_type(schema: &Json, root: &Json, depth: usize) -> TsType {
    let obj = match schema {
        Json::Bool(true) => return TsType::Unknown,
        Json::Bool(false) => return TsType::Never,
        Json::Object(obj) => obj,
        _ => return TsType::Unknown,
    };

    if let Some(reference) = obj.get("$ref").and_then(Json::as_str) {
        if depth >= MAX_REF_DEPTH {
            return TsType::Unknown;
        }
        return match resolve_ref(root, reference) {
            Some(target) => schema_to_type(target, root, depth + 1),
            None => TsType::Unknown,
        };
    }

    if let Some(constant) = obj.get("const") {
        return json_literal(constant).map(TsType::Literal).unwrap_or(TsType::Unknown);
    }

    if let Some(Json::Array(values)) = obj.get("enum") {
        let literals: Option<Vec<TsType>> = values
            .iter()
            .map(|v| match v {
                Json::Null => Some(TsType::Null),
                other => json_literal(other).map(TsType::Literal),
            })
            .collect();
        return literals.map(TsType::union).unwrap_or(TsType::Unknown);
    }

    for key in ["anyOf", "oneOf"] {
        if let Some(Json::Array(variants)) = obj.get(key) {
            return TsType::union(variants.iter().map(|v| schema_to_type(v, root, depth + 1)));
        }
    }

    if let Some(Json::Array(parts)) = obj.get("allOf") {
        return merge_all_of(parts.iter().map(|p| schema_to_type(p, root, depth + 1)));
    }

    match obj.get("type") {
        Some(Json::String(ty)) => primitive_schema(ty, obj, root, depth),
        Some(Json::Array(types)) => TsType::union(
            types
                .iter()
                .filter_map(Json::as_str)
                .map(|ty| primitive_schema(ty, obj, root, depth)),
        ),
        _ if obj.contains_key("properties") => object_schema(obj, root, depth),
        _ if obj.contains_key("items") => array_schema(obj, root, depth),
        _ => TsType::Unknown,
    }
}

fn primitive_schema(
    ty: &str,
    obj: &serde_json::Map<String, Json>,
    root: &Json,
    depth: usize,
) -> TsType {
    match ty {
        "string" => TsType::String,
        "number" | "integer" => TsType::Number,
        "boolean" => TsType::Boolean,
        "null" => TsType::Null,
        "array" => array_schema(obj, root, depth),
        "object" => object_schema(obj, root, depth),
        _ => TsType::Unknown,
    }
}

fn array_schema(obj: &serde_json::Map<String, Json>, root: &Json, depth: usize) -> TsType {
    let element = match obj.get("items") {
        Some(items @ Json::Object(_)) => schema_to_type(items, root, depth + 1),
        Some(Json::Array(tuple)) => {
            TsType::union(tuple.iter().map(|item| schema_to_type(item, root, depth + 1)))
        }
        _ => TsType::Unknown,
    };
    TsType::array(element)
}

fn object_schema(obj: &serde_json::Map<String, Json>, root: &Json, depth: usize) -> TsType {
    let required: Vec<&str> = obj
        .get("required")
        .and_then(Json::as_array)
        .map(|names| names.iter().filter_map(Json::as_str).collect())
        .unwrap_or_default();

    let mut fields = Vec::new();
    if let Some(Json::Object(properties)) = obj.get("properties") {
        for (name, prop) in properties {
            let ty = schema_to_type(prop, root, depth + 1);
            let mut field = if required.contains(&name.as_str()) {
                Field::required(name.clone(), ty)
            } else {
                Field::optional(name.clone(), ty)
            };
            if let Some(description) = prop.get("description").and_then(Json::as_str) {
                field = field.with_description(description);
            }
            fields.push(field);
        }
    }

    // Only an explicit `additionalProperties` opens the shape.
    let mut object = ObjectType::new(fields);
    match obj.get("additionalProperties") {
        Some(Json::Bool(true)) => object = object.with_index(TsType::Unknown),
        Some(extra @ Json::Object(_)) => {
            object = object.with_index(schema_to_type(extra, root, depth + 1))
        }
        _ => {}
    }
    if object.fields.is_empty() && object.index.is_none() && !obj.contains_key("properties") {
        object = object.with_index(TsType::Unknown);
    }
    TsType::Object(object)
}

fn merge_all_of(parts: impl Iterator<Item = TsType>) -> TsType {
    let mut merged = ObjectType::default();
    for part in parts {
        match part.resolved() {
            TsType::Object(obj) => {
                for field in &obj.fields {
                    if merged.field(&field.name).is_none() {
                        merged.fields.push(field.clone());
                    }
                }
                if merged.index.is_none() {
                    merged.index = obj.index.clone();
                }
            }
            _ => return TsType::Unknown,
        }
    }
    TsType::Object(merged)
}

fn resolve_ref<'a>(root: &'a Json, reference: &str) -> Option<&'a Json> {
    let pointer = reference.strip_prefix('#')?;
    if pointer.is_empty() {
        return Some(root);
    }
    root.pointer(pointer)
}

fn json_literal(value: &Json) -> Option<Literal> {
    match value {
        Json::String(s) => Some(Literal::String(s.clone())),
        Json::Number(n) => n.as_f64().map(Literal::Number),
        Json::Bool(b) => Some(Literal::Bool(*b)),
        _ => None,
    }
}

fn mcp_result_type() -> TsType {
    let text = ObjectType::new(vec![
        Field::required("type", TsType::Literal(Literal::String("text".into()))),
        Field::required("text", TsType::String),
    ]);
    let image = ObjectType::new(vec![
        Field::required("type", TsType::Literal(Literal::String("image".into()))),
        Field::required("data", TsType::String),
        Field::required("mimeType", TsType::String),
    ]);
    let resource = ObjectType::new(vec![
        Field::required("type", TsType::Literal(Literal::String("resource".into()))),
        Field::required(
            "resource",
            TsType::Object(ObjectType::new(vec![
                Field::required("uri", TsType::String),
                Field::optional("text", TsType::String),
                Field::optional("blob", TsType::String),
                Field::optional("mimeType", TsType::String),
            ])),
        ),
    ]);
    TsType::alias(
        MCP_RESULT_TYPE,
        TsType::Object(ObjectType::new(vec![
            Field::required(
                "content",
                TsType::array(TsType::union([
                    TsType::Object(text),
                    TsType::Object(image),
                    TsType::Object(resource),
                ])),
            ),
            Field::optional("isError", TsType::Boolean),
        ])),
    )
}

fn render_mcp_result() -> String {
    format!(
        "interface {} {{
  content: Array<
    | {{ type: \"text\"; text: string }}
    | {{ type: \"image\"; data: string; mimeType: string }}
    | {{ type: \"resource\"; resource: {{ uri: string; text?: string; blob?: string; mimeType?: string }} }}
  >;
  isError?: boolean;
}}
",
        MCP_RESULT_TYPE
    )
}

fn render_doc(out: &mut String, indent: &str, text: &str) {
    let lines: Vec<&str> = text.trim().lines().collect();
    match lines.as_slice() {
        [] => {}
        [single] => {
            let _ = writeln!(out, "{}/** {} */", indent, single.trim());
        }
        many => {
            let _ = writeln!(out, "{}/**", indent);
            for line in many {
                let line = line.trim_end();
                if line.is_empty() {
                    let _ = writeln!(out, "{} *", indent);
                } else {
                    let _ = writeln!(out, "{} * {}", indent, line);
                }
            }
            let _ = writeln!(out, "{} */", indent);
        }
    }
}

fn render_tool(tool: &ToolDescriptor, args: &ObjectType, result: &TsType) -> String {
    if !is_identifier(&tool.name) {
        tracing::warn!(tool = %tool.name, "tool name is not an identifier; omitted from declarations");
        return String::new();
    }

    let mut out = String::new();
    let args_name = args.name.clone().unwrap_or_else(|| "Args".into());

    let _ = writeln!(out, "  interface {} {{", args_name);
    for field in &args.fields {
        if let Some(description) = &field.description {
            render_doc(&mut out, "    ", description);
        }
        let _ = writeln!(
            out,
            "    {}{}: {};",
            property_key(&field.name),
            if field.optional { "?" } else { "" },
            field.ty
        );
    }
    if let Some(index) = &args.index {
        let _ = writeln!(out, "    [key: string]: {};", index);
    }
    out.push_str("  }\n");

    let result_name = match result {
        TsType::Alias(name, target) if name != MCP_RESULT_TYPE => {
            match target.as_ref() {
                TsType::Union(members) => {
                    let _ = writeln!(out, "\n  type {} =", name);
                    for (i, member) in members.iter().enumerate() {
                        let end = if i + 1 == members.len() { ";" } else { "" };
                        let _ = writeln!(out, "    | {}{}", member, end);
                    }
                }
                other => {
                    let _ = writeln!(out, "\n  type {} = {};", name, other);
                }
            }
            name.clone()
        }
        other => other.to_string(),
    };

    out.push('\n');
    render_doc(&mut out, "  ", &tool.description);
    let _ = writeln!(
        out,
        "  function {}(args{}: {}): {};",
        tool.name,
        if args.has_required_fields() { "" } else { "?" },
        args_name,
        result_name
    );
    out
}
