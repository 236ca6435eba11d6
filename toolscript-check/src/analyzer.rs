//! Static analysis of guest code
//!
//! Runs before anything reaches the interpreter:
//!
//! 1. **Syntax**: QuickJS compiles the code as a function body. A failure
//!    here ends the analysis, since later checks would only add noise.
//! 2. **Constructs**: `import(` and `require(` call sites, found by pattern.
//!    The pattern does not know about string literals, so
//!    `"use require() here"` is reported too.
//! 3. **Globals**: references to host-runtime globals, found by walking the
//!    syntax tree so object keys, member names and string contents are not
//!    mistaken for references.

use crate::error::{line_col, line_count, Result, SourcePosition};
use crate::globals::{is_unavailable_global, unavailable_global_message, DEFAULT_NAMESPACE};
use crate::signatures::Declarations;
use crate::syntax::{first_error_node, node_text, probe_syntax, ScriptParser};
use crate::validator::TypeValidator;
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tree_sitter::Node;

static AWAIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bawait\s+\w").expect("valid await regex"));

const AWAIT_SYNTAX_MESSAGE: &str = "expecting ';'";

static CONSTRUCT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(import|require)\s*\(").expect("valid module regex"));

/// Category of an analysis error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisErrorKind {
    Syntax,
    UnavailableGlobal,
    UnavailableConstruct,
    /// Merged in from the type validator
    TypeError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisError {
    #[serde(rename = "type")]
    pub kind: AnalysisErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
}

impl AnalysisError {
    fn new(kind: AnalysisErrorKind, message: impl Into<String>, line: Option<usize>) -> Self {
        Self {
            kind,
            message: message.into(),
            line,
            column: None,
        }
    }

    fn at(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub valid: bool,
    pub errors: Vec<AnalysisError>,
}

impl AnalysisResult {
    fn from_errors(errors: Vec<AnalysisError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Pre-execution checker for guest code
pub struct StaticAnalyzer {
    namespace: String,
    parser: ScriptParser,
}

impl StaticAnalyzer {
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        Ok(Self {
            namespace: namespace.into(),
            parser: ScriptParser::new()?,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn analyze(&self, code: &str) -> Result<AnalysisResult> {
        if let Some(error) = self.check_syntax(code)? {
            tracing::debug!(message = %error.message, "analysis rejected: syntax");
            return Ok(AnalysisResult::from_errors(vec![error]));
        }

        let mut errors = self.check_constructs(code);
        errors.extend(self.check_globals(code)?);

        let result = AnalysisResult::from_errors(errors);
        tracing::debug!(valid = result.valid, errors = result.errors.len(), "analysis finished");
        Ok(result)
    }

    /// [`Self::analyze`] followed by type validation against `declarations`
    ///
    /// Type errors are appended with kind [`AnalysisErrorKind::TypeError`].
    /// Validation is skipped when the code does not compile.
    pub fn analyze_with_types(
        &self,
        code: &str,
        validator: &TypeValidator,
        declarations: &Declarations,
    ) -> Result<AnalysisResult> {
        let mut result = self.analyze(code)?;
        if result
            .errors
            .iter()
            .any(|e| e.kind == AnalysisErrorKind::Syntax)
        {
            return Ok(result);
        }
        let validation = validator.validate(code, declarations)?;
        result
            .errors
            .extend(validation.errors.into_iter().map(|e| AnalysisError {
                kind: AnalysisErrorKind::TypeError,
                message: e.message,
                line: e.line,
                column: e.column,
            }));
        result.valid = result.errors.is_empty();
        Ok(result)
    }

    fn check_syntax(&self, code: &str) -> Result<Option<AnalysisError>> {
        let Some(diagnostic) = probe_syntax(code)? else {
            return Ok(None);
        };

        // `await x` in a plain function parses as the identifier `await`
        // followed by a stray expression.
        let message = if diagnostic.message == AWAIT_SYNTAX_MESSAGE
            && AWAIT_PATTERN.is_match(code)
        {
            format!(
                "`await` is not supported - {}.* functions return results directly (no await needed)",
                self.namespace
            )
        } else {
            diagnostic.message
        };

        // QuickJS does not always locate the problem; fall back to the CST.
        let line = match diagnostic.line {
            Some(line) => Some(line),
            None => {
                let tree = self.parser.parse(code)?;
                first_error_node(tree.root_node())
                    .map(|node| node.start_position().row + 1)
                    .filter(|line| *line <= line_count(code))
            }
        };

        Ok(Some(AnalysisError::new(AnalysisErrorKind::Syntax, message, line)))
    }

    fn check_constructs(&self, code: &str) -> Vec<AnalysisError> {
        CONSTRUCT_PATTERN
            .captures_iter(code)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let preceding = code[..whole.start()].chars().next_back();
                if preceding.is_some_and(|c| c == '.' || is_identifier_char(c)) {
                    return None;
                }
                let message = match caps.get(1)?.as_str() {
                    "import" => "Dynamic import() is not available in the sandbox".to_string(),
                    _ => format!(
                        "require() is not available in the sandbox - use {}.* tools instead",
                        self.namespace
                    ),
                };
                let (line, column) = line_col(code, whole.start());
                Some(
                    AnalysisError::new(AnalysisErrorKind::UnavailableConstruct, message, Some(line))
                        .at(column),
                )
            })
            .collect()
    }

    fn check_globals(&self, code: &str) -> Result<Vec<AnalysisError>> {
        let tree = self.parser.parse(code)?;
        let mut scan = GlobalScan {
            source: code,
            seen: HashSet::new(),
            errors: Vec::new(),
        };
        scan.visit(tree.root_node());
        Ok(scan.errors)
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

struct GlobalScan<'s> {
    source: &'s str,
    seen: HashSet<String>,
    errors: Vec<AnalysisError>,
}

impl GlobalScan<'_> {
    fn visit(&mut self, node: Node<'_>) {
        match node.kind() {
            // Object keys and member names are `property_identifier`, labels
            // are `statement_identifier` and string contents are
            // `string_fragment`, so only these two kinds can be references.
            "identifier" | "shorthand_property_identifier" => self.check(node),
            _ => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    self.visit(child);
                }
            }
        }
    }

    fn check(&mut self, node: Node<'_>) {
        let name = node_text(node, self.source);
        // Reported by the construct check.
        if name == "require" || !is_unavailable_global(name) || self.seen.contains(name) {
            return;
        }
        if is_declaration_name(node) {
            return;
        }
        self.seen.insert(name.to_string());
        let position = SourcePosition::from_point(self.source, node.start_position());
        self.errors.push(
            AnalysisError::new(
                AnalysisErrorKind::UnavailableGlobal,
                unavailable_global_message(name),
                Some(position.line),
            )
            .at(position.column),
        );
    }
}

/// Whether an identifier names the thing being declared rather than using it
fn is_declaration_name(node: Node<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return false;
    };
    let field = match parent.kind() {
        "variable_declarator"
        | "function_declaration"
        | "generator_function_declaration"
        | "function_expression"
        | "class_declaration" => "name",
        "required_parameter" | "optional_parameter" => "pattern",
        "arrow_function" => "parameter",
        "catch_clause" => "parameter",
        "for_in_statement" if parent.child_by_field_name("kind").is_some() => "left",
        _ => return false,
    };
    parent.child_by_field_name(field) == Some(node)
}

static DEFAULT_ANALYZER: OnceCell<StaticAnalyzer> = OnceCell::new();

/// Analyze `code` with the default namespace
pub fn analyze_code(code: &str) -> Result<AnalysisResult> {
    DEFAULT_ANALYZER
        .get_or_try_init(|| StaticAnalyzer::new(DEFAULT_NAMESPACE))?
        .analyze(code)
}
