//! Guest source parsing
//!
//! Two parsers look at guest code. Tree-sitter (TypeScript grammar, which is
//! a superset of the JavaScript guest language) yields the concrete syntax
//! tree the analyzer and validator walk. QuickJS, the engine that will run
//! the code, is the authority on whether the code compiles at all.

use crate::error::{line_count, CheckError, Result};
use parking_lot::Mutex;
use rquickjs::{qjs, Context, Ctx, Runtime};
use std::cell::RefCell;
use std::ffi::CString;
use tree_sitter::{Node, Parser, Tree};

/// Thread-safe tree-sitter parser for guest code
pub struct ScriptParser {
    parser: Mutex<Parser>,
}

impl ScriptParser {
    pub fn new() -> Result<Self> {
        let mut parser = Parser::new();
        parser.set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into())?;
        Ok(Self {
            parser: Mutex::new(parser),
        })
    }

    pub fn parse(&self, source: &str) -> Result<Tree> {
        let mut parser = self.parser.lock();
        parser.parse(source, None).ok_or(CheckError::ParseFailed)
    }
}

/// Text of a node
pub fn node_text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

/// First ERROR or MISSING node in document order
pub fn first_error_node(root: Node<'_>) -> Option<Node<'_>> {
    if !root.has_error() {
        return None;
    }
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        if child.is_error() || child.is_missing() {
            return Some(child);
        }
        if child.has_error() {
            if let Some(found) = first_error_node(child) {
                return Some(found);
            }
        }
    }
    if root.is_error() || root.is_missing() {
        Some(root)
    } else {
        None
    }
}

/// A compile error reported by QuickJS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxDiagnostic {
    pub message: String,
    /// 1-indexed line in the caller's code, when it falls inside it
    pub line: Option<usize>,
}

thread_local! {
    static PROBE_RUNTIME: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

const PROBE_MEMORY_LIMIT: usize = 32 * 1024 * 1024;

fn new_probe_runtime() -> Result<Runtime> {
    let runtime = Runtime::new().map_err(|e| CheckError::Probe(e.to_string()))?;
    runtime.set_memory_limit(PROBE_MEMORY_LIMIT);
    Ok(runtime)
}

/// Compile `code` as a function body with QuickJS without calling it
///
/// The wrapper opens on the caller's first line, so QuickJS line numbers
/// are caller line numbers. The closing brace gets its own line so a trailing
/// line comment cannot swallow it. Lines past the end of the caller's code (errors
/// detected at the closing brace) are dropped. The runtime is cached per
/// thread; every probe gets a fresh context so nothing carries over between
/// calls.
pub fn probe_syntax(code: &str) -> Result<Option<SyntaxDiagnostic>> {
    PROBE_RUNTIME.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(new_probe_runtime()?);
        }
        let Some(runtime) = slot.as_ref() else {
            return Err(CheckError::Probe("probe runtime unavailable".into()));
        };
        let context = Context::full(runtime).map_err(|e| CheckError::Probe(e.to_string()))?;
        let wrapped = format!("(function() {{ {}\n}})", code);
        let outcome = context.with(|ctx| -> Result<Option<(String, Option<usize>)>> {
            if wrapped.contains('\0') {
                return Ok(Some(("unexpected NUL character".to_string(), None)));
            }
            if compile_only(&ctx, &wrapped)? {
                return Ok(None);
            }
            let exception = ctx.catch();
            if is_syntax_error(&exception) {
                Ok(Some(describe_exception(&exception)))
            } else {
                Err(CheckError::Probe(describe_exception(&exception).0))
            }
        });
        drop(context);
        runtime.run_gc();
        let diagnostic = outcome?.map(|(message, raw_line)| SyntaxDiagnostic {
            message,
            line: raw_line.filter(|line| *line >= 1 && *line <= line_count(code)),
        });
        Ok(diagnostic)
    })
}

/// Compile global script code without evaluating it
///
/// Returns whether compilation succeeded. On failure the pending exception
/// is left on the context for `Ctx::catch`.
fn compile_only(ctx: &Ctx<'_>, source: &str) -> Result<bool> {
    let source = CString::new(source).map_err(|e| CheckError::Probe(e.to_string()))?;
    let flags =
        qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_STRICT | qjs::JS_EVAL_FLAG_COMPILE_ONLY;
    let raw = ctx.as_raw().as_ptr();
    // SAFETY: `ctx` holds the runtime lock for the whole call, the source
    // buffer outlives `JS_Eval`, and the compiled function object is owned
    // here and released before returning.
    let compiled = unsafe {
        let value = qjs::JS_Eval(
            raw,
            source.as_ptr(),
            source.as_bytes().len() as _,
            c"analysis.js".as_ptr(),
            flags as _,
        );
        let failed = qjs::JS_IsException(value);
        qjs::JS_FreeValue(raw, value);
        !failed
    };
    Ok(compiled)
}

fn is_syntax_error(exception: &rquickjs::Value<'_>) -> bool {
    exception
        .as_object()
        .and_then(|object| object.get::<_, Option<String>>("name").ok().flatten())
        .is_some_and(|name| name == "SyntaxError")
}

/// Message and raw line of a caught QuickJS exception
fn describe_exception(exception: &rquickjs::Value<'_>) -> (String, Option<usize>) {
    let Some(object) = exception.as_object() else {
        return (format!("{:?}", exception), None);
    };
    let message: Option<String> = object.get("message").ok();
    let line = object
        .get::<_, Option<i32>>("lineNumber")
        .ok()
        .flatten()
        .and_then(|n| usize::try_from(n).ok())
        .or_else(|| {
            object
                .get::<_, Option<String>>("stack")
                .ok()
                .flatten()
                .and_then(|stack| line_from_stack(&stack))
        });
    (message.unwrap_or_else(|| "SyntaxError".to_string()), line)
}

/// Extract the first `:<line>` location from a QuickJS stack trace
fn line_from_stack(stack: &str) -> Option<usize> {
    stack.lines().find_map(|frame| {
        let frame = frame.trim().trim_end_matches(')');
        let mut parts = frame.rsplit(':');
        let last = parts.next()?;
        let line = match parts.next() {
            // `file:line:col`
            Some(prev) if prev.chars().all(|c| c.is_ascii_digit()) && !prev.is_empty() => prev,
            _ => last,
        };
        line.parse().ok()
    })
}
