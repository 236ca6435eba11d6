use crate::analyzer::{AnalysisErrorKind, StaticAnalyzer};
use crate::cache::DeclarationCache;
use crate::validator::TypeValidator;
use serde_json::json;
use toolscript_types::ToolDescriptor;

fn registry() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            "file_read",
            "Read a file from the workspace",
            json!({
                "type": "object",
                "properties": {"filePath": {"type": "string", "description": "Path to read"}},
                "required": ["filePath"]
            }),
        ),
        ToolDescriptor::new(
            "mcp__github__list_issues",
            "List issues",
            json!({"type": "object", "properties": {"repo": {"type": "string"}}, "required": ["repo"]}),
        ),
    ]
}

#[test]
fn test_pipeline_accepts_well_typed_script() {
    let cache = DeclarationCache::new("mux");
    let decls = cache.declarations(&registry());
    let analyzer = StaticAnalyzer::new("mux").unwrap();
    let validator = TypeValidator::new().unwrap();

    let code = "const f = mux.file_read({ filePath: \"a.txt\" });\nconst issues = mux.mcp__github__list_issues({ repo: \"x/y\" });\nconsole.log(issues.content);\nreturn f;";
    let result = analyzer.analyze_with_types(code, &validator, &decls).unwrap();
    assert!(result.valid, "{:?}", result.errors);
}

#[test]
fn test_pipeline_reports_type_errors_after_analysis_errors() {
    let cache = DeclarationCache::new("mux");
    let decls = cache.declarations(&registry());
    let analyzer = StaticAnalyzer::new("mux").unwrap();
    let validator = TypeValidator::new().unwrap();

    let code = "const env = process.env;\nreturn mux.file_read({ path: \"x\" });";
    let result = analyzer.analyze_with_types(code, &validator, &decls).unwrap();
    assert!(!result.valid);
    assert_eq!(result.errors[0].kind, AnalysisErrorKind::UnavailableGlobal);
    let type_errors: Vec<_> = result
        .errors
        .iter()
        .filter(|e| e.kind == AnalysisErrorKind::TypeError)
        .collect();
    let path = type_errors
        .iter()
        .find(|e| e.message.contains("'path'"))
        .unwrap();
    assert_eq!(path.line, Some(2));
    // The validator has no special knowledge of host globals.
    assert!(type_errors
        .iter()
        .any(|e| e.message == "Cannot find name 'process'." && e.line == Some(1)));
}

#[test]
fn test_syntax_error_skips_type_validation() {
    let cache = DeclarationCache::new("mux");
    let decls = cache.declarations(&registry());
    let analyzer = StaticAnalyzer::new("mux").unwrap();
    let validator = TypeValidator::new().unwrap();

    let result = analyzer
        .analyze_with_types("const x = await mux.file_read({ path: 1 });", &validator, &decls)
        .unwrap();
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, AnalysisErrorKind::Syntax);
}

#[test]
fn test_declaration_text_mentions_every_tool_once() {
    let cache = DeclarationCache::new("mux");
    let decls = cache.declarations(&registry());
    assert_eq!(decls.source.matches("declare var console").count(), 1);
    assert!(decls.source.contains("function file_read(args: FileReadArgs): unknown;"));
    assert!(decls
        .source
        .contains("function mcp__github__list_issues(args: McpGithubListIssuesArgs): MCPCallToolResult;"));
}

#[test]
fn test_changed_registry_changes_validation() {
    let cache = DeclarationCache::new("mux");
    let validator = TypeValidator::new().unwrap();
    let code = "return mux.file_read({ path: \"a.txt\" });";

    let before = cache.declarations(&registry());
    assert!(!validator.validate(code, &before).unwrap().valid);

    let mut tools = registry();
    tools[0].input_schema = json!({
        "type": "object",
        "properties": {"path": {"type": "string"}},
        "required": ["path"]
    });
    let after = cache.declarations(&tools);
    assert!(validator.validate(code, &after).unwrap().valid);
    assert_eq!(cache.stats().regenerated, 3);
}
