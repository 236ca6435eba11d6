use crate::analyzer::*;

fn analyze(code: &str) -> AnalysisResult {
    analyze_code(code).unwrap()
}

fn count(result: &AnalysisResult, kind: AnalysisErrorKind) -> usize {
    result.errors.iter().filter(|e| e.kind == kind).count()
}

#[test]
fn test_valid_code_passes() {
    let result = analyze("const x = 1;\nconst y = 2;\nreturn x + y;");
    assert!(result.valid);
    assert!(result.errors.is_empty());
}

#[test]
fn test_bare_return_allowed() {
    let result = analyze("const x = mux.file_read({ path: 'a.txt' });\nreturn x;");
    assert!(result.valid);
}

#[test]
fn test_syntax_error_stops_analysis() {
    let result = analyze("const a = process.env;\nconst y = 2 +\n");
    assert!(!result.valid);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, AnalysisErrorKind::Syntax);
}

#[test]
fn test_unclosed_brace() {
    let result = analyze("if (true) {\n  const x = 1;\n");
    assert!(!result.valid);
    assert_eq!(result.errors[0].kind, AnalysisErrorKind::Syntax);
    // Detected past the end of the caller's code.
    if let Some(line) = result.errors[0].line {
        assert!(line <= 3);
    }
}

#[test]
fn test_invalid_token() {
    let result = analyze("const x = @invalid;");
    assert_eq!(result.errors[0].kind, AnalysisErrorKind::Syntax);
}

#[test]
fn test_await_gets_specific_message() {
    let result = analyze("const x = await mux.bash({ script: 'ls' });");
    assert!(!result.valid);
    assert_eq!(result.errors.len(), 1);
    let message = &result.errors[0].message;
    assert!(message.contains("await"));
    assert!(message.contains("not supported"));
    assert!(message.contains("mux.*"));
}

#[test]
fn test_await_message_uses_configured_namespace() {
    let analyzer = StaticAnalyzer::new("tools").unwrap();
    let result = analyzer.analyze("await tools.bash({});").unwrap();
    assert!(result.errors[0].message.contains("tools.*"));
}

#[test]
fn test_unrelated_syntax_error_keeps_its_message() {
    for code in [
        "console.log(\"please await x\");\nconst = ;",
        "const s = 'await x';\nif (s) { return 1;",
    ] {
        let result = analyze(code);
        assert_eq!(result.errors.len(), 1, "{}", code);
        assert_eq!(result.errors[0].kind, AnalysisErrorKind::Syntax);
        assert!(
            !result.errors[0].message.contains("not supported"),
            "{}: {}",
            code,
            result.errors[0].message
        );
    }
}

#[test]
fn test_dynamic_import() {
    let result = analyze("const mod = import(\"./module.js\");");
    assert!(!result.valid);
    assert_eq!(count(&result, AnalysisErrorKind::UnavailableConstruct), 1);
    assert!(result.errors[0].message.contains("import()"));
}

#[test]
fn test_require_reported_once_as_construct() {
    let result = analyze("const fs = require(\"fs\");");
    assert!(!result.valid);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, AnalysisErrorKind::UnavailableConstruct);
    assert!(result.errors[0].message.contains("require()"));
    assert!(result.errors[0].message.contains("mux.*"));
}

#[test]
fn test_each_require_call_site_reported() {
    let result = analyze("const a = require('a');\nconst b = require('b');");
    assert_eq!(count(&result, AnalysisErrorKind::UnavailableConstruct), 2);
    assert_eq!(result.errors[0].line, Some(1));
    assert_eq!(result.errors[1].line, Some(2));
}

#[test]
fn test_member_named_require_is_not_a_construct() {
    let result = analyze("const loader = { load: (x) => x };\nreturn loader.require(1);");
    assert_eq!(count(&result, AnalysisErrorKind::UnavailableConstruct), 0);
}

#[test]
fn test_require_in_string_is_a_known_false_positive() {
    let result = analyze("const msg = \"Use require() to import modules\";\nconsole.log(msg);");
    assert!(!result.valid);
    assert!(result.errors.iter().any(|e| e.message.contains("require()")));
}

#[test]
fn test_process_reference() {
    let result = analyze("const a = process.env;");
    assert!(!result.valid);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, AnalysisErrorKind::UnavailableGlobal);
    assert_eq!(result.errors[0].message, "'process' is not available in the sandbox");
}

#[test]
fn test_browser_globals() {
    for code in ["window.alert(\"hi\");", "fetch(\"https://example.com\");", "document.getElementById(\"x\");"] {
        let result = analyze(code);
        assert!(!result.valid, "{}", code);
        assert_eq!(count(&result, AnalysisErrorKind::UnavailableGlobal), 1);
    }
}

#[test]
fn test_one_error_per_distinct_global() {
    let result = analyze(
        "const a = process.env;\nconst b = window.location;\nconst c = fetch(\"url\");\nconst d = process.cwd();",
    );
    assert_eq!(count(&result, AnalysisErrorKind::UnavailableGlobal), 3);
    let process: Vec<_> = result
        .errors
        .iter()
        .filter(|e| e.message.contains("process"))
        .collect();
    assert_eq!(process.len(), 1);
}

#[test]
fn test_object_key_is_not_a_reference() {
    let result = analyze("const o = {process: 1};");
    assert!(result.valid);
}

#[test]
fn test_member_name_is_not_a_reference() {
    let result = analyze("const obj = { foo: \"bar\" };\nreturn obj.process;");
    assert!(result.valid);
}

#[test]
fn test_string_content_is_not_a_reference() {
    let result = analyze("const msg = \"The process is complete\";\nconsole.log(msg);");
    assert!(result.valid);
}

#[test]
fn test_shorthand_property_is_a_reference() {
    let result = analyze("const o = { process };");
    assert_eq!(count(&result, AnalysisErrorKind::UnavailableGlobal), 1);
}

#[test]
fn test_declaration_names_are_not_references() {
    let result = analyze(
        "const window = 1;\nfunction fetch(navigator) { return 1; }\ntry { } catch (document) { }\nreturn window;",
    );
    // The later use of `window` is a local, but the scan is not scope-aware.
    assert_eq!(count(&result, AnalysisErrorKind::UnavailableGlobal), 1);
    assert!(result.errors[0].message.contains("'window'"));
    assert_eq!(result.errors[0].line, Some(4));
}

#[test]
fn test_global_line_and_column() {
    let result = analyze("const x = 1;\nconst y = 2;\nconst env = process.env;");
    let error = &result.errors[0];
    assert_eq!(error.line, Some(3));
    assert_eq!(error.column, Some(13));
}

#[test]
fn test_construct_line() {
    let result = analyze("const x = 1;\nconst y = 2;\nrequire(\"fs\");\nconst z = 3;");
    let error = result
        .errors
        .iter()
        .find(|e| e.message.contains("require"))
        .unwrap();
    assert_eq!(error.line, Some(3));
}

#[test]
fn test_allowed_engine_features() {
    for code in [
        "const x = eval(\"1 + 1\");",
        "const fn = new Function(\"a\", \"b\", \"return a + b\");",
        "const pi = globalThis.Math.PI;",
        "const p = new Proxy({}, {});",
        "const x = Reflect.get({a: 1}, \"a\");",
    ] {
        assert!(analyze(code).valid, "{}", code);
    }
}

#[test]
fn test_realistic_scripts() {
    let scripts = [
        "const files = [\"a.txt\", \"b.txt\"];\nconst results = [];\nfor (const file of files) {\n  results.push(mux.file_read({ path: file }));\n}\nreturn results;",
        "const now = new Date();\nconst random = Math.floor(Math.random() * 100);\nconsole.log(\"Time:\", now.toISOString());\nreturn random;",
        "try {\n  return mux.file_read({ path: \"maybe.txt\" });\n} catch (err) {\n  console.error(\"failed:\", err.message);\n  return null;\n}",
        "const text = \"error: x\";\nconst matches = text.match(/error:.*/gi);\nreturn matches || [];",
    ];
    for code in scripts {
        let result = analyze(code);
        assert!(result.valid, "{}: {:?}", code, result.errors);
    }
}

#[test]
fn test_empty_and_comment_only() {
    assert!(analyze("").valid);
    assert!(analyze("   \n\n  \t  ").valid);
    assert!(analyze("// comment\n/* block\n comment */").valid);
}

#[test]
fn test_analysis_is_idempotent() {
    let code = "const a = process.env;\nrequire('x');";
    assert_eq!(analyze(code), analyze(code));
}

#[test]
fn test_concurrent_analysis() {
    let handles: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                let code = if i % 2 == 0 { "return 1;" } else { "return window;" };
                (i, analyze_code(code).unwrap().valid)
            })
        })
        .collect();
    for handle in handles {
        let (i, valid) = handle.join().unwrap();
        assert_eq!(valid, i % 2 == 0);
    }
}

#[test]
fn test_error_serializes_with_type_tag() {
    let result = analyze("const a = process.env;");
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["errors"][0]["type"], "unavailable_global");
    assert_eq!(json["errors"][0]["line"], 1);
}
