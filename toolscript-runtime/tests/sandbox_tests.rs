//! Integration tests for the QuickJS sandbox

use num_bigint::BigInt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use toolscript_runtime::{
    ConsoleLevel, HostCallContext, HostFunction, RuntimeError, Sandbox, SandboxEvent,
    SandboxLimits, Value,
};
use toolscript_types::SharedValue;

fn host<F, Fut>(f: F) -> F
where
    F: Fn(Vec<Value>, HostCallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    f
}

fn sum(args: &[Value]) -> Value {
    Value::from(args.iter().filter_map(Value::as_f64).sum::<f64>())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_plain_return() {
    let sandbox = Sandbox::create().unwrap();
    let result = sandbox.eval("return 1 + 1;").await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(Value::from(2)));
    assert!(result.tool_calls.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_host_call_result_and_trace() {
    let sandbox = Sandbox::create().unwrap();
    sandbox
        .register_function("add", host(|args, _cx| async move { anyhow::Ok(sum(&args)) }))
        .unwrap();

    let result = sandbox.eval("return add(10, 20);").await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(Value::from(30)));
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(result.tool_calls[0].tool_name, "add");
    assert_eq!(result.tool_calls[0].args, Value::array([Value::from(10), Value::from(20)]));
    assert_eq!(result.tool_calls[0].result, Some(Value::from(30)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_keeps_partial_trace() {
    let sandbox = Sandbox::create().unwrap();
    sandbox
        .register_function("succeed", host(|_args, _cx| async move { anyhow::Ok(Value::from("ok")) }))
        .unwrap();
    sandbox
        .register_function(
            "fail",
            host(|_args, _cx| async move { Err::<Value, _>(anyhow::anyhow!("tool exploded")) }),
        )
        .unwrap();

    let result = sandbox.eval("succeed(); fail(); return 'unreachable';").await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Error: tool exploded"));
    assert_eq!(result.tool_calls.len(), 2);
    assert_eq!(result.tool_calls[0].result, Some(Value::from("ok")));
    assert_eq!(result.tool_calls[1].error.as_deref(), Some("tool exploded"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_host_errors_are_catchable() {
    let sandbox = Sandbox::create().unwrap();
    sandbox
        .register_function("fail", host(|_args, _cx| async move { Err::<Value, _>(anyhow::anyhow!("nope")) }))
        .unwrap();

    let result = sandbox
        .eval("try { fail(); } catch (e) { return e instanceof Error ? e.message : 'not an error'; }")
        .await;
    assert_eq!(result.result, Some(Value::from("nope")));
    assert!(!result.tool_calls[0].is_success());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_host_calls_settle_in_program_order() {
    let sandbox = Sandbox::create().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    sandbox
        .register_function(
            "step",
            host(move |args, _cx| {
                let sink = Arc::clone(&sink);
                async move {
                    let n = args.first().and_then(Value::as_f64).unwrap_or_default();
                    // Later steps finish faster, so only suspension keeps them ordered.
                    tokio::time::sleep(Duration::from_millis(60 - 20 * n as u64)).await;
                    sink.lock().push(n as i64);
                    anyhow::Ok(Value::from(n))
                }
            }),
        )
        .unwrap();

    let result = sandbox
        .eval("const out = []; for (let i = 0; i < 3; i++) out.push(step(i)); return out;")
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(*log.lock(), vec![0, 1, 2]);
    let args: Vec<_> = result.tool_calls.iter().map(|c| c.args.clone()).collect();
    assert_eq!(args, vec![Value::from(0), Value::from(1), Value::from(2)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_infinite_loop_times_out() {
    let sandbox = Sandbox::create().unwrap();
    sandbox.set_limits(SandboxLimits::new().with_timeout_ms(100)).unwrap();

    let started = Instant::now();
    let result = sandbox.eval("while (true) {}").await;
    assert!(!result.success);
    assert!(result.is_timeout(), "{:?}", result.error);
    assert_eq!(result.error.as_deref(), Some("Execution timeout: exceeded 100ms"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_during_host_wait() {
    let sandbox = Sandbox::create().unwrap();
    sandbox.set_limits(SandboxLimits::new().with_timeout_ms(100)).unwrap();
    sandbox
        .register_function(
            "slow",
            host(|_args, _cx| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                anyhow::Ok(Value::from("late"))
            }),
        )
        .unwrap();

    let result = sandbox.eval("const a = slow(); const b = slow(); return [a, b];").await;
    assert!(!result.success);
    assert!(result.is_timeout(), "{:?}", result.error);
    // The call in flight at the deadline still completes.
    assert_eq!(result.tool_calls[0].result, Some(Value::from("late")));
    assert!(result.tool_calls.iter().skip(1).all(|c| !c.is_success()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_memory_limit_fails_the_run_not_the_process() {
    let sandbox = Sandbox::create().unwrap();
    sandbox
        .set_limits(
            SandboxLimits::new()
                .with_memory_bytes(8 * 1024 * 1024)
                .with_timeout(Duration::from_secs(30)),
        )
        .unwrap();

    let result = sandbox
        .eval("const a = []; while (true) a.push('x'.repeat(1024) + a.length); return a.length;")
        .await;
    assert!(!result.success);
    assert!(!result.is_timeout(), "{:?}", result.error);

    let again = sandbox.eval("return 'still alive';").await;
    assert_eq!(again.result, Some(Value::from("still alive")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispose_is_idempotent() {
    let sandbox = Sandbox::create().unwrap();
    sandbox.eval("return 1;").await;
    sandbox.dispose();
    sandbox.dispose();

    assert!(sandbox.is_disposed());
    assert!(sandbox.abort_signal().is_none());

    let result = sandbox.eval("return 1;").await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Sandbox has been disposed"));

    let err = sandbox
        .register_function("late", host(|_args, _cx| async move { anyhow::Ok(Value::Null) }))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Disposed));
    assert!(matches!(
        sandbox.set_limits(SandboxLimits::new().with_timeout_ms(10)),
        Err(RuntimeError::Disposed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_is_sticky() {
    let sandbox = Sandbox::create().unwrap();
    assert!(sandbox.abort_signal().is_none());

    sandbox.abort();
    let result = sandbox.eval("return 1;").await;
    assert_eq!(result.error.as_deref(), Some("Execution aborted"));
    assert!(sandbox.abort_signal().is_some_and(|s| s.is_cancelled()));

    let result = sandbox.eval("return 2;").await;
    assert_eq!(result.error.as_deref(), Some("Execution aborted"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_during_host_call() {
    let sandbox = Arc::new(Sandbox::create().unwrap());
    sandbox
        .register_function(
            "wait",
            host(|_args, cx: HostCallContext| async move {
                tokio::select! {
                    _ = cx.signal.cancelled() => Err(anyhow::anyhow!("cancelled while waiting")),
                    _ = tokio::time::sleep(Duration::from_secs(10)) => anyhow::Ok(Value::Null),
                }
            }),
        )
        .unwrap();
    sandbox
        .register_function("after", host(|_args, _cx| async move { anyhow::Ok(Value::Null) }))
        .unwrap();

    let aborter = Arc::clone(&sandbox);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        aborter.abort();
    });

    let result = sandbox.eval("try { wait(); } catch (e) {} after(); return 'done';").await;
    assert_eq!(result.error.as_deref(), Some("Execution aborted"));
    assert_eq!(result.tool_calls[0].error.as_deref(), Some("cancelled while waiting"));
    // A call reached after the abort fails fast but is still recorded.
    if let Some(after) = result.tool_calls.get(1) {
        assert_eq!(after.error.as_deref(), Some("Execution aborted"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_friendly_reference_errors() {
    let sandbox = Sandbox::create().unwrap();
    let result = sandbox.eval("return process.env.HOME;").await;
    assert_eq!(
        result.error.as_deref(),
        Some("ReferenceError: 'process' is not available in the sandbox. Use mux.* tools instead.")
    );

    let noop: Arc<dyn HostFunction> = Arc::new(host(|_args, _cx| async move { anyhow::Ok(Value::Null) }));
    sandbox.register_object("tools", [("noop", noop)]).unwrap();
    let result = sandbox.eval("return require('fs');").await;
    assert_eq!(
        result.error.as_deref(),
        Some("ReferenceError: 'require' is not available in the sandbox. Use tools.* tools instead.")
    );

    let result = sandbox.eval("return notDeclaredAnywhere;").await;
    let error = result.error.unwrap_or_default();
    assert!(error.starts_with("ReferenceError: "), "{}", error);
    assert!(error.contains("notDeclaredAnywhere") && error.contains("is not defined"), "{}", error);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_error_rendering() {
    let sandbox = Sandbox::create().unwrap();

    let result = sandbox.eval("throw new TypeError('bad input');").await;
    assert_eq!(result.error.as_deref(), Some("TypeError: bad input"));

    let result = sandbox.eval("throw 'plain string';").await;
    assert_eq!(result.error.as_deref(), Some("plain string"));

    let result = sandbox.eval("throw { code: 7 };").await;
    assert_eq!(result.error.as_deref(), Some("{\"code\":7}"));

    let result = sandbox.eval("return (;").await;
    assert!(result.error.unwrap_or_default().starts_with("SyntaxError"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_console_is_captured_on_failure() {
    let sandbox = Sandbox::create().unwrap();
    let result = sandbox
        .eval("console.log('a', 1); console.info('i'); console.warn({ k: true }); console.error('e'); throw new Error('boom');")
        .await;

    assert_eq!(result.error.as_deref(), Some("Error: boom"));
    let levels: Vec<_> = result.console_output.iter().map(|c| c.level).collect();
    assert_eq!(
        levels,
        vec![ConsoleLevel::Log, ConsoleLevel::Log, ConsoleLevel::Warn, ConsoleLevel::Error]
    );
    assert_eq!(result.console_output[0].args, vec![Value::from("a"), Value::from(1)]);
    assert_eq!(
        result.console_output[2].args,
        vec![Value::object([("k", Value::from(true))])]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_traces_reset_between_runs() {
    let sandbox = Sandbox::create().unwrap();
    sandbox
        .register_function("noop", host(|_args, _cx| async move { anyhow::Ok(Value::Null) }))
        .unwrap();

    let first = sandbox.eval("noop(); console.log('x'); return 1;").await;
    assert_eq!(first.tool_calls.len(), 1);
    let second = sandbox.eval("return 2;").await;
    assert!(second.tool_calls.is_empty() && second.console_output.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_events_arrive_live_and_in_order() {
    let sandbox = Sandbox::create().unwrap();
    sandbox
        .register_function("add", host(|args, _cx| async move { anyhow::Ok(sum(&args)) }))
        .unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    sandbox.on_event(move |event| sink.lock().push(event.clone()));

    let result = sandbox.eval("console.log('before'); return add(1, 2);").await;
    assert!(result.success);

    let events = events.lock();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], SandboxEvent::Console(_)));
    assert!(matches!(&events[1], SandboxEvent::ToolCallStart { tool_name, .. } if tool_name == "add"));
    match &events[2] {
        SandboxEvent::ToolCallEnd {
            result,
            start_time,
            end_time,
            ..
        } => {
            assert_eq!(result, &Some(Value::from(3)));
            assert!(end_time >= start_time);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_ids_name_owner_and_method() {
    let sandbox = Sandbox::create().unwrap();
    let probe: Arc<dyn HostFunction> = Arc::new(host(|_args, cx: HostCallContext| async move {
        anyhow::Ok(Value::from(cx.call_id))
    }));
    sandbox.register_object("mux", [("probe", probe)]).unwrap();

    let result = sandbox.eval("return [mux.probe(), mux.probe()];").await;
    let first = result.result.as_ref().and_then(|r| r.index(0)).unwrap();
    let second = result.result.as_ref().and_then(|r| r.index(1)).unwrap();
    let first = first.as_str().unwrap();
    assert!(first.starts_with("mux-probe-"));
    assert_eq!(first.len(), "mux-probe-".len() + 36);
    assert_ne!(Some(first), second.as_str());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_values_crossing_the_boundary() {
    let sandbox = Sandbox::create().unwrap();
    sandbox
        .register_function("echo", host(|args, _cx| async move { anyhow::Ok(args.into_iter().next().unwrap_or(Value::Undefined)) }))
        .unwrap();
    sandbox
        .register_function(
            "graph",
            host(|_args, _cx| async move {
                let a = SharedValue::new(Value::Null);
                let b = SharedValue::new(Value::object([
                    ("name", Value::from("b")),
                    ("ref", Value::Shared(a.clone())),
                ]));
                a.set(Value::object([("name", Value::from("a")), ("ref", Value::Shared(b))]));
                let shared = Value::shared(Value::object([("id", Value::from(42))]));
                anyhow::Ok(Value::object([
                    ("cycle", Value::Shared(a)),
                    ("left", shared.clone()),
                    ("right", shared),
                    ("when", Value::Date("2024-06-15T12:30:00.000Z".into())),
                ]))
            }),
        )
        .unwrap();

    let result = sandbox
        .eval(
            r#"
            const g = graph();
            return {
              edge: g.cycle.ref.ref,
              left: g.left.id,
              right: g.right.id,
              when: typeof g.when,
              big: typeof echo(12345678901234567890n),
              gap: echo({ a: 1, b: undefined }),
            };
            "#,
        )
        .await;
    assert!(result.success, "{:?}", result.error);
    let value = result.result.unwrap();
    assert_eq!(value.get("edge"), Some(Value::from("[Circular]")));
    assert_eq!(value.get("left"), Some(Value::from(42)));
    assert_eq!(value.get("right"), Some(Value::from(42)));
    assert_eq!(value.get("when"), Some(Value::from("string")));
    assert_eq!(value.get("big"), Some(Value::from("bigint")));
    assert_eq!(
        value.get("gap"),
        Some(Value::object([("a", Value::from(1)), ("b", Value::Undefined)]))
    );
    assert_eq!(
        result.tool_calls[1].args,
        Value::BigInt("12345678901234567890".parse::<BigInt>().unwrap())
    );
}
