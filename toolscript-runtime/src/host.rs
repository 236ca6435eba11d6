//! Host side of the sandbox boundary
//!
//! [`HostFunction`] is the seam every guest-callable binding goes through.
//! [`TraceRecorder`] keeps the per-run record of host calls and console
//! output and forwards live [`SandboxEvent`]s to an observer.

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use toolscript_types::{ConsoleLevel, ConsoleRecord, SandboxEvent, ToolCallRecord, Value};

/// Per-call context handed to host functions
#[derive(Debug, Clone)]
pub struct HostCallContext {
    /// Cancellation signal of the current run
    pub signal: CancellationToken,
    pub call_id: String,
}

/// A host operation callable from guest code
///
/// The guest is suspended until the returned future settles. An `Err`
/// becomes a thrown `Error` in the guest carrying the error's message.
pub trait HostFunction: Send + Sync + 'static {
    fn call(&self, args: Vec<Value>, cx: HostCallContext) -> BoxFuture<'static, anyhow::Result<Value>>;
}

impl<F, Fut> HostFunction for F
where
    F: Fn(Vec<Value>, HostCallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>, cx: HostCallContext) -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin(self(args, cx))
    }
}

/// Observer of live sandbox events
pub type EventHandler = Arc<dyn Fn(&SandboxEvent) + Send + Sync>;

/// Milliseconds since the Unix epoch
pub(crate) fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// A host call that has started but not settled
#[derive(Debug)]
pub struct PendingCall {
    tool_name: String,
    args: Value,
    started: Instant,
    start_time: u64,
}

#[derive(Default)]
struct Trace {
    tool_calls: Vec<ToolCallRecord>,
    console: Vec<ConsoleRecord>,
    last_timestamp: u64,
}

/// Ordered record of one run's host calls and console output
#[derive(Default)]
pub struct TraceRecorder {
    trace: Mutex<Trace>,
    handler: RwLock<Option<EventHandler>>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_handler(&self, handler: Option<EventHandler>) {
        *self.handler.write() = handler;
    }

    /// Start a fresh run
    pub fn reset(&self) {
        let mut trace = self.trace.lock();
        trace.tool_calls.clear();
        trace.console.clear();
    }

    /// Everything recorded since the last reset
    pub fn take(&self) -> (Vec<ToolCallRecord>, Vec<ConsoleRecord>) {
        let mut trace = self.trace.lock();
        (
            std::mem::take(&mut trace.tool_calls),
            std::mem::take(&mut trace.console),
        )
    }

    pub fn call_started(&self, tool_name: &str, args: Value) -> PendingCall {
        let start_time = self.timestamp();
        self.emit(SandboxEvent::ToolCallStart {
            tool_name: tool_name.to_string(),
            args: args.clone(),
            start_time,
        });
        PendingCall {
            tool_name: tool_name.to_string(),
            args,
            started: Instant::now(),
            start_time,
        }
    }

    pub fn call_finished(&self, pending: PendingCall, outcome: &Result<Value, String>) {
        let duration_ms = u64::try_from(pending.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let end_time = self.timestamp();
        let record = match outcome {
            Ok(result) => ToolCallRecord::succeeded(
                pending.tool_name.clone(),
                pending.args.clone(),
                result.clone(),
                duration_ms,
            ),
            Err(error) => ToolCallRecord::failed(
                pending.tool_name.clone(),
                pending.args.clone(),
                error.clone(),
                duration_ms,
            ),
        };
        self.trace.lock().tool_calls.push(record);
        self.emit(SandboxEvent::ToolCallEnd {
            tool_name: pending.tool_name,
            args: pending.args,
            result: outcome.as_ref().ok().cloned(),
            error: outcome.as_ref().err().cloned(),
            start_time: pending.start_time,
            end_time,
        });
    }

    pub fn console(&self, level: ConsoleLevel, args: Vec<Value>) {
        let record = ConsoleRecord {
            level,
            args,
            timestamp: self.timestamp(),
        };
        self.trace.lock().console.push(record.clone());
        self.emit(SandboxEvent::Console(record));
    }

    /// Wall-clock milliseconds, never going backwards within a recorder
    fn timestamp(&self) -> u64 {
        let mut trace = self.trace.lock();
        let now = now_ms().max(trace.last_timestamp);
        trace.last_timestamp = now;
        now
    }

    fn emit(&self, event: SandboxEvent) {
        // Clone out so a handler can re-register without deadlocking.
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(&event);
        }
    }
}
