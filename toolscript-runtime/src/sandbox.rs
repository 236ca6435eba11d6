//! Bounded QuickJS sandbox
//!
//! Each [`Sandbox`] owns one interpreter living on a dedicated worker
//! thread. The thread creates the QuickJS runtime and context and is the
//! only thread that ever touches them; the async side talks to it over a
//! command channel.
//!
//! Host functions registered into the sandbox are async. When guest code
//! calls one, the worker hands the future to the tokio runtime the sandbox
//! was created on and parks until it settles, so guest code observes every
//! host call as synchronous and calls settle strictly in program order.
//!
//! A run ends early when its deadline passes or when [`Sandbox::abort`] is
//! called. Both cancel the run's token: the interpreter's interrupt handler
//! stops guest code, host calls already in flight see the token through
//! [`HostCallContext::signal`], and later host calls fail immediately.
//!
//! ## Example
//!
//! ```ignore
//! let sandbox = Sandbox::create()?;
//! sandbox.register_function("add", |args: Vec<Value>, _cx| async move {
//!     let sum = args.iter().filter_map(Value::as_f64).sum::<f64>();
//!     Ok(Value::from(sum))
//! })?;
//! sandbox.set_limits(SandboxLimits::new().with_timeout_ms(1_000))?;
//!
//! let result = sandbox.eval("return add(1, 2);").await;
//! assert_eq!(result.result, Some(Value::from(3)));
//! ```

use crate::error::{Result, RuntimeError};
use crate::host::{EventHandler, HostCallContext, HostFunction, TraceRecorder};
use crate::limits::SandboxLimits;
use crate::marshal::Marshal;
use parking_lot::{Mutex, RwLock};
use rquickjs::prelude::Rest;
use rquickjs::{Context, Ctx, Exception, Function, Object, Runtime, Value as JsValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use toolscript_check::globals::is_unavailable_global;
use toolscript_check::{friendly_reference_error, DEFAULT_NAMESPACE};
use toolscript_types::{ConsoleLevel, EvalResult, SandboxEvent, Value};
use uuid::Uuid;

const WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Run state
// ============================================================================

/// Cancellation state of one `eval`
pub(crate) struct RunState {
    token: CancellationToken,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    timed_out: AtomicBool,
}

impl RunState {
    fn new(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
            timed_out: AtomicBool::new(false),
        }
    }

    /// Cancel the run because its deadline passed
    ///
    /// Returns false when the run was already cancelled.
    fn expire(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.timed_out.store(true, Ordering::SeqCst);
        self.token.cancel();
        true
    }

    fn should_interrupt(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.expire();
            }
        }
        self.token.is_cancelled()
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn cancellation_error(&self) -> RuntimeError {
        if self.timed_out.load(Ordering::SeqCst) {
            let ms = self
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or_default();
            RuntimeError::Timeout(ms)
        } else {
            RuntimeError::Aborted
        }
    }
}

// ============================================================================
// State shared with the worker
// ============================================================================

struct Shared {
    trace: TraceRecorder,
    run: Mutex<Option<Arc<RunState>>>,
    handle: Handle,
    /// Namespace named in friendly reference errors
    namespace: RwLock<String>,
}

impl Shared {
    fn current_run(&self) -> Option<Arc<RunState>> {
        self.run.lock().clone()
    }

    fn should_interrupt(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .is_some_and(|run| run.should_interrupt())
    }

    /// Guest-facing entry point of every host function
    fn dispatch<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        call_prefix: &str,
        function: &dyn HostFunction,
        args: Vec<JsValue<'js>>,
    ) -> rquickjs::Result<JsValue<'js>> {
        let marshal = Marshal::new(ctx);
        let args = args
            .iter()
            .map(|arg| marshal.to_host(arg))
            .collect::<rquickjs::Result<Vec<_>>>()?;
        let recorded = match args.as_slice() {
            [] => Value::Undefined,
            [single] => single.clone(),
            _ => Value::Array(args.clone()),
        };

        let pending = self.trace.call_started(name, recorded);
        let outcome = self.call_host(name, call_prefix, function, args);
        self.trace.call_finished(pending, &outcome);

        match outcome {
            Ok(value) => marshal.to_guest(&value),
            Err(message) => Err(Exception::throw_message(ctx, &message)),
        }
    }

    fn call_host(
        &self,
        name: &str,
        call_prefix: &str,
        function: &dyn HostFunction,
        args: Vec<Value>,
    ) -> std::result::Result<Value, String> {
        let Some(run) = self.current_run() else {
            return Err(format!("{} called outside of a run", name));
        };
        if run.is_cancelled() {
            return Err(run.cancellation_error().to_string());
        }

        let cx = HostCallContext {
            signal: run.token.clone(),
            call_id: format!("{}-{}", call_prefix, Uuid::new_v4()),
        };
        tracing::trace!(function = %name, call_id = %cx.call_id, "host call");

        let future = function.call(args, cx);
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });

        match rx.blocking_recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                tracing::debug!(function = %name, error = %err, "host call failed");
                Err(format!("{:#}", err))
            }
            Err(_) => Err(format!("{} was dropped before it settled", name)),
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

enum Binding {
    Function {
        name: String,
        function: Arc<dyn HostFunction>,
    },
    Object {
        namespace: String,
        methods: Vec<(String, Arc<dyn HostFunction>)>,
    },
}

enum Command {
    Register {
        binding: Binding,
        reply: mpsc::SyncSender<Result<()>>,
    },
    SetMemoryLimit(usize),
    Eval {
        code: String,
        run: Arc<RunState>,
        reply: oneshot::Sender<EvalResult>,
    },
}

struct Worker {
    // Declared before the runtime so it is dropped first.
    context: Context,
    runtime: Runtime,
    shared: Arc<Shared>,
}

impl Worker {
    fn new(shared: Arc<Shared>) -> Result<Self> {
        let runtime = Runtime::new()?;
        let interrupt = Arc::clone(&shared);
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.should_interrupt())));

        let context = Context::full(&runtime)?;
        context.with(|ctx| install_console(&ctx, &shared))?;

        Ok(Self {
            context,
            runtime,
            shared,
        })
    }

    fn run(self, inbox: mpsc::Receiver<Command>) {
        while let Ok(command) = inbox.recv() {
            match command {
                Command::Register { binding, reply } => {
                    let _ = reply.send(self.register(binding));
                }
                Command::SetMemoryLimit(bytes) => self.runtime.set_memory_limit(bytes),
                Command::Eval { code, run, reply } => {
                    let result = self.eval(&code, run);
                    if reply.send(result).is_err() {
                        tracing::debug!("eval caller went away before the result");
                    }
                }
            }
        }
        tracing::debug!("sandbox worker stopped");
    }

    fn register(&self, binding: Binding) -> Result<()> {
        self.context.with(|ctx| -> Result<()> {
            match binding {
                Binding::Function { name, function } => {
                    let installed = install_function(&ctx, &self.shared, &name, &name, function)?;
                    ctx.globals().set(name.as_str(), installed)?;
                }
                Binding::Object { namespace, methods } => {
                    let object = Object::new(ctx.clone())?;
                    for (method, function) in methods {
                        let prefix = format!("{}-{}", namespace, method);
                        let installed =
                            install_function(&ctx, &self.shared, &method, &prefix, function)?;
                        object.set(method.as_str(), installed)?;
                    }
                    ctx.globals().set(namespace.as_str(), object)?;
                    *self.shared.namespace.write() = namespace;
                }
            }
            Ok(())
        })
    }

    fn eval(&self, code: &str, run: Arc<RunState>) -> EvalResult {
        let started = Instant::now();
        self.shared.trace.reset();
        *self.shared.run.lock() = Some(Arc::clone(&run));

        let outcome = if run.is_cancelled() {
            Err(run.cancellation_error().to_string())
        } else {
            self.evaluate(code, &run)
        };
        // A deadline or abort landing while the guest was finishing still
        // fails the run.
        let outcome = match outcome {
            Ok(_) if run.should_interrupt() => Err(run.cancellation_error().to_string()),
            other => other,
        };

        *self.shared.run.lock() = None;
        self.runtime.run_gc();

        let (tool_calls, console) = self.shared.trace.take();
        let duration_ms = elapsed_ms(started);
        match outcome {
            Ok(result) => {
                tracing::info!(duration_ms, tool_calls = tool_calls.len(), success = true, "eval finished");
                EvalResult::success(result, tool_calls, console, duration_ms)
            }
            Err(error) => {
                if run.is_cancelled() {
                    tracing::warn!(duration_ms, error = %error, "eval cancelled");
                }
                tracing::info!(duration_ms, tool_calls = tool_calls.len(), success = false, "eval finished");
                EvalResult::failure(error, tool_calls, console, duration_ms)
            }
        }
    }

    fn evaluate(&self, code: &str, run: &RunState) -> std::result::Result<Value, String> {
        let source = wrap_code(code);
        let namespace = self.shared.namespace.read().clone();
        self.context.with(|ctx| {
            ctx.eval::<JsValue, _>(source)
                .and_then(|value| Marshal::new(&ctx).to_host(&value))
                .map_err(|err| describe_failure(&ctx, err, run, &namespace))
        })
    }
}

/// Guest code is a function body so top-level `return` works
fn wrap_code(code: &str) -> String {
    format!("(function() {{\n{}\n}})()", code)
}

fn install_function<'js>(
    ctx: &Ctx<'js>,
    shared: &Arc<Shared>,
    name: &str,
    call_prefix: &str,
    function: Arc<dyn HostFunction>,
) -> rquickjs::Result<Function<'js>> {
    let shared = Arc::clone(shared);
    let name = name.to_string();
    let call_prefix = call_prefix.to_string();
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| -> rquickjs::Result<JsValue<'js>> {
            shared.dispatch(&ctx, &name, &call_prefix, function.as_ref(), args.0)
        },
    )
}

fn install_console<'js>(ctx: &Ctx<'js>, shared: &Arc<Shared>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    let methods = [
        ("log", ConsoleLevel::Log),
        ("info", ConsoleLevel::Log),
        ("debug", ConsoleLevel::Log),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
    ];
    for (method, level) in methods {
        let shared = Arc::clone(shared);
        let function = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| -> rquickjs::Result<()> {
                let marshal = Marshal::new(&ctx);
                let args = args
                    .0
                    .iter()
                    .map(|arg| marshal.to_host(arg))
                    .collect::<rquickjs::Result<Vec<_>>>()?;
                shared.trace.console(level, args);
                Ok(())
            },
        )?;
        console.set(method, function)?;
    }
    ctx.globals().set("console", console)
}

// ============================================================================
// Failure messages
// ============================================================================

fn describe_failure<'js>(
    ctx: &Ctx<'js>,
    err: rquickjs::Error,
    run: &RunState,
    namespace: &str,
) -> String {
    // Always take the pending exception so the context stays usable.
    let exception = matches!(err, rquickjs::Error::Exception).then(|| ctx.catch());
    if run.should_interrupt() {
        return run.cancellation_error().to_string();
    }
    match (exception, err) {
        (Some(exception), _) => describe_exception(ctx, &exception, namespace),
        (None, rquickjs::Error::Allocation) => "Out of memory: allocation failed".to_string(),
        (None, other) => other.to_string(),
    }
}

fn describe_exception<'js>(ctx: &Ctx<'js>, exception: &JsValue<'js>, namespace: &str) -> String {
    if let Some(object) = exception.as_object() {
        let name = object.get::<_, Option<String>>("name").ok().flatten();
        let message = object.get::<_, Option<String>>("message").ok().flatten();
        if let (Some(name), Some(message)) = (name, message) {
            if name == "ReferenceError" {
                if let Some(global) = undefined_name(&message).filter(|n| is_unavailable_global(n)) {
                    return friendly_reference_error(global, namespace);
                }
            }
            if message.contains("out of memory") {
                return format!("Out of memory: {}", message);
            }
            return if message.is_empty() {
                name
            } else {
                format!("{}: {}", name, message)
            };
        }
    }
    match Marshal::new(ctx).to_host(exception) {
        Ok(value) => value.to_string(),
        Err(_) => {
            let _ = ctx.catch();
            "Uncaught exception".to_string()
        }
    }
}

/// `'x' is not defined` or `x is not defined` -> `x`
fn undefined_name(message: &str) -> Option<&str> {
    let name = message.strip_suffix(" is not defined")?;
    Some(name.trim_matches('\''))
}

// ============================================================================
// Sandbox
// ============================================================================

/// Isolated interpreter with bounded memory and time
///
/// Must be created from within a tokio runtime; host functions run on that
/// runtime. Host calls block the sandbox's own worker thread, never a tokio
/// worker, but a current-thread runtime must not block on
/// [`Sandbox::dispose`] while a host call is pending.
pub struct Sandbox {
    shared: Arc<Shared>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    limits: Mutex<SandboxLimits>,
    signal: Mutex<Option<CancellationToken>>,
    aborted: AtomicBool,
    eval_lock: tokio::sync::Mutex<()>,
}

impl Sandbox {
    pub fn create() -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| RuntimeError::NoAsyncRuntime)?;
        let shared = Arc::new(Shared {
            trace: TraceRecorder::new(),
            run: Mutex::new(None),
            handle,
            namespace: RwLock::new(DEFAULT_NAMESPACE.to_string()),
        });

        let (commands, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("toolscript-sandbox".to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || match Worker::new(worker_shared) {
                Ok(worker) => {
                    let _ = ready_tx.send(Ok(()));
                    worker.run(inbox);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .map_err(|err| RuntimeError::Engine(format!("failed to spawn sandbox worker: {}", err)))?;

        ready_rx.recv().map_err(|_| RuntimeError::WorkerGone)??;
        tracing::debug!("sandbox created");

        Ok(Self {
            shared,
            commands: Mutex::new(Some(commands)),
            worker: Mutex::new(Some(worker)),
            limits: Mutex::new(SandboxLimits::default()),
            signal: Mutex::new(None),
            aborted: AtomicBool::new(false),
            eval_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        let commands = self.commands.lock();
        let sender = commands.as_ref().ok_or(RuntimeError::Disposed)?;
        sender.send(command).map_err(|_| RuntimeError::WorkerGone)
    }

    fn register(&self, binding: Binding) -> Result<()> {
        let (reply, answer) = mpsc::sync_channel(1);
        self.send(Command::Register { binding, reply })?;
        answer.recv().map_err(|_| RuntimeError::WorkerGone)?
    }

    /// Expose `function` as a guest global named `name`
    pub fn register_function<F: HostFunction>(&self, name: impl Into<String>, function: F) -> Result<()> {
        self.register(Binding::Function {
            name: name.into(),
            function: Arc::new(function),
        })
    }

    /// Expose a guest global object whose members are host functions
    ///
    /// Reference errors for host-only globals name `namespace` from here on.
    pub fn register_object<I, K>(&self, namespace: impl Into<String>, methods: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Arc<dyn HostFunction>)>,
        K: Into<String>,
    {
        self.register(Binding::Object {
            namespace: namespace.into(),
            methods: methods.into_iter().map(|(k, f)| (k.into(), f)).collect(),
        })
    }

    /// Apply the fields set in `limits`; they hold for every later `eval`
    pub fn set_limits(&self, limits: SandboxLimits) -> Result<()> {
        match limits.memory_bytes {
            Some(bytes) => self.send(Command::SetMemoryLimit(bytes))?,
            None if self.is_disposed() => return Err(RuntimeError::Disposed),
            None => {}
        }
        let mut current = self.limits.lock();
        *current = current.merge(limits);
        Ok(())
    }

    pub fn limits(&self) -> SandboxLimits {
        *self.limits.lock()
    }

    /// Observe host calls and console output live
    pub fn on_event(&self, handler: impl Fn(&SandboxEvent) + Send + Sync + 'static) {
        let handler: EventHandler = Arc::new(handler);
        self.shared.trace.set_handler(Some(handler));
    }

    /// Run `code` as the body of a function and report the outcome
    ///
    /// Never fails: errors, timeouts and aborts come back as an
    /// unsuccessful [`EvalResult`]. Concurrent calls are serialized.
    pub async fn eval(&self, code: &str) -> EvalResult {
        let _serial = self.eval_lock.lock().await;
        let started = Instant::now();

        let token = CancellationToken::new();
        if self.aborted.load(Ordering::SeqCst) {
            token.cancel();
        }
        let timeout = self.limits.lock().timeout;
        let run = Arc::new(RunState::new(token.clone(), timeout));

        *self.signal.lock() = Some(token);
        let (reply, answer) = oneshot::channel();
        let sent = self.send(Command::Eval {
            code: code.to_string(),
            run: Arc::clone(&run),
            reply,
        });
        if let Err(err) = sent {
            self.signal.lock().take();
            return EvalResult::rejected(err.to_string(), elapsed_ms(started));
        }

        // The interrupt handler only fires while guest code runs; the timer
        // also covers time spent waiting on host calls.
        let timer = timeout.map(|timeout| {
            let run = Arc::clone(&run);
            self.shared.handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                if run.expire() {
                    tracing::warn!(timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "execution deadline passed");
                }
            })
        });

        let result = match answer.await {
            Ok(result) => result,
            Err(_) => EvalResult::rejected(RuntimeError::WorkerGone.to_string(), elapsed_ms(started)),
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        result
    }

    /// Cancel the current run and every later one
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(token) = self.signal.lock().as_ref() {
            token.cancel();
        }
        tracing::warn!("sandbox aborted");
    }

    /// Cancellation token of the current or most recent run
    pub fn abort_signal(&self) -> Option<CancellationToken> {
        self.signal.lock().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.commands.lock().is_none()
    }

    /// Release the interpreter; later calls fail with
    /// [`RuntimeError::Disposed`]. Safe to call more than once.
    pub fn dispose(&self) {
        let Some(commands) = self.commands.lock().take() else {
            return;
        };
        if let Some(token) = self.signal.lock().take() {
            token.cancel();
        }
        drop(commands);

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::warn!("sandbox worker panicked");
            }
        }
        self.shared.trace.set_handler(None);
        tracing::debug!("sandbox disposed");
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.dispose();
    }
}
