use crate::config::ConfigError;
use toolscript_check::CheckError;

/// Errors raised by the sandbox, the tool bridge and the pipeline
///
/// Guest failures never surface here directly; a run always yields an
/// [`toolscript_types::EvalResult`]. Several variants are still produced
/// inside a run (by host calls) and reach the guest as thrown errors, so
/// their display text is what guest code sees.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Sandbox has been disposed")]
    Disposed,

    #[error("Execution aborted")]
    Aborted,

    #[error("Execution timeout: exceeded {0}ms")]
    Timeout(u64),

    #[error("Invalid arguments for {tool}: {}", issues.join("; "))]
    InvalidArguments { tool: String, issues: Vec<String> },

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Sandbox worker exited unexpectedly")]
    WorkerGone,

    #[error("A tokio runtime is required to drive host calls")]
    NoAsyncRuntime,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Check(#[from] CheckError),
}

impl From<rquickjs::Error> for RuntimeError {
    fn from(err: rquickjs::Error) -> Self {
        RuntimeError::Engine(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
