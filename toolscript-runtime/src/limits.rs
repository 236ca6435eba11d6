//! Resource limits for one sandbox

use std::time::Duration;

/// Hard ceilings applied to guest execution
///
/// Unset fields leave the current setting alone when passed to
/// [`crate::Sandbox::set_limits`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Allocation ceiling of the interpreter heap
    pub memory_bytes: Option<usize>,
    /// Wall-clock limit for one `eval`, host waits included
    pub timeout: Option<Duration>,
}

impl SandboxLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_bytes(mut self, bytes: usize) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(self, ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(ms))
    }

    /// Overlay the fields set in `other`
    pub fn merge(self, other: SandboxLimits) -> Self {
        Self {
            memory_bytes: other.memory_bytes.or(self.memory_bytes),
            timeout: other.timeout.or(self.timeout),
        }
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_unset_fields() {
        let base = SandboxLimits::new().with_memory_bytes(1024).with_timeout_ms(50);
        let merged = base.merge(SandboxLimits::new().with_timeout_ms(10));
        assert_eq!(merged.memory_bytes, Some(1024));
        assert_eq!(merged.timeout_ms(), Some(10));
    }
}
