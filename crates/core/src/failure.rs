use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

/// Lifecycle step a node failure was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    PreRun,
    Fire,
    PostRun,
    Stop,
    /// The node's worker did not exit within the stop timeout and was detached.
    ShutdownTimeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::PreRun => "pre-run",
            FailureKind::Fire => "fire",
            FailureKind::PostRun => "post-run",
            FailureKind::Stop => "stop",
            FailureKind::ShutdownTimeout => "shutdown timeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub kind: FailureKind,
    pub message: String,
}

impl NodeFailure {
    pub fn new(node_id: &str, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.to_string(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node '{}' failed during {}: {}",
            self.node_id, self.kind, self.message
        )
    }
}

impl std::error::Error for NodeFailure {}

/// Run a node hook so that neither an `Err` nor a panic escapes it.
///
/// Errors are rendered with their full context chain.
pub fn isolate<T>(hook: impl FnOnce() -> anyhow::Result<T>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn test_isolate_passes_through_ok() {
        assert_eq!(isolate(|| Ok(7)), Ok(7));
    }

    #[test]
    fn test_isolate_renders_error_chain() {
        let result: Result<(), String> =
            isolate(|| Err(anyhow!("disk full")).context("failed to write output"));
        assert_eq!(
            result.expect_err("error should be captured"),
            "failed to write output: disk full"
        );
    }

    #[test]
    fn test_isolate_catches_panic() {
        let result: Result<(), String> = isolate(|| panic!("boom {}", 3));
        assert_eq!(result.expect_err("panic should be captured"), "panicked: boom 3");
    }

    #[test]
    fn test_node_failure_display() {
        let failure = NodeFailure::new("sink", FailureKind::PostRun, "flush failed");
        assert_eq!(
            failure.to_string(),
            "node 'sink' failed during post-run: flush failed"
        );
    }
}
