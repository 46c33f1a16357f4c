//! Reified outcome of a remote operation, carrying enough context for
//! bounded retry. Grounded in the Python original's
//! `ActionResult`/`Download`/`Upload`/`Rename`/`Delete`/`MkDir`/`Refresh`
//! dataclass hierarchy (`model/action_result.py`), rendered here as a
//! single tagged struct plus an explicit retry closure instead of a
//! class-per-kind hierarchy.

use std::future::Future;
use std::pin::Pin;

/// Default number of attempts for a retryable remote operation, matching
/// `constants.MAX_RETRIES` in the system this design is descended from.
pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Nil,
    Upload,
    Download,
    Delete,
    Rename,
    Move,
    Mkdir,
    Refresh,
}

pub type RetryFuture = Pin<Box<dyn Future<Output = ActionResult> + Send>>;
pub type RetryClosure = Box<dyn FnOnce() -> RetryFuture + Send>;

/// Outcome of one submitted unit of work against the remote tree.
pub struct ActionResult {
    pub kind: ActionKind,
    pub path: String,
    pub dest_path: Option<String>,
    pub success: bool,
    pub retries_left: u32,
    pub error: Option<String>,
    pub retry: Option<RetryClosure>,
}

impl std::fmt::Debug for ActionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionResult")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("dest_path", &self.dest_path)
            .field("success", &self.success)
            .field("retries_left", &self.retries_left)
            .field("error", &self.error)
            .field("retry", &self.retry.is_some())
            .finish()
    }
}

impl std::fmt::Display for ActionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {} {}",
            self.kind,
            if self.success { "succeeded" } else { "failed" },
            self.path
        )
    }
}

impl ActionResult {
    pub fn nil() -> Self {
        Self {
            kind: ActionKind::Nil,
            path: String::new(),
            dest_path: None,
            success: true,
            retries_left: 0,
            error: None,
            retry: None,
        }
    }

    pub fn ok(kind: ActionKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            dest_path: None,
            success: true,
            retries_left: 0,
            error: None,
            retry: None,
        }
    }

    pub fn ok_with_dest(kind: ActionKind, path: impl Into<String>, dest_path: impl Into<String>) -> Self {
        Self {
            dest_path: Some(dest_path.into()),
            ..Self::ok(kind, path)
        }
    }

    pub fn failed(
        kind: ActionKind,
        path: impl Into<String>,
        error: impl Into<String>,
        retries_left: u32,
        retry: Option<RetryClosure>,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            dest_path: None,
            success: false,
            retries_left,
            error: Some(error.into()),
            retry,
        }
    }

    /// Whether the reconciler should resubmit `retry` for another attempt.
    pub fn should_retry(&self) -> bool {
        !self.success && self.retries_left > 0 && self.retry.is_some()
    }

    /// Consumes self, returning the retry closure with its budget decremented.
    pub fn into_retry(mut self) -> Option<(u32, RetryClosure)> {
        let retry = self.retry.take()?;
        Some((self.retries_left.saturating_sub(1), retry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_is_always_success_with_no_retry() {
        let r = ActionResult::nil();
        assert!(r.success);
        assert!(!r.should_retry());
    }

    #[test]
    fn failure_with_budget_and_closure_should_retry() {
        let r = ActionResult::failed(
            ActionKind::Upload,
            "a/b.txt",
            "network",
            DEFAULT_RETRIES,
            Some(Box::new(|| Box::pin(async { ActionResult::nil() }))),
        );
        assert!(r.should_retry());
        let (left, _) = r.into_retry().unwrap();
        assert_eq!(left, DEFAULT_RETRIES - 1);
    }

    #[test]
    fn failure_with_no_budget_gives_up() {
        let r = ActionResult::failed(ActionKind::Upload, "a/b.txt", "network", 0, None);
        assert!(!r.should_retry());
    }
}
