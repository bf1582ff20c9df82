#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Run '{0}' not found")]
    RunNotFound(String),

    #[error("Plan '{0}' not found")]
    PlanNotFound(String),

    #[error("Task '{0}' not found in backlog")]
    TaskNotFound(String),

    #[error("run not awaiting_review")]
    RunNotAwaitingReview,

    #[error("cannot {action}: current status is '{status}'")]
    InvalidRunStatus { action: String, status: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("workspace path {workspace} includes engine root {root}; refusing to run")]
    UnsafeWorkspace { workspace: String, root: String },

    #[error("Assistant idle timeout: no output for {0}s")]
    AssistantIdleTimeout(u64),

    #[error("Assistant hard timeout after {0}s")]
    AssistantHardTimeout(u64),

    #[error("Assistant response did not match schema: {0}")]
    AssistantSchemaMismatch(String),

    #[error("Assistant binary '{0}' is not installed")]
    AssistantNotInstalled(String),

    #[error("Failed to create stage: {0}")]
    StageCreation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_run_not_found() {
        let err = AppError::RunNotFound("run-20250101-120000".into());
        assert_eq!(err.to_string(), "Run 'run-20250101-120000' not found");
    }

    #[test]
    fn test_display_run_not_awaiting_review() {
        assert_eq!(
            AppError::RunNotAwaitingReview.to_string(),
            "run not awaiting_review"
        );
    }

    #[test]
    fn test_display_invalid_run_status() {
        let err = AppError::InvalidRunStatus {
            action: "pause".into(),
            status: "done".into(),
        };
        assert_eq!(err.to_string(), "cannot pause: current status is 'done'");
    }

    #[test]
    fn test_display_invalid_transition() {
        let err = AppError::InvalidTransition {
            from: "done".into(),
            to: "doing".into(),
        };
        assert_eq!(err.to_string(), "Invalid status transition: done -> doing");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AppError>();
    }
}
