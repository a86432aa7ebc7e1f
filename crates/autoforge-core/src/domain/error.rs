//! Domain-level error taxonomy for Autoforge.

/// Autoforge domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("working directory does not exist: {0}")]
    WorkingDirMissing(std::path::PathBuf),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("patch error: {0}")]
    Patch(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool parameter error: {0}")]
    ToolParameters(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for Autoforge domain operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ForgeError::PolicyViolation("credential in diff".to_string());
        assert!(err.to_string().contains("Policy violation"));
        assert!(err.to_string().contains("credential in diff"));

        let err = ForgeError::UnknownTool("frobnicate".to_string());
        assert!(err.to_string().contains("unknown tool: frobnicate"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ForgeError = io.into();
        assert!(err.to_string().contains("gone"));
    }
}
