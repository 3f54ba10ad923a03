use std::process::ExitCode;

/// Errors that cause gt to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("{message}")]
    WithCode { code: u8, message: String },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn new(code: u8, message: String) -> Self {
        ExitError::WithCode { code, message }
    }

    pub fn code(&self) -> u8 {
        match self {
            ExitError::Config(_) | ExitError::InvalidInput(_) => 2,
            ExitError::ToolNotFound { .. } => 3,
            ExitError::ToolFailed { .. } => 4,
            ExitError::Timeout { .. } => 5,
            ExitError::WithCode { code, .. } => *code,
            ExitError::Other(_) => 1,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

/// Exit code for any error in an anyhow chain.
///
/// Sling failures carry their own stable codes; everything else that is not
/// an `ExitError` exits 1.
pub fn code_for(err: &anyhow::Error) -> u8 {
    if let Some(exit_err) = err.downcast_ref::<ExitError>() {
        return exit_err.code();
    }
    if let Some(sling_err) = err.downcast_ref::<crate::sling::SlingError>() {
        return sling_err.exit_code();
    }
    1
}
