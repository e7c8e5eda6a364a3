use thiserror::Error;

/// Main error type for the vigil supervisor
#[derive(Debug, Error)]
pub enum VigilError {
    // Process-related errors
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Process {0} did not exit after SIGKILL")]
    UnresponsiveProcess(String),

    #[error("Restart limit of {1} exceeded for {0}")]
    MaxRestartsExceeded(String, usize),

    #[error("App {0} is in invalid state for this operation: {1}")]
    InvalidState(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Registry errors
    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("App already exists: {0}")]
    AppAlreadyExists(String),

    #[error("Supervisor for {0} is no longer running")]
    SupervisorClosed(String),

    // Schedule errors
    #[error("Invalid schedule expression '{0}': {1}")]
    InvalidScheduleExpression(String, String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // Log-related errors
    #[error("Log error: {0}")]
    LogError(String),

    #[error("Failed to open log file: {0}")]
    LogFileError(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for vigil operations
pub type Result<T> = std::result::Result<T, VigilError>;
