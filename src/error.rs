use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZmigrateError {
    #[error("Invalid address '{input}': {reason}")]
    InvalidAddress { input: String, reason: String },
    #[error("Transport error on {host}: {message}")]
    Transport { host: String, message: String },
    #[error("Command failed on {host} (exit {exit_code}): {command}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("Unexpected output from '{command}': {detail}")]
    UnexpectedOutput { command: String, detail: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Configuration parse error: {0}")]
    SerdeError(String),
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl ZmigrateError {
    pub fn transport(host: &str, err: impl std::fmt::Display) -> Self {
        ZmigrateError::Transport {
            host: host.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for ZmigrateError {
    fn from(err: toml::de::Error) -> Self {
        ZmigrateError::SerdeError(err.to_string())
    }
}

impl From<serde_json::Error> for ZmigrateError {
    fn from(err: serde_json::Error) -> Self {
        ZmigrateError::SerdeError(err.to_string())
    }
}
