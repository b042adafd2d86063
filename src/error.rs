//! Error types for mkimage
//!
//! All modules use `MkimageResult<T>` as their return type.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for mkimage operations
pub type MkimageResult<T> = Result<T, MkimageError>;

/// All errors that can occur in mkimage
#[derive(Error, Debug)]
pub enum MkimageError {
    // Remote fetch errors
    #[error("Remote resource not found: {url}: {reason}")]
    RemoteNotFound { url: String, reason: String },

    #[error("Timed out fetching {url}")]
    RemoteTimeout { url: String },

    #[error("Couldn't download from {url}, http status: {status}")]
    RemoteStatus { url: String, status: u16 },

    #[error("Couldn't download from {url}: {reason}")]
    Remote { url: String, reason: String },

    // Request validation errors
    #[error("{0}")]
    Validation(String),

    #[error("Hostname {0} is not allowed")]
    HostNotAllowed(String),

    #[error("Not a valid image: {path}: {reason}")]
    InvalidImage { path: PathBuf, reason: String },

    // Cache coordination errors
    #[error("Gave up waiting for lock on {path} after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error("Invalid cache layout: {0}")]
    LayoutInvalid(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    #[error("Unexpected output from {command}: {reason}")]
    MalformedOutput { command: String, reason: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the surrounding request layer to pick a
/// response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RemoteNotFound,
    RemoteTimeout,
    RemoteError,
    ValidationError,
    LockTimeout,
    SubprocessFailure,
    FilesystemError,
    Configuration,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RemoteNotFound => "remote-not-found",
            Self::RemoteTimeout => "remote-timeout",
            Self::RemoteError => "remote-error",
            Self::ValidationError => "validation",
            Self::LockTimeout => "lock-timeout",
            Self::SubprocessFailure => "subprocess",
            Self::FilesystemError => "filesystem",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

impl MkimageError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Classify the error into the taxonomy the request layer maps to statuses
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RemoteNotFound { .. } => ErrorKind::RemoteNotFound,
            Self::RemoteTimeout { .. } => ErrorKind::RemoteTimeout,
            Self::RemoteStatus { .. } | Self::Remote { .. } => ErrorKind::RemoteError,
            Self::Validation(_) | Self::HostNotAllowed(_) | Self::InvalidImage { .. } => {
                ErrorKind::ValidationError
            }
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::CommandFailed { .. }
            | Self::CommandExecution { .. }
            | Self::MalformedOutput { .. } => ErrorKind::SubprocessFailure,
            Self::Io { .. } => ErrorKind::FilesystemError,
            Self::LayoutInvalid(_)
            | Self::ConfigInvalid { .. }
            | Self::ConfigNotFound(_)
            | Self::ConfigDirCreate { .. }
            | Self::Json(_)
            | Self::TomlParse(_)
            | Self::TomlSerialize(_) => ErrorKind::Configuration,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteTimeout { .. } | Self::LockTimeout { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::HostNotAllowed(_) => Some("Add the host to fetch.allowed_hosts in config.toml"),
            Self::CommandFailed { .. } => Some("Is ImageMagick installed? Check transform.*_bin"),
            Self::LockTimeout { .. } => {
                Some("Another worker may be stuck; raise cache.lock_timeout_secs or sweep")
            }
            _ => None,
        }
    }
}
