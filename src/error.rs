//! Error types for the mapper

use thiserror::Error;

/// Result type for internal mapper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for BiDi command handlers: a JSON result or a wire error
pub type CommandResult = std::result::Result<serde_json::Value, CommandError>;

/// Internal error type: transport, CDP and serialization failures
#[derive(Debug, Error)]
pub enum Error {
    /// Transport error
    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// CDP protocol error
    #[error("CDP error in {method}: {message} (code {code})")]
    Cdp {
        method: String,
        code: i64,
        message: String,
    },

    /// The CDP connection (or a session on it) is gone
    #[error("Connection closed: {0}")]
    Closed(String),

    /// A channel the mapper relies on was dropped
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decode error (e.g., base64)
    #[error("Decode error: {0}")]
    Decode(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a transport error with context
    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            source: None,
        }
    }

    /// Create a CDP error with full context
    pub fn cdp(method: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Cdp {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Whether this is a close-class error: the target or session went away
    /// mid-command. Unblock and close sequences treat these as benign.
    pub fn is_close(&self) -> bool {
        match self {
            Error::Closed(_) | Error::ChannelClosed(_) => true,
            // -32001 = session not found
            Error::Cdp { code, message, .. } => {
                *code == -32001
                    || message.contains("Not attached to an active page")
                    || message.contains("Session with given id not found")
                    || message.contains("Target closed")
            }
            _ => false,
        }
    }
}

/// BiDi protocol error codes, serialized exactly as the spec strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    NoSuchFrame,
    NoSuchScript,
    NoSuchIntercept,
    NoSuchRequest,
    NoSuchUserContext,
    NoSuchAlert,
    UnknownCommand,
    UnknownError,
}

impl ErrorCode {
    /// The wire string for this code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::NoSuchFrame => "no such frame",
            ErrorCode::NoSuchScript => "no such script",
            ErrorCode::NoSuchIntercept => "no such intercept",
            ErrorCode::NoSuchRequest => "no such request",
            ErrorCode::NoSuchUserContext => "no such user context",
            ErrorCode::NoSuchAlert => "no such alert",
            ErrorCode::UnknownCommand => "unknown command",
            ErrorCode::UnknownError => "unknown error",
        }
    }
}

/// Error surfaced to the BiDi caller for a failed command
#[derive(Debug, Error)]
#[error("{}: {}", .code.as_str(), .message)]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn no_such_frame(context: &str) -> Self {
        Self::new(
            ErrorCode::NoSuchFrame,
            format!("Context '{context}' not found"),
        )
    }

    pub fn no_such_intercept(intercept: &str) -> Self {
        Self::new(
            ErrorCode::NoSuchIntercept,
            format!("Intercept '{intercept}' does not exist."),
        )
    }

    pub fn no_such_request(request: &str) -> Self {
        Self::new(
            ErrorCode::NoSuchRequest,
            format!("No blocked request found for id '{request}'"),
        )
    }

    pub fn no_such_script(script: &str) -> Self {
        Self::new(
            ErrorCode::NoSuchScript,
            format!("Preload script '{script}' not found"),
        )
    }

    pub fn unknown_command(method: &str) -> Self {
        Self::new(
            ErrorCode::UnknownCommand,
            format!("Unknown command '{method}'"),
        )
    }
}

impl From<Error> for CommandError {
    /// Translate an internal failure into the BiDi error surface. Expected
    /// CDP shapes get their own codes; anything else becomes `unknown error`.
    fn from(err: Error) -> Self {
        match &err {
            // Only the CDP message text identifies a missing dialog
            Error::Cdp { message, .. } if message.contains("No dialog is showing") => {
                CommandError::new(ErrorCode::NoSuchAlert, "No dialog is showing")
            }
            _ => CommandError::new(ErrorCode::UnknownError, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_class_detection() {
        assert!(Error::cdp("Page.enable", -32001, "Session with given id not found").is_close());
        assert!(Error::cdp("Page.enable", -32000, "Not attached to an active page").is_close());
        assert!(Error::Closed("browser".into()).is_close());
        assert!(!Error::cdp("Page.navigate", -32602, "Invalid parameters").is_close());
    }

    #[test]
    fn dialog_error_translates_to_no_such_alert() {
        let err = Error::cdp("Page.handleJavaScriptDialog", -32000, "No dialog is showing");
        let cmd: CommandError = err.into();
        assert_eq!(cmd.code, ErrorCode::NoSuchAlert);
    }

    #[test]
    fn error_code_wire_strings() {
        assert_eq!(ErrorCode::NoSuchIntercept.as_str(), "no such intercept");
        assert_eq!(ErrorCode::InvalidArgument.as_str(), "invalid argument");
        assert_eq!(ErrorCode::UnknownCommand.as_str(), "unknown command");
    }
}
