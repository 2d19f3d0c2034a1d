use std::fmt;

/// Semantic error kinds used at the task/shim boundary. These are the kinds
/// callers branch on (e.g. to decide whether a `Delete` against an already
/// gone shim should be treated as success); the `Runtime`/`Io` cases below
/// carry richer context for logging but collapse to `Internal` for callers
/// that only care about the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

#[derive(Debug)]
pub enum Error {
    NotFound {
        resource: String,
        context: Option<String>,
    },
    AlreadyExists {
        resource: String,
    },
    InvalidArgument {
        field: String,
        message: String,
    },
    FailedPrecondition {
        message: String,
    },
    Unavailable {
        message: String,
    },
    DeadlineExceeded {
        message: String,
    },
    Io {
        error: std::io::Error,
        context: Option<String>,
    },
    Serialization {
        message: String,
        context: Option<String>,
    },
    Runtime {
        message: String,
        context: Option<String>,
    },
}

impl Error {
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Error::NotFound {
            resource: resource.into(),
            context: None,
        }
    }

    pub fn not_found_with_context<S1: Into<String>, S2: Into<String>>(
        resource: S1,
        ctx: S2,
    ) -> Self {
        Error::NotFound {
            resource: resource.into(),
            context: Some(ctx.into()),
        }
    }

    pub fn already_exists<S: Into<String>>(resource: S) -> Self {
        Error::AlreadyExists {
            resource: resource.into(),
        }
    }

    pub fn invalid_argument<S1: Into<String>, S2: Into<String>>(field: S1, message: S2) -> Self {
        Error::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn failed_precondition<S: Into<String>>(message: S) -> Self {
        Error::FailedPrecondition {
            message: message.into(),
        }
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Error::Unavailable {
            message: message.into(),
        }
    }

    pub fn deadline_exceeded<S: Into<String>>(message: S) -> Self {
        Error::DeadlineExceeded {
            message: message.into(),
        }
    }

    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Error::Runtime {
            message: message.into(),
            context: None,
        }
    }

    pub fn runtime_with_context<S1: Into<String>, S2: Into<String>>(msg: S1, ctx: S2) -> Self {
        Error::Runtime {
            message: msg.into(),
            context: Some(ctx.into()),
        }
    }

    pub fn io_with_context<S: Into<String>>(error: std::io::Error, ctx: S) -> Self {
        Error::Io {
            error,
            context: Some(ctx.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::FailedPrecondition { .. } => ErrorKind::FailedPrecondition,
            Error::Unavailable { .. } => ErrorKind::Unavailable,
            Error::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Error::Io { .. } | Error::Serialization { .. } | Error::Runtime { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// IPC-closed degrades State/Delete lookups to NotFound.
    pub fn is_ipc_closed(&self) -> bool {
        matches!(self, Error::Unavailable { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound { resource, context } => {
                write!(f, "not found: {}", resource)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
            Error::AlreadyExists { resource } => write!(f, "already exists: {}", resource),
            Error::InvalidArgument { field, message } => {
                write!(f, "invalid argument '{}': {}", field, message)
            }
            Error::FailedPrecondition { message } => write!(f, "failed precondition: {}", message),
            Error::Unavailable { message } => write!(f, "unavailable: {}", message),
            Error::DeadlineExceeded { message } => write!(f, "deadline exceeded: {}", message),
            Error::Io { error, context } => {
                write!(f, "io error: {}", error)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
            Error::Serialization { message, context } => {
                write!(f, "serialization error: {}", message)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
            Error::Runtime { message, context } => {
                write!(f, "runtime error: {}", message)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io {
            error: e,
            context: None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization {
            message: e.to_string(),
            context: Some("JSON parsing error".to_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization {
            message: e.to_string(),
            context: Some("bincode encoding error".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
