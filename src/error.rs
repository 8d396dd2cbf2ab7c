use std::fmt;
use thiserror::Error;

/// Status code carried by every error, used by control-plane callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    AlreadyExists,
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unknown,
}

impl Code {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::NotFound => "NOT_FOUND",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("{0}")]
    Unknown(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to initialize {component}: {message}")]
    InitFailed { component: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid run_on pattern: {0}")]
    PatternError(#[from] regex::Error),
}

impl CadenceError {
    pub fn init(component: impl Into<String>, message: impl fmt::Display) -> Self {
        CadenceError::InitFailed {
            component: component.into(),
            message: message.to_string(),
        }
    }

    pub fn code(&self) -> Code {
        match self {
            CadenceError::AlreadyExists(_) => Code::AlreadyExists,
            CadenceError::NotFound(_) => Code::NotFound,
            CadenceError::InvalidArgument(_)
            | CadenceError::ConfigError(_)
            | CadenceError::YamlError(_)
            | CadenceError::PatternError(_) => Code::InvalidArgument,
            CadenceError::FailedPrecondition(_) => Code::FailedPrecondition,
            CadenceError::Unimplemented(_) => Code::Unimplemented,
            CadenceError::InitFailed { .. } | CadenceError::IoError(_) => Code::Internal,
            CadenceError::Unknown(_) => Code::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            CadenceError::AlreadyExists("probe p1".into()).code(),
            Code::AlreadyExists
        );
        assert_eq!(CadenceError::NotFound("probe p1".into()).code(), Code::NotFound);
        assert_eq!(
            CadenceError::init("surfacers", "bad path").code(),
            Code::Internal
        );
        let bad = regex::Regex::new("(").unwrap_err();
        assert_eq!(CadenceError::from(bad).code(), Code::InvalidArgument);
    }

    #[test]
    fn test_messages() {
        let err = CadenceError::init("rds-server", "duplicate provider");
        assert_eq!(
            err.to_string(),
            "Failed to initialize rds-server: duplicate provider"
        );
        assert_eq!(
            CadenceError::AlreadyExists("probe p1".into()).to_string(),
            "probe p1 already exists"
        );
        assert_eq!(Code::NotFound.to_string(), "NOT_FOUND");
    }
}
