use std::fmt;

use thiserror::Error;

/// Which pipeline step an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    TargetResolution,
    ServiceLifecycle,
    Archive,
    Transfer,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::TargetResolution => "target_resolution",
            ErrorKind::ServiceLifecycle => "service_lifecycle",
            ErrorKind::Archive => "archive",
            ErrorKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("target resolution failed: {0}")]
    TargetResolution(String),

    #[error("service lifecycle failed: {0}")]
    ServiceLifecycle(String),

    #[error("archive failed: {0}")]
    Archive(String),

    #[error("transfer failed: {0}")]
    Transfer(String),
}

impl Error {
    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    pub fn target<M: Into<String>>(msg: M) -> Self {
        Self::TargetResolution(msg.into())
    }

    pub fn service<M: Into<String>>(msg: M) -> Self {
        Self::ServiceLifecycle(msg.into())
    }

    pub fn archive<M: Into<String>>(msg: M) -> Self {
        Self::Archive(msg.into())
    }

    pub fn transfer<M: Into<String>>(msg: M) -> Self {
        Self::Transfer(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::TargetResolution(_) => ErrorKind::TargetResolution,
            Error::ServiceLifecycle(_) => ErrorKind::ServiceLifecycle,
            Error::Archive(_) => ErrorKind::Archive,
            Error::Transfer(_) => ErrorKind::Transfer,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Error::target("x").kind(), ErrorKind::TargetResolution);
        assert_eq!(Error::transfer("x").kind(), ErrorKind::Transfer);
        assert_eq!(ErrorKind::ServiceLifecycle.as_str(), "service_lifecycle");
    }

    #[test]
    fn display_names_the_step() {
        let err = Error::archive("disk full");
        assert_eq!(err.to_string(), "archive failed: disk full");
    }
}
