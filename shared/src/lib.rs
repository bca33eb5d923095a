// shared/src/lib.rs

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("in-flight call cancelled: {0}")]
    Cancelled(String),
    #[error("client has been shut down")]
    ShutDown,
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfiguration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod config;
