//! Error types for mailgate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Recoverable lexical error on a wire line. Sessions answer these
    /// with a `BAD` response and keep reading.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
