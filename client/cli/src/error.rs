//! Error taxonomy for navigator operations
//!
//! Every variant renders to a message that can be shown to the user as-is.
//! Cache I/O failures never reach this type: the cache swallows them and
//! reports a miss instead.

use crate::format::format_size;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NavError {
    #[error("server not configured\nrun: config setup")]
    ConfigurationMissing,

    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    #[error("file too large: {} > {}", format_size(*actual), format_size(*limit))]
    SizeExceeded { actual: u64, limit: u64 },

    #[error("invalid index {0}, run: ls")]
    InvalidIndex(usize),

    #[error("transfer failed: {0}")]
    TransferError(String),

    #[error("{0} is a directory, run: ls {0}")]
    NotAFile(String),

    #[error("{0} is not a directory, run: info {0}")]
    NotADirectory(String),

    #[error("{0}")]
    BadArgument(String),

    #[error("could not save settings: {0}")]
    Storage(String),

    #[error("unknown command: {0}\nrun: help")]
    UnknownCommand(String),
}

pub type NavResult<T> = Result<T, NavError>;
