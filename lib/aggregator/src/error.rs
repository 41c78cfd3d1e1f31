use thiserror::Error as ThisError;

use crate::event::CorrelationId;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("Aggregator error: {0}")]
    Unique(String),

    #[error("`expected` was already set for correlation {0}")]
    ExpectedAlreadySet(CorrelationId),

    #[error("`expected` must be at least 1, got {got}")]
    InvalidExpectedCount { got: u32 },

    #[error("no backend resources are configured")]
    NoBackends,
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Unique(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Unique(s)
    }
}
