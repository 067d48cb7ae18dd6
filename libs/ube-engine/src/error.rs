use std::fmt;

use ube_api::Error;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("empty input batch")]
    EmptyInput,

    #[error("no actions were provided for the pipeline")]
    NoActions,

    #[error("config error: {0}")]
    Config(String),

    #[error("acknowledge messages: {0}")]
    Ack(#[source] Error),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For `Ack`, context is added to the inner record error.
    /// For `Config`, context is prepended to the message.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        match self {
            EngineError::Ack(e) => EngineError::Ack(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

/// One failed record of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    pub id: String,
    pub error: Error,
}

impl fmt::Display for RecordFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID: '{}'; err: {}", self.id, self.error)
    }
}

/// Combined error of every failed record in a batch, one line per record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub struct BatchError {
    pub failures: Vec<RecordFailure>,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}
