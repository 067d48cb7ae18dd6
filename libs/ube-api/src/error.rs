use std::fmt;

/// Error kind for record and collaborator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Payload could not be decoded into the entity type.
    Decode,
    /// Decoded entity failed validation.
    Validation,
    /// Entity (or sub-entity) not found in a repository.
    NotFound,
    /// Entity with the same key already exists.
    Duplicate,
    /// Another copy of the record is being processed; the copy is left
    /// unacknowledged so the source delivers it again.
    InFlight,
    /// Call to an external collaborator failed.
    Io,
    Config,
    Logic,
}

/// Error stored on a record's error slot and returned by every
/// collaborator trait method.
///
/// Cloneable: batch-level failures (persist, publish, service) stamp the
/// same error on every record of a sub-batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Decode, message: msg.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Validation, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::NotFound, message: msg.into() }
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Duplicate, message: msg.into() }
    }

    pub fn in_flight(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::InFlight, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Logic, message: msg.into() }
    }

    /// Prefix the message with `ctx`; the kind is unchanged.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

// I/O failures are collaborator errors, parse failures are decode errors.

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::decode(e.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::decode(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::decode(e.to_string())
    }
}
