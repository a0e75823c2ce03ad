use std::fmt;

/// Errors raised while decoding queue items, kwargs, or stored results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterchangeError {
    /// A run id was not in `YYYY-MM-DDTHH:MM:SS.ffffff` form.
    InvalidRunId { value: String, message: String },
    /// A queue item body could not be decoded.
    MalformedItem(String),
    /// A kwargs entry is missing.
    MissingKwarg { key: String },
    /// A kwargs entry has the wrong JSON type.
    InvalidKwarg { key: String, expected: &'static str },
}

impl fmt::Display for InterchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterchangeError::InvalidRunId { value, message } => {
                write!(f, "invalid run id '{}': {}", value, message)
            }
            InterchangeError::MalformedItem(msg) => {
                write!(f, "malformed queue item: {}", msg)
            }
            InterchangeError::MissingKwarg { key } => {
                write!(f, "missing required kwarg '{}'", key)
            }
            InterchangeError::InvalidKwarg { key, expected } => {
                write!(f, "kwarg '{}' must be {}", key, expected)
            }
        }
    }
}

impl std::error::Error for InterchangeError {}
