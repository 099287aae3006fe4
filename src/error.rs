//! Error types shared by the producer, the consumer and the capability implementations.
use thiserror::Error;

/// Failure of the queue transport: unreachable queue, failed send, poll or delete.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue connection failed: {0}")]
    Connect(#[source] PersistError),

    #[error("queue operation failed: {0}")]
    Transport(#[source] postgres::Error),

    #[error("queue connection was closed: {0}")]
    Disconnected(String),

    #[error("cannot write message: {0}")]
    Io(#[from] std::io::Error),

    #[error("lease for message {0} is no longer held")]
    LeaseLost(i64),

    #[error("message body is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("{0}")]
    Unavailable(String),
}

impl QueueError {
    /// The connection to the queue is gone, as opposed to a single failed operation.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            QueueError::Connect(_) | QueueError::Disconnected(_) => true,
            _ => false,
        }
    }
}

/// A message body that can never become a valid reading.
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("message body is not valid UTF-8")]
    NotUtf8,

    #[error("message body is not a JSON object: {0}")]
    Malformed(String),

    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("field '{field}' has the wrong type: {reason}")]
    WrongType { field: &'static str, reason: String },

    #[error("timestamp '{0}' does not match format YYYY-MM-DD HH:MM:SS")]
    InvalidTimestamp(String),

    #[error("{field} value {value} outside of plausible range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Storage could not be reached or rejected the statement.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("could not set up tls for the database connection: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("could not establish database connection: {0}")]
    Connect(#[source] postgres::Error),

    #[error("statement failed: {0}")]
    Statement(#[source] postgres::Error),

    #[error("{0}")]
    Unavailable(String),
}

/// The configuration could not be read or is not usable.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot deserialize the configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
