use std::fmt;

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
/// Coalescer error.
pub enum Error {
    /// The wait budget ran out while the transport was still busy
    TimeoutExceeded,
    /// A poll tick found no reservation to act on
    NoReservation,
    /// A configuration value is out of range
    InvalidConfig(&'static str),
    /// Layered configuration could not be read or deserialized
    ConfigLoad(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TimeoutExceeded => write!(f, "Transport did not become free before the timeout"),
            Error::NoReservation => write!(f, "No reservation was pending"),
            Error::InvalidConfig(reason) => write!(f, "Invalid coalescer configuration: {reason}"),
            Error::ConfigLoad(reason) => write!(f, "Unable to load coalescer configuration: {reason}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<::config::ConfigError> for Error {
    fn from(error: ::config::ConfigError) -> Self {
        Error::ConfigLoad(error.to_string())
    }
}
