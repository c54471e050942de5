mod config;
mod error;
pub mod machine;
mod reservation;
mod service;

pub use self::config::{CoalescerConfig, Release, LOCAL_CONFIG};
pub use error::Error;
pub use machine::Phase;
pub use reservation::{Callbacks, Operation, Reservation};
pub use service::Coalescer;

/// Result type with the coalescer [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;
