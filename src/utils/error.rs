//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;
use std::num;

/// Customized error type for PaxKV.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PaxKvError(pub String);

impl PaxKvError {
    /// Creates an error from anything that can be displayed.
    pub fn msg(m: impl fmt::Display) -> Self {
        PaxKvError(m.to_string())
    }
}

impl fmt::Display for PaxKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for PaxKvError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `PaxKvError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for PaxKvError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                PaxKvError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(num::ParseIntError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::sync::AcquireError);
impl_from_error!(tokio::sync::watch::error::SendError<bool>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = PaxKvError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = PaxKvError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn msg_constructor() {
        let e = PaxKvError::msg(7777);
        assert_eq!(e, PaxKvError("7777".into()));
    }
}
