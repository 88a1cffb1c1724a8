/// Errors from the library.
use core::fmt;

use std::error;

/// Errors returned by this library.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BrokerError {
    /// The string, or the value, is not interned in this `Broker`.
    NotFound,
    /// The pool of broker `Value` has been exhausted.
    ValuePoolExhausted,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{:?}", self)
    }
}

impl error::Error for BrokerError {}
