//! Standard rejection messages for optimistic value checks.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;

/// Which expectation about a field's value was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MismatchKind {
    /// The field was expected to hold its default value.
    ExpectedDefault,
    /// The field was expected to hold a non-default value.
    ExpectedNotDefault,
    /// The field held a different value than expected.
    UnexpectedValue,
    /// The string field was expected to be empty.
    ExpectedEmpty,
    /// The string field was expected to be non-empty.
    ExpectedNotEmpty,
}

/// A field held a value other than the one a command expected.
///
/// Built through the helpers on
/// [`HandlerContext`](crate::HandlerContext) so the aggregate's current
/// version is always recorded. Raise it with
/// [`HandlerError::reject`](crate::HandlerError::reject).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMismatch {
    /// Violated expectation.
    pub kind: MismatchKind,
    /// Value the command expected to find.
    pub expected: Value,
    /// Value actually present.
    pub actual: Value,
    /// Value the command attempted to set.
    pub new_value: Value,
    /// Aggregate version at the time of the check.
    pub version: u64,
}

fn capture<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl ValueMismatch {
    /// The field was expected to be `T::default()` but held `actual`.
    pub fn expected_default<T: Serialize + Default>(actual: &T, new_value: &T, version: u64) -> Self {
        Self {
            kind: MismatchKind::ExpectedDefault,
            expected: capture(&T::default()),
            actual: capture(actual),
            new_value: capture(new_value),
            version,
        }
    }

    /// The field was expected to hold `expected` but was `T::default()`.
    pub fn expected_not_default<T: Serialize + Default>(
        expected: &T,
        new_value: Option<&T>,
        version: u64,
    ) -> Self {
        Self {
            kind: MismatchKind::ExpectedNotDefault,
            expected: capture(expected),
            actual: capture(&T::default()),
            new_value: new_value.map_or(Value::Null, capture),
            version,
        }
    }

    /// The field was expected to hold `expected` but held `actual`.
    pub fn unexpected_value<T: Serialize>(expected: &T, actual: &T, new_value: &T, version: u64) -> Self {
        Self {
            kind: MismatchKind::UnexpectedValue,
            expected: capture(expected),
            actual: capture(actual),
            new_value: capture(new_value),
            version,
        }
    }

    /// The string was expected to be empty but held `actual`.
    pub fn expected_empty(actual: &str, new_value: &str, version: u64) -> Self {
        Self {
            kind: MismatchKind::ExpectedEmpty,
            expected: Value::String(String::new()),
            actual: capture(actual),
            new_value: capture(new_value),
            version,
        }
    }

    /// The string was expected to hold `expected` but was empty.
    pub fn expected_not_empty(expected: &str, version: u64) -> Self {
        Self {
            kind: MismatchKind::ExpectedNotEmpty,
            expected: capture(expected),
            actual: Value::String(String::new()),
            new_value: Value::Null,
            version,
        }
    }

    /// The string was expected to be `expected` but was `actual`.
    pub fn unexpected_string(expected: &str, actual: &str, new_value: &str, version: u64) -> Self {
        Self::unexpected_value(&expected, &actual, &new_value, version)
    }
}

impl Message for ValueMismatch {
    const TYPE_NAME: &'static str = "eventfold.ValueMismatch";
}

impl fmt::Display for ValueMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expectation = match self.kind {
            MismatchKind::ExpectedDefault => "expected default value",
            MismatchKind::ExpectedNotDefault => "expected non-default value",
            MismatchKind::UnexpectedValue => "unexpected value",
            MismatchKind::ExpectedEmpty => "expected empty string",
            MismatchKind::ExpectedNotEmpty => "expected non-empty string",
        };
        write!(
            f,
            "{expectation} at version {}: expected {}, found {}",
            self.version, self.expected, self.actual
        )
    }
}
