//! Wire messages exchanged with the timing context.
//!
//! Every [`Request`] carries a [`RequestId`] and every [`Response`] echoes
//! the id of the request it answers, so the foreground can correlate replies
//! without relying on payload contents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::slots::Handle;

/// Correlation id assigned by the sender of a request.
pub type RequestId = u64;

/// Foreground -> background message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// Dot-separated command path, e.g. `"Note.stop"`.
    pub command: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Background -> foreground message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub command: String,
    pub result: Value,
}

impl Response {
    /// Decode the result payload into a typed value.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.result.clone())?)
    }
}

/// Result payload of `Note.stop`.
///
/// The two-argument form of the command serializes to exactly
/// `{"handle": .., "duration": ..}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopNotice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument_id: Option<Handle>,
    pub handle: Handle,
    /// Delay the stop was scheduled with, in milliseconds.
    pub duration: u64,
    /// Set when the timer was cancelled before it fired.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

/// Typed view over a request's positional arguments.
pub(crate) struct Args<'a> {
    values: &'a [Value],
}

impl<'a> Args<'a> {
    pub(crate) fn new(values: &'a [Value]) -> Self {
        Self { values }
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    /// Read an unsigned integer at `pos` (0-based); errors report 1-based positions.
    pub(crate) fn uint(&self, pos: usize, name: &'static str) -> Result<u64> {
        let value = self.values.get(pos).filter(|v| !v.is_null()).ok_or(Error::MissingArgument {
            name,
            index: pos + 1,
        })?;
        value.as_u64().ok_or(Error::NotAcceptable {
            name,
            index: pos + 1,
            expected: "an unsigned integer",
        })
    }

    /// Read a handle at `pos`; values that do not fit the platform's
    /// handle width are rejected instead of truncated.
    pub(crate) fn handle(&self, pos: usize, name: &'static str) -> Result<Handle> {
        let value = self.uint(pos, name)?;
        Handle::try_from(value).map_err(|_| Error::NotAcceptable {
            name,
            index: pos + 1,
            expected: "a handle within the platform's address range",
        })
    }
}
