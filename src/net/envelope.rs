//! Response envelope decoding and pagination cursors.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SdkError};

/// JSON envelope every key server response is wrapped in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOutput<T> {
    /// `true` on success.
    pub status: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    /// Error code on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_code: Option<u32>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

impl<T> ServerOutput<T> {
    /// Wraps a successful result.
    pub const fn ok(result: T) -> Self {
        Self {
            status: true,
            result: Some(result),
            err_code: None,
            err_msg: None,
        }
    }

    /// Builds a failed envelope.
    pub fn err(code: u32, message: impl Into<String>) -> Self {
        Self {
            status: false,
            result: None,
            err_code: Some(code),
            err_msg: Some(message.into()),
        }
    }
}

fn decode_envelope(body: &str) -> Result<ServerOutput<serde_json::Value>> {
    let out: ServerOutput<serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| SdkError::malformed(format!("Cannot decode the server response: {e}")))?;

    if out.status {
        return Ok(out);
    }

    Err(SdkError::server(
        out.err_code.unwrap_or_default(),
        out.err_msg.unwrap_or_default(),
    ))
}

/// Decodes the envelope and returns its typed result.
///
/// # Errors
///
/// - `SdkError::Server` if `status` is false
/// - `SdkError::Client` (`client_101`) if the envelope is malformed, the
///   result is missing, or the result does not match `T`
pub fn handle_server_response<T: DeserializeOwned>(body: &str) -> Result<T> {
    let out = decode_envelope(body)?;
    let result = out
        .result
        .ok_or_else(|| SdkError::malformed("Server response contains no result"))?;

    serde_json::from_value(result)
        .map_err(|e| SdkError::malformed(format!("Unexpected server result: {e}")))
}

/// Decodes an envelope whose result is not needed.
///
/// # Errors
///
/// Same as [`handle_server_response`], except a missing result is accepted.
pub fn handle_general_server_response(body: &str) -> Result<()> {
    decode_envelope(body).map(|_| ())
}

/// Cursor of a paginated listing: `(last_fetched_time, last_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListCursor {
    /// Time of the last item already fetched.
    pub last_fetched_time: String,
    /// Id of the last item already fetched.
    pub last_id: String,
}

impl Default for ListCursor {
    fn default() -> Self {
        Self {
            last_fetched_time: "0".to_string(),
            last_id: "none".to_string(),
        }
    }
}

impl ListCursor {
    /// Creates a cursor after the given item.
    pub fn after(time: impl ToString, id: impl Into<String>) -> Self {
        Self {
            last_fetched_time: time.to_string(),
            last_id: id.into(),
        }
    }

    /// Renders the cursor as the trailing `time/id` path segment.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}/{}", self.last_fetched_time, self.last_id)
    }
}
