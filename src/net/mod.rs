//! Key server wire access.
//!
//! The SDK never opens sockets itself. Every request goes through an
//! application supplied [`Transport`]; this module defines the request shape,
//! the JSON envelope every response is wrapped in, and the records exchanged
//! with the key server.
//!
//! # Architecture
//!
//! ```text
//! UserSession / GroupSession / KeyGraphResolver
//!     │  Request { method, url, body, jwt, group-as-member }
//!     ▼
//! Arc<dyn Transport>  (application: HTTP client of choice)
//!     │  body text
//!     ▼
//! envelope::handle_server_response  →  T | SdkError::Server / Client
//! ```

mod envelope;
mod request;
pub mod types;

pub use envelope::{
    handle_general_server_response, handle_server_response, ListCursor, ServerOutput,
};
pub use request::{HttpMethod, Request, Transport, HEADER_APP_TOKEN, HEADER_GROUP_ACCESS};
