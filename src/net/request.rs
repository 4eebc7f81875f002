//! Requests and the transport seam.

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

/// Header carrying the public application token.
pub const HEADER_APP_TOKEN: &str = "x-sentc-app-token";

/// Header naming the connected group a request acts as.
pub const HEADER_GROUP_ACCESS: &str = "x-sentc-group-access-id";

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Returns the method name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Parses a method name (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to the key server.
#[derive(Clone, PartialEq, Eq)]
pub struct Request {
    /// HTTP method.
    pub method: HttpMethod,
    /// Absolute url.
    pub url: String,
    /// Public application token.
    pub app_token: String,
    /// JSON body.
    pub body: Option<String>,
    /// Bearer token.
    pub jwt: Option<String>,
    /// Connected group the request acts as.
    pub group_as_member: Option<String>,
}

impl Request {
    /// Creates a request without body or credentials.
    #[must_use]
    pub fn new(method: HttpMethod, url: impl Into<String>, app_token: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            app_token: app_token.into(),
            body: None,
            jwt: None,
            group_as_member: None,
        }
    }

    /// Attaches a JSON body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attaches the bearer token.
    #[must_use]
    pub fn with_jwt(mut self, jwt: impl Into<String>) -> Self {
        self.jwt = Some(jwt.into());
        self
    }

    /// Acts as the given connected group. `None` leaves the request unchanged.
    #[must_use]
    pub fn with_group_as_member(mut self, group_id: Option<&str>) -> Self {
        self.group_as_member = group_id
            .filter(|id| !id.is_empty())
            .map(ToString::to_string);
        self
    }

    /// Renders the headers the transport must send.
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("Content-Type", "application/json".to_string()),
            (HEADER_APP_TOKEN, self.app_token.clone()),
        ];
        if let Some(jwt) = &self.jwt {
            headers.push(("Authorization", format!("Bearer {jwt}")));
        }
        if let Some(group_id) = &self.group_as_member {
            headers.push((HEADER_GROUP_ACCESS, group_id.clone()));
        }
        headers
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("has_body", &self.body.is_some())
            .field("jwt", &self.jwt.as_ref().map(|_| "[REDACTED]"))
            .field("group_as_member", &self.group_as_member)
            .finish_non_exhaustive()
    }
}

/// Sends requests to the key server.
///
/// Implementations return the raw response body. A request that cannot be
/// sent maps to `SdkError::Transport` with code `1000`, a body that cannot be
/// read as text to code `1002`. Retries and timeouts belong to the
/// implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and returns the response body.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Transport` if no response text is available.
    async fn make_req(&self, request: Request) -> Result<String>;
}
