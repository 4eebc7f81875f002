//! Client configuration.
//!
//! [`SdkConfig`] is built once by the application and handed to
//! [`Client::new`](crate::Client::new). Nothing in the crate reads
//! configuration from globals.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Fixed page size of key listings. A full page implies more to fetch.
pub const KEY_PAGE_SIZE: usize = 50;

/// A JWT is refreshed when it expires within this many seconds.
pub const JWT_REFRESH_LEEWAY_SECS: i64 = 30;

/// Default time a cached group snapshot is trusted before an update check.
pub const DEFAULT_GROUP_CHECK_TTL: Duration = Duration::from_secs(5 * 60);

/// Default number of passes over a rotation backlog per call.
pub const DEFAULT_ROTATION_ROUND_BUDGET: usize = 10;

/// Obtains a fresh JWT when the application manages refresh itself
/// (for example through an HTTP-only cookie).
#[async_trait]
pub trait JwtRefresher: Send + Sync {
    /// Returns a new JWT for the session that owned `old_jwt`.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh fails.
    async fn refresh(&self, old_jwt: &str) -> Result<String>;
}

/// How expired JWTs are refreshed.
#[derive(Clone, Default)]
pub enum RefreshMode {
    /// Refresh through the key server with the stored refresh token.
    #[default]
    Api,
    /// Refresh through an application supplied callback. The refresh token
    /// is not kept in the local store in this mode.
    External(Arc<dyn JwtRefresher>),
}

impl fmt::Debug for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api => f.write_str("Api"),
            Self::External(_) => f.write_str("External(..)"),
        }
    }
}

/// Configuration of a client.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use keyweave_core::SdkConfig;
///
/// let config = SdkConfig::new("https://keys.example.com", "app-token")
///     .with_group_check_ttl(Duration::from_secs(60));
/// assert_eq!(config.base_url, "https://keys.example.com");
/// ```
#[derive(Debug, Clone)]
pub struct SdkConfig {
    /// Base url of the key server, without trailing slash.
    pub base_url: String,
    /// Public application token sent with every request.
    pub app_token: String,
    /// JWT refresh strategy.
    pub refresh: RefreshMode,
    /// How long a cached group snapshot is used before an update check.
    pub group_check_ttl: Duration,
    /// Number of passes over a rotation backlog per `finish_key_rotation` call.
    pub rotation_round_budget: usize,
}

impl SdkConfig {
    /// Creates a configuration with default refresh, TTL and round budget.
    #[must_use]
    pub fn new(base_url: impl Into<String>, app_token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            app_token: app_token.into(),
            refresh: RefreshMode::Api,
            group_check_ttl: DEFAULT_GROUP_CHECK_TTL,
            rotation_round_budget: DEFAULT_ROTATION_ROUND_BUDGET,
        }
    }

    /// Sets the refresh strategy.
    #[must_use]
    pub fn with_refresh(mut self, refresh: RefreshMode) -> Self {
        self.refresh = refresh;
        self
    }

    /// Sets the group snapshot TTL.
    #[must_use]
    pub const fn with_group_check_ttl(mut self, ttl: Duration) -> Self {
        self.group_check_ttl = ttl;
        self
    }

    /// Sets the rotation round budget. A budget of zero is raised to one.
    #[must_use]
    pub fn with_rotation_round_budget(mut self, rounds: usize) -> Self {
        self.rotation_round_budget = rounds.max(1);
        self
    }

    /// Joins `path` onto the base url.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Returns true if the refresh token should be kept in the local store.
    #[must_use]
    pub const fn stores_refresh_token(&self) -> bool {
        matches!(self.refresh, RefreshMode::Api)
    }
}
