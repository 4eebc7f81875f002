//! Users and their device independent key generations.
//!
//! A [`UserSession`] is built from [`LoginData`] produced by the external
//! login flow. It owns the user's key ring and is the private key source for
//! every group the user accesses directly.
//!
//! # Architecture
//!
//! ```text
//! DeviceKeys ──wraps──▶ UserKey generations (KeyRing<UserKey>)
//!                            │
//!                            └──wraps──▶ group keys (direct access)
//! ```

mod session;
mod types;

pub use session::UserSession;
pub use types::{DeviceKeys, LoginData, UserData, UserKey};
