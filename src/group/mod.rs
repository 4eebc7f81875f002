//! Opened groups.
//!
//! A [`GroupSession`] wraps one stored group snapshot and performs the
//! group's payload, membership and rotation operations on behalf of the
//! [`UserSession`](crate::user::UserSession) that opened it.
//!
//! # Architecture
//!
//! ```text
//! UserSession::get_group ──▶ KeyGraphResolver::resolve ──▶ GroupSession
//!                                                              │
//!           ┌──────────────────────┬───────────────────────────┤
//!           ▼                      ▼                           ▼
//!   payloads / search      members and invites         key rotation
//!   (newest key, by id)    (key pages, session fan-out) (RotationCoordinator)
//! ```
//!
//! Administrative operations check the local rank before any request:
//! rank 1 or better manages the group, rank 2 or better manages members.

pub(crate) mod invite;
mod session;

pub use invite::KeyUploadReport;
pub use session::GroupSession;
