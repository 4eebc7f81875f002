//! Keyweave Core Library
//!
//! Client core for end-to-end encrypted groups on top of a remote key
//! server. The crate resolves the key generations of groups reached
//! directly, through a parent group or through a connected group, and
//! converges devices on the newest generation through key rotation.
//!
//! Key material only ever leaves the [`CryptoProvider`](crypto::CryptoProvider)
//! as exported strings; transport and persistence are supplied by the
//! application through [`Transport`](net::Transport) and
//! [`KeyStore`](store::KeyStore).

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

mod api;
pub mod config;
pub mod context;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod group;
pub mod keygraph;
pub mod net;
pub mod store;
pub mod sym_key;
pub mod user;

pub use api::Client;
pub use config::{JwtRefresher, RefreshMode, SdkConfig};
pub use context::Context;
pub use error::{Result, SdkError};
pub use group::{GroupSession, KeyUploadReport};
pub use keygraph::{
    AccessPath, GroupData, GroupKey, KeyRing, ResolveOptions, RotationReport, VerifyLevel,
};
pub use sym_key::SymKey;
pub use user::{LoginData, UserSession};
