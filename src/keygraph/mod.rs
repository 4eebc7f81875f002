//! Group key graph.
//!
//! Groups form a graph: a child group inherits access from its parent, and a
//! connected group can be a member of other groups. Every group snapshot is
//! stored per owner (the user, or the connected group it was resolved as) and
//! related snapshots are always looked up again by id.
//!
//! # Architecture
//!
//! ```text
//! GroupSession / UserSession
//!     │
//!     ▼
//! KeyGraphResolver ──────────▶ Arc<dyn KeyStore>   (GroupData by owner, group)
//!     │  AccessPath              Arc<dyn Transport> (group, key pages, key by id)
//!     │                          Arc<dyn CryptoProvider>
//!     ▼
//! RotationCoordinator ─▶ converge(backlog, budget, RotationStep)
//! ```
//!
//! Key generations of a group or user live in a [`KeyRing`]: a vector with an
//! id index and a monotonic newest pointer.

mod key_ring;
mod resolver;
mod rotation;
mod types;

pub use key_ring::{KeyRing, VersionedKey};
pub use resolver::KeyGraphResolver;
pub use rotation::{
    converge, run_round, RotationCoordinator, RotationReport, RotationStep, StepOutcome,
};
pub use types::{AccessPath, GroupData, GroupKey, ResolveOptions, RotationRecord, VerifyLevel};
