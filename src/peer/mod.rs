//! Peer wiring and session lifecycle

pub mod auth;
pub mod runtime;

pub use auth::{AuthProvider, StaticAuth};
pub use runtime::{PeerDeps, PeerEvent, PeerRuntime, PeerState, SIGNED_OUT};
