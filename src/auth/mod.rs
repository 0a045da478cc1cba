//! # Authentication
//!
//! Caller identities and the spawn tokens linking a worker to the hatchery
//! that spawned it.

pub mod identity;
pub mod spawn_token;

pub use identity::{
    Authenticator, HatcheryIdentity, Identity, StaticAuthenticator, UserIdentity, WorkerIdentity,
};
pub use spawn_token::{SpawnTokenClaims, SpawnTokenSigner, SpawnTokenVerifier};
