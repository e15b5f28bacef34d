//! Observer authentication.
//!
//! Observers present an HS256 token signed with the panel's JWT secret.
//! Nodes authenticate with their shared secret instead and never reach here.

pub mod claims;
pub mod jwt;

pub use claims::Claims;
pub use jwt::TokenVerifier;
