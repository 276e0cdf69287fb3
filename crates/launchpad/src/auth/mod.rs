//! Authentication module.
//!
//! Validates the HS256 identity token issued upstream and registers the
//! caller in the user table.

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::Claims;
pub use config::AuthConfig;
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, RequireAdmin, auth_middleware};
