//! User registry.
//!
//! Users are registered on first sight of a validated identity token and
//! refreshed on every authenticated request.

mod models;
mod repository;

pub use models::{AffiliationRequest, User};
pub use repository::UserRepository;
