//! API request handlers, organized by domain:
//! - `misc`: health check
//! - `me`: the caller's profile, affiliation and capacity
//! - `sessions`: the caller's sessions
//! - `admin`: admin-only operations

mod admin;
mod me;
mod misc;
mod sessions;

pub use admin::{
    admin_delete_session, admin_list_sessions, admin_list_users, admin_reap, admin_stop_session,
};
pub use me::{get_capacity, get_me, set_affiliation};
pub use misc::health;
pub use sessions::{create_session, get_session, list_sessions, stop_session};
