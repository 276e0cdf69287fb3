//! Application state shared by all handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::session::SessionService;
use crate::user::UserRepository;

#[derive(Clone, Debug)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub users: UserRepository,
    pub auth: AuthState,
    /// Allowed affiliations; empty means any value is accepted.
    pub labs: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionService>,
        users: UserRepository,
        auth: AuthState,
        labs: Vec<String>,
    ) -> Self {
        Self {
            sessions,
            users,
            auth,
            labs: Arc::new(labs),
        }
    }
}
