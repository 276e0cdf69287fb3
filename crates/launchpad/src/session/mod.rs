//! Session orchestration.
//!
//! Admission, port allocation, the container lifecycle and the expiry
//! sweep, all settled through one session store.

mod admission;
mod error;
mod lifecycle;
mod models;
mod ports;
mod profile;
mod service;
mod store;

pub use admission::{ActiveScope, AdmissionController, AdmissionDecision, AdmissionRequest};
pub use error::{MAX_DIAGNOSTIC_LEN, OrchestratorError, Rejection, sanitize_diagnostic};
pub use lifecycle::{FAMILY_LABEL, LifecycleManager, SESSION_LABEL, StopResult};
pub use models::{
    CapacityReport, CreateSessionRequest, NewSession, OwnerSessionView, ReapReport,
    ResourceEnvelope, Session, SessionFamily, SessionSecret, SessionStatus,
};
pub use ports::{PortRange, ResourceExhausted, allocate};
pub use profile::{FamilyProfile, FamilyProfiles};
pub use service::{SessionDetails, SessionService, SessionServiceConfig, container_name};
pub use store::{AdmissionTx, SessionStore};
