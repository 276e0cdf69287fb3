//! Launchpad library
//!
//! Session orchestration for per-user RStudio and JupyterLab containers:
//! admission control, port allocation, the container lifecycle, expiry
//! reaping, and the authenticated HTTP API around them.

pub mod api;
pub mod auth;
pub mod config;
pub mod container;
pub mod db;
pub mod session;
pub mod user;
pub mod workspace;
