//! API Middleware
//!
//! Request authentication for the admin API.

pub mod auth;

pub use auth::{require_admin_token, AdminToken};
