//! HTTP middleware: request ID and shared-secret authentication.

pub mod auth;
pub mod request_id;
