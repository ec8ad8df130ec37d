//! Route handlers for the HTTP API.

pub mod assets;
pub mod events;
pub mod health;
pub mod uploads;
