//! Database query modules.

pub mod assets;
