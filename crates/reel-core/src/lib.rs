//! reel-core: shared types, identifiers, errors, configuration, path
//! resolution and the pipeline event bus.
//!
//! Every other reel-* crate depends on this one. It performs no media work
//! itself; it only defines the vocabulary the pipeline speaks.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod media;
pub mod paths;

pub use error::{Error, Result};
pub use ids::*;
pub use media::*;
pub use paths::PathResolver;
