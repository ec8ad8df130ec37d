//! # reel-pipeline
//!
//! The upload handoff and status controller.
//!
//! This crate provides:
//!
//! - **[`MediaStore`]** -- the persistence seam, with an in-memory
//!   [`MemoryStore`] and a SQLite-backed [`SqliteStore`].
//! - **[`InFlightGuard`]** -- at most one running job per asset.
//! - **[`StagedUpload`]** -- a file handed over by the API layer.
//! - **[`MediaController`]** -- drives probe, ladder selection and transcode
//!   for videos, or derivative generation for images, and records the
//!   outcome.

pub mod controller;
pub mod guard;
pub mod store;
pub mod upload;

pub use controller::{Backends, JobOutcome, MediaController};
pub use guard::{InFlightGuard, InFlightToken};
pub use store::{MediaStore, MemoryStore, SqliteStore, DEFAULT_LEASE_TTL};
pub use upload::StagedUpload;
