//! # reel-image
//!
//! Image derivative generation for video thumbnails and profile pictures.
//!
//! A source image is decoded once; every requested
//! [`ImageDerivativeSpec`](reel_core::ImageDerivativeSpec) is then rendered
//! on its own blocking task. FILE derivatives become lossy WebP files named
//! `<label>-<width>p.webp`, INLINE derivatives become PNG data URIs. One
//! failing spec does not fail the others.

pub mod generator;
pub mod render;

pub use generator::{
    DerivativeGenerator, DerivativeOutcome, DerivativeOutput, DerivativeReport,
    DerivativeTarget, GeneratedDerivative,
};
pub use render::{file_name, MAX_WEBP_DIMENSION};
