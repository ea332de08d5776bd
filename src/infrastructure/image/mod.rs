//! Image decoding, processing and encoding.
//!
//! This module provides:
//! - An [`ImageRsEngine`] implementing the engine port
//! - Pixel filters the `image` crate lacks

pub mod engine;
pub(crate) mod filters;

pub use engine::{DEFAULT_MAX_ALLOC, DEFAULT_MAX_DIMENSION, ImageRsEngine};
