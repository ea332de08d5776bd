//! Application layer: pipeline orchestration and the image-serving use case.

/// Application services.
pub mod services;
/// Use case implementations.
pub mod use_cases;

pub use services::{OriginFetcher, TransformPipeline};
pub use use_cases::{ServeImageRequest, ServeImageUseCase, ServeSettings, ServedImage};
