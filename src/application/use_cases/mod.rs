//! Use case implementations.

mod serve_image_use_case;

pub use serve_image_use_case::{
    CacheStatus, ServeImageRequest, ServeImageUseCase, ServeSettings, ServedImage,
};
