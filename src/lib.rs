//! morphus - an on-demand image transformation proxy.
//!
//! Requests name a source image and a chain of transformations in the query
//! string. Results are content-addressed by a hash of the canonical request
//! and served from storage on every later request.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing the pipeline services and use cases.
pub mod application;
/// Domain layer containing entities, errors, services and port definitions.
pub mod domain;
/// Infrastructure layer containing adapters for external services.
pub mod infrastructure;
/// Presentation layer containing the HTTP surface.
pub mod presentation;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "morphus";
