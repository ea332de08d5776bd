//! HTTP surface.

pub mod error_response;
pub mod routes;
pub mod server;
pub mod state;

pub use server::{create_app, shutdown_signal, start_server};
pub use state::ServerState;
