//! Browser capability data.

pub mod caniuse;

pub use caniuse::{load_capabilities, load_feature};
