//! Pure domain services.

mod access_policy;
mod capability_negotiator;

pub use access_policy::{AccessPolicy, MatchRule};
pub use capability_negotiator::{
    BrowserIdentity, CapabilityMatrix, CapabilityNegotiator, Feature, NegotiationContext,
    parse_user_agent,
};
