//! Source-domain and requesting-host allow-lists.

use regex::Regex;

use crate::domain::errors::ProxyError;

/// One allow-list entry.
#[derive(Debug, Clone)]
pub enum MatchRule {
    /// Matches any value starting with the string.
    Prefix(String),
    /// Matches values the pattern matches in full.
    Pattern(Regex),
}

impl MatchRule {
    /// Builds a full-match pattern rule.
    ///
    /// # Errors
    /// Returns the regex compile error.
    pub fn pattern(source: &str) -> Result<Self, regex::Error> {
        Regex::new(&format!("^(?:{source})$")).map(Self::Pattern)
    }

    /// Tests a value against this rule.
    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Self::Pattern(re) => re.is_match(value),
        }
    }
}

/// Evaluates allow-lists. `None` on either axis disables that check.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed_domains: Option<Vec<MatchRule>>,
    allowed_hosts: Option<Vec<MatchRule>>,
}

impl AccessPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(
        allowed_domains: Option<Vec<MatchRule>>,
        allowed_hosts: Option<Vec<MatchRule>>,
    ) -> Self {
        Self {
            allowed_domains,
            allowed_hosts,
        }
    }

    /// Checks the source URL against `allowed_domains`.
    ///
    /// # Errors
    /// Returns [`ProxyError::Forbidden`] if no rule matches.
    pub fn authorize_source(&self, url: &str) -> Result<(), ProxyError> {
        match &self.allowed_domains {
            Some(rules) if !rules.iter().any(|r| r.matches(url)) => {
                Err(ProxyError::forbidden("source domain not allowed"))
            }
            _ => Ok(()),
        }
    }

    /// Checks the request's `Origin` header against `allowed_hosts`.
    ///
    /// # Errors
    /// Returns [`ProxyError::Forbidden`] if the header is missing or no rule
    /// matches.
    pub fn authorize_origin(&self, origin: Option<&str>) -> Result<(), ProxyError> {
        let Some(rules) = &self.allowed_hosts else {
            return Ok(());
        };
        match origin {
            Some(origin) if rules.iter().any(|r| r.matches(origin)) => Ok(()),
            _ => Err(ProxyError::forbidden("origin not allowed")),
        }
    }

    /// Runs both checks.
    ///
    /// # Errors
    /// Returns the first failing check.
    pub fn authorize(&self, url: &str, origin: Option<&str>) -> Result<(), ProxyError> {
        self.authorize_source(url)?;
        self.authorize_origin(origin)
    }
}
