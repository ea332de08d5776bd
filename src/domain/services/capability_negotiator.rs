//! Output format negotiation for `format=auto`.
//!
//! Two strategies are supported. The `Accept` header is consulted first; when
//! the request carries no `Accept` header the user agent is matched against a
//! browser capability matrix. Neither strategy ever fails a request: anything
//! that cannot be parsed or looked up degrades to `jpeg`.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::trace;

use crate::domain::entities::ImageFormat;

/// Request headers relevant to format negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationContext {
    /// Raw `Accept` header.
    pub accept: Option<String>,
    /// Raw `User-Agent` header.
    pub user_agent: Option<String>,
}

impl NegotiationContext {
    /// Creates a context from optional header values.
    #[must_use]
    pub const fn new(accept: Option<String>, user_agent: Option<String>) -> Self {
        Self { accept, user_agent }
    }
}

/// Image features tracked by the capability matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// AVIF decoding.
    Avif,
    /// WebP decoding.
    Webp,
}

/// Read-only lookup of the lowest browser version supporting a feature,
/// keyed by caniuse browser stat id (`chrome`, `ios_saf`, `and_chr`, ...).
#[derive(Debug, Clone, Default)]
pub struct CapabilityMatrix {
    minimum: HashMap<(Feature, String), f64>,
}

impl CapabilityMatrix {
    /// Creates an empty matrix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the lowest supporting version for a browser.
    pub fn insert(&mut self, feature: Feature, stat_id: impl Into<String>, version: f64) {
        self.minimum.insert((feature, stat_id.into()), version);
    }

    /// Lowest supporting version, if the browser supports the feature at all.
    #[must_use]
    pub fn minimum_version(&self, feature: Feature, stat_id: &str) -> Option<f64> {
        self.minimum.get(&(feature, stat_id.to_string())).copied()
    }

    /// Returns true if nothing was loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.minimum.is_empty()
    }
}

/// A browser identified from a user agent string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrowserIdentity {
    /// caniuse stat id.
    pub stat_id: &'static str,
    /// Major.minor version.
    pub version: f64,
}

struct UaRule {
    pattern: Regex,
    stat_id: &'static str,
    mobile_stat_id: Option<&'static str>,
}

static MOBILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Android|Mobile").expect("Invalid regex"));

static IOS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:iPhone|iPad|iPod).*? OS (\d+)(?:_(\d+))?").expect("Invalid regex")
});

static UA_RULES: LazyLock<Vec<UaRule>> = LazyLock::new(|| {
    let rule = |pattern: &str, stat_id, mobile_stat_id| UaRule {
        pattern: Regex::new(pattern).expect("Invalid regex"),
        stat_id,
        mobile_stat_id,
    };
    vec![
        rule(r"SamsungBrowser/(\d+(?:\.\d+)?)", "samsung", None),
        rule(r"UCBrowser/(\d+(?:\.\d+)?)", "and_uc", None),
        rule(r"QQBrowser/(\d+(?:\.\d+)?)", "and_qq", None),
        rule(r"Opera Mini/(\d+(?:\.\d+)?)", "op_mini", None),
        rule(r"(?:OPR|Opera)/(\d+(?:\.\d+)?)", "opera", None),
        rule(r"Edg(?:e|A)?/(\d+(?:\.\d+)?)", "edge", None),
        rule(r"(?:MSIE |Trident/.*rv:)(\d+(?:\.\d+)?)", "ie", None),
        rule(r"Firefox/(\d+(?:\.\d+)?)", "firefox", Some("and_ff")),
        rule(r"Chrome/(\d+(?:\.\d+)?)", "chrome", Some("and_chr")),
        rule(r"Version/(\d+(?:\.\d+)?).*Safari/", "safari", None),
        rule(r"Android (\d+(?:\.\d+)?)", "android", None),
    ]
});

/// Identifies the browser family and version from a user agent string.
///
/// iOS browsers all share the system WebKit, so any iOS device maps to
/// `ios_saf` with the OS version.
#[must_use]
pub fn parse_user_agent(user_agent: &str) -> Option<BrowserIdentity> {
    if let Some(caps) = IOS_RE.captures(user_agent) {
        let major = caps.get(1)?.as_str();
        let minor = caps.get(2).map_or("0", |m| m.as_str());
        let version = format!("{major}.{minor}").parse().ok()?;
        return Some(BrowserIdentity {
            stat_id: "ios_saf",
            version,
        });
    }

    let mobile = MOBILE_RE.is_match(user_agent);
    UA_RULES.iter().find_map(|rule| {
        let caps = rule.pattern.captures(user_agent)?;
        let version = caps.get(1)?.as_str().parse().ok()?;
        let stat_id = match rule.mobile_stat_id {
            Some(id) if mobile => id,
            _ => rule.stat_id,
        };
        Some(BrowserIdentity { stat_id, version })
    })
}

/// Maps request headers to a concrete output format.
#[derive(Debug, Clone, Default)]
pub struct CapabilityNegotiator {
    matrix: Option<Arc<CapabilityMatrix>>,
}

impl CapabilityNegotiator {
    /// Creates a negotiator; without a matrix only the `Accept` strategy is
    /// available.
    #[must_use]
    pub const fn new(matrix: Option<Arc<CapabilityMatrix>>) -> Self {
        Self { matrix }
    }

    /// Resolves `auto` to a concrete format.
    #[must_use]
    pub fn resolve(&self, context: &NegotiationContext) -> ImageFormat {
        if let Some(accept) = context.accept.as_deref() {
            return Self::from_accept(accept);
        }

        context
            .user_agent
            .as_deref()
            .and_then(|ua| self.from_user_agent(ua))
            .unwrap_or(ImageFormat::Jpeg)
    }

    /// Accept-header strategy: the first `image/<subtype>` entry naming a
    /// known format wins; otherwise `jpeg`.
    #[must_use]
    pub fn from_accept(accept: &str) -> ImageFormat {
        accept
            .split(',')
            .map(|entry| entry.split(';').next().unwrap_or_default().trim())
            .filter_map(|media| media.strip_prefix("image/"))
            .find_map(ImageFormat::from_name)
            .unwrap_or(ImageFormat::Jpeg)
    }

    /// Device-capability strategy: AVIF, then WebP, then `jpeg`.
    /// Returns `None` when no capability matrix is configured.
    #[must_use]
    pub fn from_user_agent(&self, user_agent: &str) -> Option<ImageFormat> {
        let matrix = self.matrix.as_ref()?;
        let Some(browser) = parse_user_agent(user_agent) else {
            trace!(user_agent, "Unrecognized user agent");
            return Some(ImageFormat::Jpeg);
        };

        let supports = |feature| {
            matrix
                .minimum_version(feature, browser.stat_id)
                .is_some_and(|min| browser.version >= min)
        };

        let format = if supports(Feature::Avif) {
            ImageFormat::Avif
        } else if supports(Feature::Webp) {
            ImageFormat::Webp
        } else {
            ImageFormat::Jpeg
        };
        trace!(browser = browser.stat_id, version = browser.version, %format, "Negotiated format from user agent");
        Some(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const CHROME_DESKTOP: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const CHROME_OLD: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/70.0.3538.77 Safari/537.36";
    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 15_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.4 Mobile/15E148 Safari/604.1";
    const FIREFOX_ANDROID: &str = "Mozilla/5.0 (Android 13; Mobile; rv:121.0) Gecko/121.0 Firefox/121.0";
    const EDGE: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91";

    fn matrix() -> Arc<CapabilityMatrix> {
        let mut m = CapabilityMatrix::new();
        m.insert(Feature::Avif, "chrome", 85.0);
        m.insert(Feature::Webp, "chrome", 32.0);
        m.insert(Feature::Webp, "ios_saf", 14.0);
        m.insert(Feature::Avif, "ios_saf", 16.0);
        m.insert(Feature::Webp, "and_ff", 121.0);
        Arc::new(m)
    }

    #[test_case("image/avif,image/webp,*/*", ImageFormat::Avif ; "avif_first")]
    #[test_case("image/webp,image/avif", ImageFormat::Webp ; "webp_first")]
    #[test_case("text/html,application/xhtml+xml,*/*;q=0.8", ImageFormat::Jpeg ; "no_image_entries")]
    #[test_case("image/svg+xml,image/png;q=0.9", ImageFormat::Png ; "skips_unknown_subtype")]
    #[test_case("", ImageFormat::Jpeg ; "empty_header")]
    fn test_from_accept(accept: &str, expected: ImageFormat) {
        assert_eq!(CapabilityNegotiator::from_accept(accept), expected);
    }

    #[test_case(CHROME_DESKTOP, "chrome", 120.0 ; "chrome_desktop")]
    #[test_case(IPHONE, "ios_saf", 15.4 ; "iphone")]
    #[test_case(FIREFOX_ANDROID, "and_ff", 121.0 ; "firefox_android")]
    #[test_case(EDGE, "edge", 120.0 ; "edge_before_chrome")]
    fn test_parse_user_agent(ua: &str, stat_id: &str, version: f64) {
        let browser = parse_user_agent(ua).unwrap();
        assert_eq!(browser.stat_id, stat_id);
        assert!((browser.version - version).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_user_agent() {
        assert!(parse_user_agent("curl/8.0").is_none());
    }

    #[test_case(CHROME_DESKTOP, ImageFormat::Avif ; "modern_chrome_gets_avif")]
    #[test_case(CHROME_OLD, ImageFormat::Webp ; "old_chrome_gets_webp")]
    #[test_case(IPHONE, ImageFormat::Webp ; "ios_15_gets_webp")]
    #[test_case(EDGE, ImageFormat::Jpeg ; "browser_missing_from_matrix")]
    #[test_case("curl/8.0", ImageFormat::Jpeg ; "unparseable_agent")]
    fn test_from_user_agent(ua: &str, expected: ImageFormat) {
        let negotiator = CapabilityNegotiator::new(Some(matrix()));
        assert_eq!(negotiator.from_user_agent(ua), Some(expected));
    }

    #[test]
    fn test_accept_takes_precedence_over_user_agent() {
        let negotiator = CapabilityNegotiator::new(Some(matrix()));
        let ctx = NegotiationContext::new(Some("*/*".into()), Some(CHROME_DESKTOP.into()));
        assert_eq!(negotiator.resolve(&ctx), ImageFormat::Jpeg);
    }

    #[test]
    fn test_user_agent_used_without_accept() {
        let negotiator = CapabilityNegotiator::new(Some(matrix()));
        let ctx = NegotiationContext::new(None, Some(CHROME_DESKTOP.into()));
        assert_eq!(negotiator.resolve(&ctx), ImageFormat::Avif);
    }

    #[test]
    fn test_no_matrix_falls_back_to_jpeg() {
        let negotiator = CapabilityNegotiator::default();
        let ctx = NegotiationContext::new(None, Some(CHROME_DESKTOP.into()));
        assert_eq!(negotiator.resolve(&ctx), ImageFormat::Jpeg);
    }
}
