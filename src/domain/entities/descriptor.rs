//! Request descriptor: the parsed, validated and canonicalized form of an
//! image request.
//!
//! A descriptor is built once from raw query pairs and never changes after
//! construction. Its canonical string flattens every field to dot-path keys,
//! sorts them and URL-encodes the result, so two requests that mean the same
//! thing always produce the same [`CacheKey`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::cache_key::CacheKey;
use super::format::{FitMode, ImageFormat};
use super::options::{OptionValue, Options, flatten, unflatten};
use crate::domain::errors::ValidationError;
use crate::domain::services::{CapabilityNegotiator, NegotiationContext};

const AUTO_FORMAT: &str = "auto";

/// How the source URL is cleaned before hashing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlCleanMode {
    /// Leave the URL untouched.
    Off,
    /// Drop everything from the first `#`.
    #[default]
    Fragment,
    /// Drop the fragment, then everything from the first `?`.
    Query,
}

impl UrlCleanMode {
    /// Applies the cleaning rule.
    #[must_use]
    pub fn apply(self, url: &str) -> String {
        let without_fragment = || url.split('#').next().unwrap_or_default();
        match self {
            Self::Off => url.to_string(),
            Self::Fragment => without_fragment().to_string(),
            Self::Query => without_fragment()
                .split('?')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }
}

impl std::str::FromStr for UrlCleanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "fragment" => Ok(Self::Fragment),
            "query" => Ok(Self::Query),
            other => Err(format!("unknown clean mode `{other}`, expected off, fragment or query")),
        }
    }
}

/// Server-side rules that shape descriptor parsing.
#[derive(Debug, Clone, Default)]
pub struct DescriptorRules {
    /// Named query-string fragments.
    pub presets: HashMap<String, String>,
    /// Only `url` and `preset` may be supplied by clients.
    pub only_allow_presets: bool,
    /// URL cleaning applied before hashing.
    pub clean_urls: UrlCleanMode,
    /// Resolves `format=auto`.
    pub negotiator: CapabilityNegotiator,
}

/// A `name|key:value,...` parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexParameter {
    /// Operation or format name.
    pub name: String,
    /// Coerced, unflattened options.
    pub options: Options,
}

impl ComplexParameter {
    /// Parses the mini-language. Pairs with an empty key or value are
    /// skipped.
    ///
    /// # Errors
    /// Returns a violation message if the name is missing or option keys
    /// conflict.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (name, options_raw) = raw.split_once('|').unwrap_or((raw, ""));
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("invalid parameter `{raw}`: missing name"));
        }

        let pairs = options_raw
            .split(',')
            .filter_map(|option| option.split_once(':'))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .map(|(k, v)| (k.to_string(), OptionValue::coerce(v)));

        let options = unflatten(pairs).map_err(|e| format!("invalid parameter `{raw}`: {e}"))?;

        Ok(Self {
            name: name.to_string(),
            options,
        })
    }
}

/// Requested output encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFormat {
    /// Concrete format; `auto` is resolved before construction finishes.
    pub format: ImageFormat,
    /// Encoder options (`quality`, ...).
    pub options: Options,
}

/// Requested resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeSpec {
    /// Fit keyword.
    pub fit: FitMode,
    /// Target width.
    pub width: Option<u32>,
    /// Target height.
    pub height: Option<u32>,
}

/// Raw query fields before validation.
#[derive(Debug, Default)]
struct RawFields {
    url: Option<String>,
    format: Option<String>,
    resize: Option<String>,
    width: Option<String>,
    height: Option<String>,
    ops: Vec<String>,
    preset: Option<String>,
}

impl RawFields {
    fn collect(query: &[(String, String)], only_allow_presets: bool) -> Result<Self, ValidationError> {
        let mut fields = Self::default();
        let mut violations = Vec::new();
        let mut disallowed = Vec::new();

        for (key, value) in query {
            let slot = match key.as_str() {
                "op" => {
                    if only_allow_presets {
                        disallowed.push(key.clone());
                    } else {
                        fields.ops.push(value.clone());
                    }
                    continue;
                }
                "url" => &mut fields.url,
                "preset" => &mut fields.preset,
                "format" => &mut fields.format,
                "resize" => &mut fields.resize,
                "width" => &mut fields.width,
                "height" => &mut fields.height,
                other => {
                    if only_allow_presets {
                        disallowed.push(other.to_string());
                    } else {
                        debug!(key = other, "Ignoring unknown query parameter");
                    }
                    continue;
                }
            };

            if only_allow_presets && !matches!(key.as_str(), "url" | "preset") {
                disallowed.push(key.clone());
                continue;
            }
            if slot.is_some() {
                violations.push(format!("{key} must be given at most once"));
            }
            *slot = Some(value.clone());
        }

        if only_allow_presets {
            if !disallowed.is_empty() {
                disallowed.dedup();
                violations.push(format!(
                    "only the url and preset parameters are allowed, got {}",
                    disallowed.join(", ")
                ));
            }
            if fields.preset.is_none() {
                violations.push("preset is required".to_string());
            }
        }

        if violations.is_empty() {
            Ok(fields)
        } else {
            Err(ValidationError::new(violations))
        }
    }

    /// Merges a preset fragment. Preset values override request values;
    /// preset `op` entries replace the request's operation list. `url` and
    /// `preset` cannot be set by a preset.
    fn merge_preset(&mut self, fragment: &str) {
        let mut preset_ops = Vec::new();
        for (key, value) in url::form_urlencoded::parse(fragment.trim_start_matches('?').as_bytes()) {
            let value = value.into_owned();
            match key.as_ref() {
                "op" => preset_ops.push(value),
                "format" => self.format = Some(value),
                "resize" => self.resize = Some(value),
                "width" => self.width = Some(value),
                "height" => self.height = Some(value),
                other => debug!(key = other, "Ignoring preset parameter"),
            }
        }
        if !preset_ops.is_empty() {
            self.ops = preset_ops;
        }
    }
}

/// Parsed, validated and canonicalized image request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    url: String,
    format: OutputFormat,
    resize: Option<ResizeSpec>,
    width: Option<u32>,
    height: Option<u32>,
    operations: Vec<ComplexParameter>,
    preset: Option<String>,
    canonical: String,
    cache_key: CacheKey,
    origin_key: CacheKey,
}

impl RequestDescriptor {
    /// Parses raw query pairs into a descriptor.
    ///
    /// `context` carries the headers used to resolve `format=auto`; asking
    /// for `auto` without it is a validation failure.
    ///
    /// # Errors
    /// Returns a [`ValidationError`] listing every violated constraint.
    pub fn parse(
        query: &[(String, String)],
        rules: &DescriptorRules,
        context: Option<&NegotiationContext>,
    ) -> Result<Self, ValidationError> {
        let mut fields = RawFields::collect(query, rules.only_allow_presets)?;

        if let Some(name) = fields.preset.clone() {
            let fragment = rules
                .presets
                .get(&name)
                .ok_or_else(|| ValidationError::single("preset not found"))?;
            fields.merge_preset(fragment);
        }

        let mut violations = Vec::new();

        let url = match fields.url.as_deref() {
            None | Some("") => {
                violations.push("url is required".to_string());
                None
            }
            Some(raw) => match Url::parse(raw) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Some(raw.to_string()),
                _ => {
                    violations.push("url must be a valid http(s) URL".to_string());
                    None
                }
            },
        };

        let width = parse_dimension("width", fields.width.as_deref(), &mut violations);
        let height = parse_dimension("height", fields.height.as_deref(), &mut violations);

        let fit = match fields.resize.as_deref() {
            Some(raw) => {
                let fit = FitMode::from_name(raw);
                if fit.is_none() {
                    violations.push(format!("resize must be one of {}", FitMode::NAMES));
                }
                fit
            }
            None => None,
        };

        // Dimensions without a fit are kept in the key but never resize.
        let resize = fields.resize.as_ref().map(|_| {
            if fields.width.is_none() && fields.height.is_none() {
                violations.push("width or height is required when resizing".to_string());
            }
            ResizeSpec {
                fit: fit.unwrap_or_default(),
                width,
                height,
            }
        });

        let format = parse_format(fields.format.as_deref(), rules, context, &mut violations);

        let mut operations = Vec::with_capacity(fields.ops.len());
        for raw in &fields.ops {
            match ComplexParameter::parse(raw) {
                Ok(op) => operations.push(op),
                Err(violation) => violations.push(violation),
            }
        }

        let (Some(url), Some(format), true) = (url, format, violations.is_empty()) else {
            return Err(ValidationError::new(violations));
        };

        let url = rules.clean_urls.apply(&url);
        let mut descriptor = Self {
            origin_key: CacheKey::digest(&url),
            url,
            format,
            resize,
            width,
            height,
            operations,
            preset: fields.preset,
            canonical: String::new(),
            cache_key: CacheKey::from_hex(String::new()),
        };
        descriptor.canonical = descriptor.to_canonical_string();
        descriptor.cache_key = CacheKey::digest(&descriptor.canonical);

        debug!(key = %descriptor.cache_key, url = %descriptor.url, "Parsed request descriptor");
        Ok(descriptor)
    }

    /// Cleaned source URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolved output format.
    #[must_use]
    pub const fn output(&self) -> &OutputFormat {
        &self.format
    }

    /// Requested resize, if any.
    #[must_use]
    pub const fn resize(&self) -> Option<&ResizeSpec> {
        self.resize.as_ref()
    }

    /// Requested width, with or without a resize.
    #[must_use]
    pub const fn width(&self) -> Option<u32> {
        self.width
    }

    /// Requested height, with or without a resize.
    #[must_use]
    pub const fn height(&self) -> Option<u32> {
        self.height
    }

    /// Requested operations in order.
    #[must_use]
    pub fn operations(&self) -> &[ComplexParameter] {
        &self.operations
    }

    /// Preset name, if one was used.
    #[must_use]
    pub fn preset(&self) -> Option<&str> {
        self.preset.as_deref()
    }

    /// Canonical, order-independent serialization.
    #[must_use]
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Key of the derived variant.
    #[must_use]
    pub const fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    /// Key of the unmodified source bytes.
    #[must_use]
    pub const fn origin_key(&self) -> &CacheKey {
        &self.origin_key
    }

    /// Flattens every field to dot-paths and encodes them as a sorted query
    /// string.
    #[must_use]
    pub fn to_canonical_string(&self) -> String {
        let mut flat: BTreeMap<String, String> = BTreeMap::new();
        flat.insert("url".into(), self.url.clone());

        flat.insert("format.name".into(), self.format.format.as_str().into());
        insert_options(&mut flat, "format.options", &self.format.options);

        if let Some(resize) = &self.resize {
            flat.insert("resize".into(), resize.fit.as_str().into());
        }
        if let Some(w) = self.width {
            flat.insert("width".into(), w.to_string());
        }
        if let Some(h) = self.height {
            flat.insert("height".into(), h.to_string());
        }

        for (index, op) in self.operations.iter().enumerate() {
            flat.insert(format!("op.{index}.name"), op.name.clone());
            insert_options(&mut flat, &format!("op.{index}.options"), &op.options);
        }

        if let Some(preset) = &self.preset {
            flat.insert("preset".into(), preset.clone());
        }

        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(flat.iter())
            .finish()
    }
}

fn insert_options(flat: &mut BTreeMap<String, String>, prefix: &str, options: &Options) {
    for (key, value) in flatten(options) {
        flat.insert(format!("{prefix}.{key}"), value.to_string());
    }
}

fn parse_dimension(name: &str, raw: Option<&str>, violations: &mut Vec<String>) -> Option<u32> {
    let raw = raw?;
    match raw.trim().parse::<u32>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            violations.push(format!("{name} must be a positive integer"));
            None
        }
    }
}

fn parse_format(
    raw: Option<&str>,
    rules: &DescriptorRules,
    context: Option<&NegotiationContext>,
    violations: &mut Vec<String>,
) -> Option<OutputFormat> {
    let param = match ComplexParameter::parse(raw.unwrap_or(AUTO_FORMAT)) {
        Ok(param) => param,
        Err(violation) => {
            violations.push(violation);
            return None;
        }
    };

    let format = if param.name == AUTO_FORMAT {
        let Some(context) = context else {
            violations.push("cannot use auto format without negotiation headers".to_string());
            return None;
        };
        rules.negotiator.resolve(context)
    } else if let Some(format) = ImageFormat::from_name(&param.name) {
        format
    } else {
        violations.push(format!("unsupported output format `{}`", param.name));
        return None;
    };

    Some(OutputFormat {
        format,
        options: param.options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(raw: &str) -> Vec<(String, String)> {
        url::form_urlencoded::parse(raw.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    fn accept(value: &str) -> NegotiationContext {
        NegotiationContext::new(Some(value.to_string()), None)
    }

    fn parse(raw: &str) -> Result<RequestDescriptor, ValidationError> {
        RequestDescriptor::parse(&query(raw), &DescriptorRules::default(), Some(&accept("*/*")))
    }

    fn preset_rules(only: bool) -> DescriptorRules {
        let mut presets = HashMap::new();
        presets.insert("thumb".to_string(), "resize=cover&width=200&height=200&format=webp".to_string());
        presets.insert("mono".to_string(), "op=grayscale&op=blur|sigma:2".to_string());
        DescriptorRules {
            presets,
            only_allow_presets: only,
            ..DescriptorRules::default()
        }
    }

    #[test]
    fn test_parameter_order_does_not_change_hash() {
        let a = parse("url=https://a.test/x.png&width=100&resize=inside&format=png").unwrap();
        let b = parse("format=png&resize=inside&url=https://a.test/x.png&width=100").unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_option_order_does_not_change_hash() {
        let a = parse("url=https://a.test/x.png&op=modulate|brightness:2,hue:90").unwrap();
        let b = parse("url=https://a.test/x.png&op=modulate|hue:90,brightness:2").unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_operation_order_changes_hash() {
        let a = parse("url=https://a.test/x.png&op=flip&op=blur").unwrap();
        let b = parse("url=https://a.test/x.png&op=blur&op=flip").unwrap();
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_nested_options_are_canonicalized_as_dot_paths() {
        let d = parse("url=https://a.test/x.png&op=tint|rgb.r:255,rgb.g:0,rgb.b:10").unwrap();
        let rgb = d.operations()[0].options.get("rgb").and_then(OptionValue::as_map).unwrap();
        assert_eq!(rgb.get("r"), Some(&OptionValue::Number(255.0)));
        assert!(d.canonical().contains("op.0.options.rgb.r=255"));
    }

    #[test]
    fn test_resize_without_dimensions_fails() {
        let err = parse("url=https://a.test/x.png&resize=cover").unwrap_err();
        assert!(err.mentions("width or height is required"));
    }

    #[test]
    fn test_resize_with_one_dimension_succeeds() {
        let d = parse("url=https://a.test/x.png&resize=cover&height=50").unwrap();
        assert_eq!(
            d.resize(),
            Some(&ResizeSpec {
                fit: FitMode::Cover,
                width: None,
                height: Some(50)
            })
        );
    }

    #[test]
    fn test_width_without_fit_does_not_resize() {
        let bare = parse("url=https://a.test/x.png").unwrap();
        let sized = parse("url=https://a.test/x.png&width=80").unwrap();
        let fitted = parse("url=https://a.test/x.png&width=80&resize=cover").unwrap();

        assert_eq!(sized.resize(), None);
        assert_eq!(sized.width(), Some(80));
        assert!(sized.canonical().contains("width=80"));
        assert_ne!(sized.cache_key(), bare.cache_key());
        assert_ne!(sized.cache_key(), fitted.cache_key());
    }

    #[test]
    fn test_width_without_fit_is_still_validated() {
        let err = parse("url=https://a.test/x.png&width=0").unwrap_err();
        assert!(err.mentions("width must be a positive integer"));
    }

    #[test]
    fn test_invalid_fields_are_all_reported() {
        let err = parse("url=not-a-url&resize=squash&width=-3&height=abc&format=bmp").unwrap_err();
        assert!(err.mentions("url must be a valid"));
        assert!(err.mentions("resize must be one of"));
        assert!(err.mentions("width must be a positive integer"));
        assert!(err.mentions("height must be a positive integer"));
        assert!(err.mentions("unsupported output format `bmp`"));
    }

    #[test]
    fn test_missing_url() {
        let err = parse("width=10").unwrap_err();
        assert!(err.mentions("url is required"));
    }

    #[test]
    fn test_operation_without_name_fails() {
        let err = parse("url=https://a.test/x.png&op=|sigma:2").unwrap_err();
        assert!(err.mentions("missing name"));
    }

    #[test]
    fn test_duplicate_url_fails() {
        let err = parse("url=https://a.test/x.png&url=https://b.test/y.png").unwrap_err();
        assert!(err.mentions("url must be given at most once"));
    }

    #[test]
    fn test_auto_format_uses_accept_header() {
        let d = RequestDescriptor::parse(
            &query("url=https://a.test/x.png&format=auto"),
            &DescriptorRules::default(),
            Some(&accept("image/avif,image/webp,*/*")),
        )
        .unwrap();
        assert_eq!(d.output().format, ImageFormat::Avif);
        assert!(d.canonical().contains("format.name=avif"));
    }

    #[test]
    fn test_missing_format_defaults_to_auto() {
        let d = RequestDescriptor::parse(
            &query("url=https://a.test/x.png"),
            &DescriptorRules::default(),
            Some(&accept("text/html")),
        )
        .unwrap();
        assert_eq!(d.output().format, ImageFormat::Jpeg);
    }

    #[test]
    fn test_auto_format_without_context_fails() {
        let err = RequestDescriptor::parse(
            &query("url=https://a.test/x.png&format=auto"),
            &DescriptorRules::default(),
            None,
        )
        .unwrap_err();
        assert!(err.mentions("cannot use auto format"));
    }

    #[test]
    fn test_explicit_format_with_options() {
        let d = parse("url=https://a.test/x.png&format=jpeg|quality:80").unwrap();
        assert_eq!(d.output().format, ImageFormat::Jpeg);
        assert_eq!(d.output().options.get("quality"), Some(&OptionValue::Number(80.0)));
    }

    #[test]
    fn test_clean_urls_modes() {
        let raw = "https://a.test/x.png?v=2#frag";
        assert_eq!(UrlCleanMode::Off.apply(raw), raw);
        assert_eq!(UrlCleanMode::Fragment.apply(raw), "https://a.test/x.png?v=2");
        assert_eq!(UrlCleanMode::Query.apply(raw), "https://a.test/x.png");
    }

    #[test]
    fn test_cache_key_reflects_cleaned_url() {
        let rules = DescriptorRules {
            clean_urls: UrlCleanMode::Query,
            ..DescriptorRules::default()
        };
        let ctx = accept("*/*");
        let a = RequestDescriptor::parse(&query("url=https://a.test/x.png%3Fv%3D1"), &rules, Some(&ctx)).unwrap();
        let b = RequestDescriptor::parse(&query("url=https://a.test/x.png%3Fv%3D2"), &rules, Some(&ctx)).unwrap();
        assert_eq!(a.url(), "https://a.test/x.png");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.origin_key(), &CacheKey::digest("https://a.test/x.png"));
    }

    #[test]
    fn test_origin_key_differs_from_cache_key() {
        let d = parse("url=https://a.test/x.png").unwrap();
        assert_ne!(d.origin_key(), d.cache_key());
    }

    #[test]
    fn test_preset_is_merged() {
        let d = RequestDescriptor::parse(
            &query("url=https://a.test/x.png&preset=thumb"),
            &preset_rules(false),
            Some(&accept("*/*")),
        )
        .unwrap();
        assert_eq!(d.output().format, ImageFormat::Webp);
        assert_eq!(d.resize().and_then(|r| r.width), Some(200));
        assert_eq!(d.preset(), Some("thumb"));
    }

    #[test]
    fn test_preset_ops_replace_request_ops() {
        let d = RequestDescriptor::parse(
            &query("url=https://a.test/x.png&preset=mono&op=flip"),
            &preset_rules(false),
            Some(&accept("*/*")),
        )
        .unwrap();
        let names: Vec<&str> = d.operations().iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["grayscale", "blur"]);
    }

    #[test]
    fn test_unknown_preset() {
        let err = RequestDescriptor::parse(
            &query("url=https://a.test/x.png&preset=nope"),
            &preset_rules(false),
            Some(&accept("*/*")),
        )
        .unwrap_err();
        assert!(err.mentions("preset not found"));
    }

    #[test]
    fn test_preset_only_mode_accepts_url_and_preset() {
        let result = RequestDescriptor::parse(
            &query("url=https://a.test/x.png&preset=thumb"),
            &preset_rules(true),
            Some(&accept("*/*")),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_preset_only_mode_rejects_other_fields() {
        let err = RequestDescriptor::parse(
            &query("url=https://a.test/x.png&preset=thumb&width=10"),
            &preset_rules(true),
            Some(&accept("*/*")),
        )
        .unwrap_err();
        assert!(err.mentions("only the url and preset parameters are allowed"));
    }

    #[test]
    fn test_preset_only_mode_requires_preset() {
        let err = RequestDescriptor::parse(
            &query("url=https://a.test/x.png"),
            &preset_rules(true),
            Some(&accept("*/*")),
        )
        .unwrap_err();
        assert!(err.mentions("preset is required"));
    }

    #[test]
    fn test_preset_only_mode_unknown_preset() {
        let err = RequestDescriptor::parse(
            &query("url=https://a.test/x.png&preset=nope"),
            &preset_rules(true),
            Some(&accept("*/*")),
        )
        .unwrap_err();
        assert!(err.mentions("preset not found"));
    }

    #[test]
    fn test_unknown_keys_do_not_affect_hash() {
        let a = parse("url=https://a.test/x.png&utm_source=mail").unwrap();
        let b = parse("url=https://a.test/x.png").unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
    }
}
