//! Typed option values for the `name|key:value,...` mini-language.
//!
//! Raw option values are coerced into booleans, numbers or strings. Keys may
//! be dot-paths (`crop.x`), which [`unflatten`] turns into nested maps and
//! [`flatten`] turns back into dot-paths for canonical encoding.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Nested option structure. Keys are kept sorted so iteration order is
/// deterministic.
pub type Options = BTreeMap<String, OptionValue>;

/// A single coerced option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    /// `true` / `false`.
    Bool(bool),
    /// Any finite numeric-looking value.
    Number(f64),
    /// Everything else.
    Text(String),
    /// Nested options produced by dot-path keys.
    Map(Options),
}

/// Raised when dot-path keys cannot be merged into one tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conflicting option key `{0}`")]
pub struct OptionKeyConflict(pub String);

impl OptionValue {
    /// Coerces a raw string: `"true"`/`"false"` become booleans,
    /// numeric-looking strings become numbers, anything else stays text.
    #[must_use]
    pub fn coerce(raw: &str) -> Self {
        match raw {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }

        match raw.trim().parse::<f64>() {
            Ok(n) if n.is_finite() && looks_numeric(raw) => Self::Number(n),
            _ => Self::Text(raw.to_string()),
        }
    }

    /// Returns the value as a number, if it is one.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value as a boolean, if it is one.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the value as text, if it is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the nested map, if this is one.
    #[must_use]
    pub const fn as_map(&self) -> Option<&Options> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Interprets a map keyed `0..n` as an ordered list.
    ///
    /// `kernel.0:1,kernel.1:2` unflattens into `{kernel: {0: 1, 1: 2}}`, which
    /// this turns back into `[1, 2]`.
    #[must_use]
    pub fn as_list(&self) -> Option<Vec<&Self>> {
        let map = self.as_map()?;
        let mut items = Vec::with_capacity(map.len());
        for index in 0..map.len() {
            items.push(map.get(&index.to_string())?);
        }
        Some(items)
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{}", format_number(*n)),
            Self::Text(s) => f.write_str(s),
            Self::Map(m) => {
                let flat = flatten(m);
                let parts: Vec<String> = flat.iter().map(|(k, v)| format!("{k}:{v}")).collect();
                write!(f, "{{{}}}", parts.join(","))
            }
        }
    }
}

/// Formats integral values without a trailing `.0` so `10` and `10.0`
/// canonicalize identically.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn looks_numeric(raw: &str) -> bool {
    let lower = raw.trim().to_ascii_lowercase();
    !lower.is_empty() && !lower.contains("inf") && !lower.contains("nan")
}

/// Flattens a nested option tree into dot-path keys.
///
/// An empty nested map has no leaves and contributes no keys. Trees built by
/// [`unflatten`] never contain one, so the two functions round-trip.
#[must_use]
pub fn flatten(options: &Options) -> BTreeMap<String, OptionValue> {
    let mut out = BTreeMap::new();
    flatten_into(options, None, &mut out);
    out
}

fn flatten_into(options: &Options, prefix: Option<&str>, out: &mut BTreeMap<String, OptionValue>) {
    for (key, value) in options {
        let path = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            OptionValue::Map(nested) => flatten_into(nested, Some(&path), out),
            scalar => {
                out.insert(path, scalar.clone());
            }
        }
    }
}

/// Builds a nested option tree from dot-path keys.
///
/// Later duplicates of the same path overwrite earlier ones. A path that is
/// both a leaf and a prefix of another path is a conflict. Leaves must be
/// scalars; a map value is rejected.
///
/// # Errors
/// Returns [`OptionKeyConflict`] on conflicting or malformed paths.
pub fn unflatten<I>(entries: I) -> Result<Options, OptionKeyConflict>
where
    I: IntoIterator<Item = (String, OptionValue)>,
{
    let mut root = Options::new();

    for (path, value) in entries {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) || matches!(value, OptionValue::Map(_)) {
            return Err(OptionKeyConflict(path));
        }

        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| OptionKeyConflict(path.clone()))?;

        let mut node = &mut root;
        for segment in parents {
            let entry = node
                .entry((*segment).to_string())
                .or_insert_with(|| OptionValue::Map(Options::new()));
            node = match entry {
                OptionValue::Map(m) => m,
                _ => return Err(OptionKeyConflict(path.clone())),
            };
        }

        if matches!(node.get(*last), Some(OptionValue::Map(_))) {
            return Err(OptionKeyConflict(path));
        }
        node.insert((*last).to_string(), value);
    }

    Ok(root)
}
