//! Declarative validation of stream configuration maps.
//!
//! Each stream kind declares a table of [`ParamSpec`]s. A configuration map
//! is checked against the table (unknown keys, missing keys, types, bounds,
//! choices), defaults are filled in, and the result is deserialised into the
//! kind's typed configuration struct.
//!
//! # Example
//! ```
//! use scosim_core::schema::{self, ParamDefault, ParamKind, ParamSpec};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Cfg {
//!     per: f64,
//! }
//!
//! const SPECS: &[ParamSpec] = &[ParamSpec::optional("per", ParamKind::percent())
//!     .with_default(ParamDefault::Number(0.0))];
//!
//! let cfg: Cfg = schema::parse(SPECS, &serde_json::Map::new()).unwrap();
//! assert_eq!(cfg.per, 0.0);
//! ```

use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Key/value configuration as handed to constructors and `config()`.
pub type ConfigMap = Map<String, Value>;

/// Accepted value shape for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    /// JSON integer, optionally bounded
    Integer { min: Option<i64>, max: Option<i64> },
    /// Any JSON number, optionally bounded
    Number { min: Option<f64>, max: Option<f64> },
    Bool,
    /// String, restricted to `choices` unless the list is empty
    Str { choices: &'static [&'static str] },
    /// Integer restricted to a fixed set
    IntChoice { choices: &'static [i64] },
}

impl ParamKind {
    /// Percentage in `[0, 100]`.
    pub const fn percent() -> Self {
        ParamKind::Number {
            min: Some(0.0),
            max: Some(100.0),
        }
    }

    pub const fn int_at_least(min: i64) -> Self {
        ParamKind::Integer {
            min: Some(min),
            max: None,
        }
    }

    pub const fn number_at_least(min: f64) -> Self {
        ParamKind::Number {
            min: Some(min),
            max: None,
        }
    }

    pub const fn any_number() -> Self {
        ParamKind::Number {
            min: None,
            max: None,
        }
    }

    pub const fn any_string() -> Self {
        ParamKind::Str { choices: &[] }
    }

    fn expected(&self) -> &'static str {
        match self {
            ParamKind::Integer { .. } | ParamKind::IntChoice { .. } => "an integer",
            ParamKind::Number { .. } => "a number",
            ParamKind::Bool => "a boolean",
            ParamKind::Str { .. } => "a string",
        }
    }
}

/// Value filled in when a key is absent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamDefault {
    /// Key stays absent
    Absent,
    Null,
    Int(i64),
    Number(f64),
    Bool(bool),
    Str(&'static str),
}

impl ParamDefault {
    fn to_value(self) -> Option<Value> {
        match self {
            ParamDefault::Absent => None,
            ParamDefault::Null => Some(Value::Null),
            ParamDefault::Int(v) => Some(Value::from(v)),
            ParamDefault::Number(v) => Some(Value::from(v)),
            ParamDefault::Bool(v) => Some(Value::from(v)),
            ParamDefault::Str(v) => Some(Value::from(v)),
        }
    }
}

/// Declaration of one configuration key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub key: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    /// `null` is accepted in place of a value
    pub nullable: bool,
    pub default: ParamDefault,
}

impl ParamSpec {
    pub const fn required(key: &'static str, kind: ParamKind) -> Self {
        Self {
            key,
            kind,
            required: true,
            nullable: false,
            default: ParamDefault::Absent,
        }
    }

    pub const fn optional(key: &'static str, kind: ParamKind) -> Self {
        Self {
            key,
            kind,
            required: false,
            nullable: false,
            default: ParamDefault::Absent,
        }
    }

    pub const fn with_default(mut self, default: ParamDefault) -> Self {
        self.default = default;
        self
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    fn check(&self, value: &Value) -> Result<(), ConfigError> {
        if value.is_null() && self.nullable {
            return Ok(());
        }

        let invalid_type = || ConfigError::InvalidType {
            key: self.key.to_string(),
            expected: self.kind.expected(),
        };

        match self.kind {
            ParamKind::Integer { min, max } => {
                let v = as_integer(value).ok_or_else(invalid_type)?;
                check_range(
                    self.key,
                    v as f64,
                    min.map(|m| m as f64),
                    max.map(|m| m as f64),
                )
            }
            ParamKind::Number { min, max } => {
                let v = value.as_f64().ok_or_else(invalid_type)?;
                check_range(self.key, v, min, max)
            }
            ParamKind::Bool => value.as_bool().map(|_| ()).ok_or_else(invalid_type),
            ParamKind::Str { choices } => {
                let v = value.as_str().ok_or_else(invalid_type)?;
                if choices.is_empty() || choices.contains(&v) {
                    Ok(())
                } else {
                    Err(ConfigError::InvalidChoice {
                        key: self.key.to_string(),
                        value: v.to_string(),
                        choices: choices.join("|"),
                    })
                }
            }
            ParamKind::IntChoice { choices } => {
                let v = as_integer(value).ok_or_else(invalid_type)?;
                if choices.contains(&v) {
                    Ok(())
                } else {
                    Err(ConfigError::InvalidChoice {
                        key: self.key.to_string(),
                        value: v.to_string(),
                        choices: choices
                            .iter()
                            .map(i64::to_string)
                            .collect::<Vec<_>>()
                            .join("|"),
                    })
                }
            }
        }
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_u64().and_then(|v| i64::try_from(v).ok()))
}

fn check_range(key: &str, value: f64, min: Option<f64>, max: Option<f64>) -> Result<(), ConfigError> {
    let lo = min.unwrap_or(f64::NEG_INFINITY);
    let hi = max.unwrap_or(f64::INFINITY);
    if value < lo || value > hi {
        return Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value,
            min: lo,
            max: hi,
        });
    }
    Ok(())
}

/// Validate `map` against `specs` and fill in defaults.
///
/// # Errors
/// The first offending key, in this order: unknown keys, then each declared
/// key in table order.
pub fn validate(specs: &[ParamSpec], map: &ConfigMap) -> Result<ConfigMap, ConfigError> {
    if let Some(key) = map.keys().find(|k| !specs.iter().any(|s| s.key == k.as_str())) {
        return Err(ConfigError::UnknownKey { key: key.clone() });
    }

    let mut resolved = map.clone();
    for spec in specs {
        match map.get(spec.key) {
            Some(value) => spec.check(value)?,
            None if spec.required => {
                return Err(ConfigError::MissingKey {
                    key: spec.key.to_string(),
                })
            }
            None => {
                if let Some(value) = spec.default.to_value() {
                    resolved.insert(spec.key.to_string(), value);
                }
            }
        }
    }
    Ok(resolved)
}

/// Validate `map` and deserialise it into `T`.
pub fn parse<T: DeserializeOwned>(specs: &[ParamSpec], map: &ConfigMap) -> Result<T, ConfigError> {
    let resolved = validate(specs, map)?;
    serde_json::from_value(Value::Object(resolved))
        .map_err(|e| ConfigError::Malformed(e.to_string()))
}

/// Read the string key that selects which table a map is validated against.
///
/// # Errors
/// `MissingKey` when absent, `InvalidType` for a non-string and
/// `InvalidChoice` for a value outside `choices`.
pub fn discriminant<'a>(map: &'a ConfigMap, key: &str, choices: &[&str]) -> Result<&'a str, ConfigError> {
    let value = map.get(key).ok_or_else(|| ConfigError::MissingKey {
        key: key.to_string(),
    })?;
    let v = value.as_str().ok_or_else(|| ConfigError::InvalidType {
        key: key.to_string(),
        expected: "string",
    })?;
    if !choices.contains(&v) {
        return Err(ConfigError::InvalidChoice {
            key: key.to_string(),
            value: v.to_string(),
            choices: choices.join("|"),
        });
    }
    Ok(v)
}

/// Build a [`ConfigMap`] from a `serde_json::json!` object literal.
///
/// Non-object values yield an empty map.
pub fn config_map(value: Value) -> ConfigMap {
    match value {
        Value::Object(map) => map,
        _ => ConfigMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    const SPECS: &[ParamSpec] = &[
        ParamSpec::required("backing", ParamKind::Str { choices: &["file", "data"] }),
        ParamSpec::optional("per", ParamKind::percent()).with_default(ParamDefault::Number(0.0)),
        ParamSpec::optional("packet_number", ParamKind::int_at_least(1))
            .with_default(ParamDefault::Int(1)),
        ParamSpec::optional("sample_width", ParamKind::IntChoice { choices: &[8, 16] }),
        ParamSpec::optional("seed", ParamKind::int_at_least(0))
            .nullable()
            .with_default(ParamDefault::Null),
        ParamSpec::optional("metadata_enable", ParamKind::Bool)
            .with_default(ParamDefault::Bool(false)),
    ];

    #[derive(Debug, Deserialize)]
    struct Cfg {
        backing: String,
        per: f64,
        packet_number: u32,
        sample_width: Option<u32>,
        seed: Option<u64>,
        metadata_enable: bool,
    }

    #[test]
    fn test_defaults_filled() {
        let cfg: Cfg = parse(SPECS, &config_map(json!({"backing": "data"}))).unwrap();
        assert_eq!(cfg.backing, "data");
        assert_eq!(cfg.per, 0.0);
        assert_eq!(cfg.packet_number, 1);
        assert_eq!(cfg.sample_width, None);
        assert_eq!(cfg.seed, None);
        assert!(!cfg.metadata_enable);
    }

    #[test]
    fn test_integer_accepted_as_number() {
        let cfg: Cfg = parse(SPECS, &config_map(json!({"backing": "file", "per": 10}))).unwrap();
        assert_eq!(cfg.per, 10.0);
    }

    #[test]
    fn test_unknown_key() {
        let err = validate(SPECS, &config_map(json!({"backing": "file", "bogus": 1}))).unwrap_err();
        assert_eq!(err, ConfigError::UnknownKey { key: "bogus".into() });
    }

    #[test]
    fn test_missing_key() {
        let err = validate(SPECS, &ConfigMap::new()).unwrap_err();
        assert_eq!(err, ConfigError::MissingKey { key: "backing".into() });
    }

    #[test]
    fn test_out_of_range_percent() {
        let err = validate(SPECS, &config_map(json!({"backing": "file", "per": 100.5}))).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { ref key, .. } if key == "per"));
    }

    #[test]
    fn test_invalid_type() {
        let err =
            validate(SPECS, &config_map(json!({"backing": "file", "packet_number": 1.5}))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidType { ref key, .. } if key == "packet_number"));
    }

    #[test]
    fn test_choices() {
        let err = validate(SPECS, &config_map(json!({"backing": "tape"}))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidChoice { ref key, .. } if key == "backing"));

        let err =
            validate(SPECS, &config_map(json!({"backing": "data", "sample_width": 24}))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidChoice { ref key, .. } if key == "sample_width"));
    }

    #[test]
    fn test_nullable_seed() {
        let cfg: Cfg = parse(SPECS, &config_map(json!({"backing": "data", "seed": null}))).unwrap();
        assert_eq!(cfg.seed, None);
        let cfg: Cfg = parse(SPECS, &config_map(json!({"backing": "data", "seed": 7}))).unwrap();
        assert_eq!(cfg.seed, Some(7));
    }

    #[test]
    fn test_discriminant() {
        let map = config_map(json!({"backing": "file"}));
        assert_eq!(discriminant(&map, "backing", &["file", "data"]).unwrap(), "file");

        let err = discriminant(&ConfigMap::new(), "backing", &["file"]).unwrap_err();
        assert_eq!(err, ConfigError::MissingKey { key: "backing".to_string() });

        let map = config_map(json!({"backing": "tape"}));
        assert!(matches!(
            discriminant(&map, "backing", &["file", "data"]),
            Err(ConfigError::InvalidChoice { .. })
        ));
    }
}
