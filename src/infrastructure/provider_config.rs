//! Provider configuration binding
//!
//! An exchange stores its provider settings as a property bag, a JSON list of
//! `{ "property": name, "value": value }` entries. Each provider declares the
//! properties it understands in a [`PropertySpec`] table and decodes the bag
//! into its own typed struct with [`decode_config`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Boolean,
    Integer,
    Decimal,
    Text,
    Json,
}

/// One configurable field of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PropertySpec {
    pub name: &'static str,
    pub display_name: &'static str,
    pub kind: PropertyKind,
    pub required: bool,
    pub encrypted: bool,
    pub default: Option<&'static str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyValue {
    #[serde(alias = "Property")]
    pub property: String,
    #[serde(alias = "Value", default)]
    pub value: Value,
}

/// Typed configuration of one provider
pub trait ProviderConfig: DeserializeOwned + Send + Sync + Sized {
    const PROPERTIES: &'static [PropertySpec];

    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Decodes a stored property bag into `C`.
///
/// Names match case-insensitively; properties the provider does not declare
/// are ignored. Missing optional properties fall back to their default.
pub fn decode_config<C: ProviderConfig>(raw: &str) -> Result<C, ConfigError> {
    let values: Vec<PropertyValue> = if raw.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?
    };

    if values.is_empty() {
        return Err(ConfigError::NoProperties);
    }

    let mut fields = Map::new();
    for spec in C::PROPERTIES {
        let provided = values
            .iter()
            .find(|v| v.property.eq_ignore_ascii_case(spec.name))
            .map(|v| &v.value)
            .filter(|v| !is_blank(v));

        let value = match (provided, spec.default) {
            (Some(value), _) => coerce(spec, value)?,
            (None, Some(default)) => coerce(spec, &Value::String(default.to_string()))?,
            (None, None) if spec.required => {
                return Err(ConfigError::MissingProperty(spec.name.to_string()))
            }
            (None, None) => continue,
        };
        fields.insert(spec.name.to_string(), value);
    }

    for value in &values {
        if !C::PROPERTIES
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(&value.property))
        {
            debug!("Ignoring undeclared provider property {}", value.property);
        }
    }

    let config: C = serde_json::from_value(Value::Object(fields)).map_err(|e| {
        ConfigError::InvalidProperty {
            name: "*".to_string(),
            reason: e.to_string(),
        }
    })?;
    config.validate()?;
    Ok(config)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn coerce(spec: &PropertySpec, value: &Value) -> Result<Value, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidProperty {
        name: spec.name.to_string(),
        reason,
    };

    match (spec.kind, value) {
        (PropertyKind::Boolean, Value::Bool(_)) => Ok(value.clone()),
        (PropertyKind::Boolean, Value::String(s)) => s
            .trim()
            .parse::<bool>()
            .map(Value::Bool)
            .map_err(|_| invalid(format!("expected true or false, got {:?}", s))),
        (PropertyKind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        (PropertyKind::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid(format!("expected an integer, got {:?}", s))),
        (PropertyKind::Decimal, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (PropertyKind::Decimal, Value::String(s)) => s
            .trim()
            .parse::<rust_decimal::Decimal>()
            .map(|d| Value::String(d.to_string()))
            .map_err(|_| invalid(format!("expected a decimal, got {:?}", s))),
        (PropertyKind::Text, Value::String(_)) => Ok(value.clone()),
        (PropertyKind::Text, Value::Number(_) | Value::Bool(_)) => {
            Ok(Value::String(value.to_string()))
        }
        (PropertyKind::Json, Value::String(s)) => {
            serde_json::from_str(s).map_err(|e| invalid(format!("invalid JSON: {}", e)))
        }
        (PropertyKind::Json, _) => Ok(value.clone()),
        (kind, other) => Err(invalid(format!("{:?} cannot hold {}", kind, other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[derive(Debug, Deserialize)]
    struct SampleConfig {
        market: String,
        balance: Decimal,
        testnet: bool,
        #[serde(default)]
        retries: Option<i64>,
        #[serde(default)]
        symbols: Option<Vec<String>>,
    }

    impl ProviderConfig for SampleConfig {
        const PROPERTIES: &'static [PropertySpec] = &[
            PropertySpec {
                name: "market",
                display_name: "Market",
                kind: PropertyKind::Text,
                required: true,
                encrypted: false,
                default: None,
            },
            PropertySpec {
                name: "balance",
                display_name: "Balance",
                kind: PropertyKind::Decimal,
                required: false,
                encrypted: false,
                default: Some("1000"),
            },
            PropertySpec {
                name: "testnet",
                display_name: "Use testnet",
                kind: PropertyKind::Boolean,
                required: false,
                encrypted: false,
                default: Some("false"),
            },
            PropertySpec {
                name: "retries",
                display_name: "Retries",
                kind: PropertyKind::Integer,
                required: false,
                encrypted: false,
                default: None,
            },
            PropertySpec {
                name: "symbols",
                display_name: "Symbols",
                kind: PropertyKind::Json,
                required: false,
                encrypted: false,
                default: None,
            },
        ];

        fn validate(&self) -> Result<(), ConfigError> {
            if self.balance.is_sign_negative() {
                return Err(ConfigError::InvalidProperty {
                    name: "balance".to_string(),
                    reason: "must not be negative".to_string(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_decode_with_coercion_and_defaults() {
        let raw = r#"[
            {"property": "Market", "value": "binance-usd-futures"},
            {"property": "testnet", "value": "true"},
            {"property": "retries", "value": "3"},
            {"property": "symbols", "value": "[\"BTCUSDT\"]"},
            {"property": "unknown", "value": 1}
        ]"#;

        let config: SampleConfig = decode_config(raw).unwrap();
        assert_eq!(config.market, "binance-usd-futures");
        assert_eq!(config.balance, dec!(1000));
        assert!(config.testnet);
        assert_eq!(config.retries, Some(3));
        assert_eq!(config.symbols, Some(vec!["BTCUSDT".to_string()]));
    }

    #[test]
    fn test_pascal_case_entries_are_accepted() {
        let raw = r#"[{"Property": "market", "Value": "spot"}, {"Property": "balance", "Value": 12.5}]"#;
        let config: SampleConfig = decode_config(raw).unwrap();
        assert_eq!(config.market, "spot");
        assert_eq!(config.balance, dec!(12.5));
    }

    #[test]
    fn test_empty_bag_is_rejected() {
        assert_eq!(
            decode_config::<SampleConfig>("[]").unwrap_err(),
            ConfigError::NoProperties
        );
        assert_eq!(
            decode_config::<SampleConfig>("").unwrap_err(),
            ConfigError::NoProperties
        );
    }

    #[test]
    fn test_missing_required_property() {
        let raw = r#"[{"property": "balance", "value": "5"}]"#;
        assert_eq!(
            decode_config::<SampleConfig>(raw).unwrap_err(),
            ConfigError::MissingProperty("market".to_string())
        );
    }

    #[test]
    fn test_invalid_values() {
        let raw = r#"[{"property": "market", "value": "x"}, {"property": "testnet", "value": "maybe"}]"#;
        assert!(matches!(
            decode_config::<SampleConfig>(raw).unwrap_err(),
            ConfigError::InvalidProperty { name, .. } if name == "testnet"
        ));

        let raw = r#"[{"property": "market", "value": "x"}, {"property": "balance", "value": "-1"}]"#;
        assert!(matches!(
            decode_config::<SampleConfig>(raw).unwrap_err(),
            ConfigError::InvalidProperty { name, .. } if name == "balance"
        ));

        assert!(matches!(
            decode_config::<SampleConfig>("{not json").unwrap_err(),
            ConfigError::Malformed(_)
        ));
    }
}
