//! Logger settings.

use crate::context::{FieldNames, LoggedField};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Error raised while loading settings or endpoint declarations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown logged field '{0}'")]
    UnknownField(String),
}

/// Settings of the request logger.
///
/// # Examples
///
/// ```rust
/// use logged_http::{LoggedField, RequestLoggerConfig};
///
/// let config = RequestLoggerConfig::from_toml_str(
///     r#"
///     request_id_header = "x-case-id"
///     extra_fields = ["user-id"]
///
///     [field_names]
///     request-id = "request-identifier"
///     "#,
/// )
/// .unwrap();
///
/// assert_eq!(config.request_id_header, "x-case-id");
/// let names = config.field_names().unwrap();
/// assert_eq!(names.slot(LoggedField::RequestId), "request-identifier");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestLoggerConfig {
    /// Header carrying the caller's request id
    pub request_id_header: String,
    /// Slot name overrides, keyed by default slot name
    pub field_names: BTreeMap<String, String>,
    /// Slots written by enrichers, cleared with the others
    pub extra_fields: Vec<String>,
}

impl Default for RequestLoggerConfig {
    fn default() -> Self {
        Self {
            request_id_header: "x-request-id".to_string(),
            field_names: BTreeMap::new(),
            extra_fields: Vec::new(),
        }
    }
}

impl RequestLoggerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// The slot names resulting from the overrides.
    pub fn field_names(&self) -> Result<FieldNames, ConfigError> {
        let mut names = FieldNames::default();
        for (name, slot) in &self.field_names {
            let field = LoggedField::from_name(name)
                .ok_or_else(|| ConfigError::UnknownField(name.clone()))?;
            names = names.rename(field, slot.clone());
        }
        Ok(self
            .extra_fields
            .iter()
            .fold(names, |names, slot| names.with_extra(slot.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RequestLoggerConfig::from_toml_str("").unwrap();
        assert_eq!(config, RequestLoggerConfig::default());
        assert_eq!(config.request_id_header, "x-request-id");
        assert_eq!(config.field_names().unwrap(), FieldNames::default());
    }

    #[test]
    fn test_extra_fields_are_known_slots() {
        let config = RequestLoggerConfig::from_toml_str(r#"extra_fields = ["user-id", "user-agent"]"#).unwrap();
        let names = config.field_names().unwrap();

        let slots: Vec<&str> = names.all_slots().collect();
        assert!(slots.contains(&"user-id"));
        assert!(slots.contains(&"user-agent"));
    }

    #[test]
    fn test_unknown_field_name_is_rejected() {
        let config = RequestLoggerConfig::from_toml_str("[field_names]\nrequest-colour = \"x\"").unwrap();
        assert!(matches!(config.field_names(), Err(ConfigError::UnknownField(name)) if name == "request-colour"));

        assert!(matches!(
            RequestLoggerConfig::from_toml_str("request_id_header = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
