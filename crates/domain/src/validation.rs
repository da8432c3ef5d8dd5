use serde::{Deserialize, Serialize};

/// Outcome of validating a payload against the Schema Registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    /// The registry key of the schema the payload was checked against, if
    /// one was found for the envelope's declared `schema` field.
    pub schema_matched: Option<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok(schema_matched: impl Into<String>) -> Self {
        ValidationResult {
            valid: true,
            schema_matched: Some(schema_matched.into()),
            errors: Vec::new(),
        }
    }

    pub fn invalid(schema_matched: Option<String>, errors: Vec<String>) -> Self {
        ValidationResult {
            valid: false,
            schema_matched,
            errors,
        }
    }

    pub fn unknown_schema(errors: Vec<String>) -> Self {
        ValidationResult {
            valid: false,
            schema_matched: None,
            errors,
        }
    }
}
