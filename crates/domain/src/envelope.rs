//! The RTK JSON envelope: every payload published on an `rtk/v1/...` topic
//! carries a `schema` tag and a `ts` timestamp alongside its body.

use crate::error::DomainError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `name[.dots]/MAJOR.MINOR`, e.g. `telemetry.cpu/1.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRef {
    pub name: String,
    pub major: u32,
    pub minor: u32,
}

impl SchemaRef {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let (name, version) = raw
            .rsplit_once('/')
            .ok_or_else(|| DomainError::InvalidSchemaName(raw.to_string()))?;
        let (major_str, minor_str) = version
            .split_once('.')
            .ok_or_else(|| DomainError::InvalidSchemaName(raw.to_string()))?;
        let major: u32 = major_str
            .parse()
            .map_err(|_| DomainError::InvalidSchemaName(raw.to_string()))?;
        let minor: u32 = minor_str
            .parse()
            .map_err(|_| DomainError::InvalidSchemaName(raw.to_string()))?;
        if name.is_empty() {
            return Err(DomainError::InvalidSchemaName(raw.to_string()));
        }
        Ok(SchemaRef {
            name: name.to_string(),
            major,
            minor,
        })
    }

    /// Registry lookup key: schemas are matched by name and major version
    /// only (minor is assumed backwards compatible within a major line).
    pub fn registry_key(&self) -> String {
        format!("{}@{}.{}", self.name, self.major, self.minor)
    }

    pub fn compat_key(&self) -> String {
        format!("{}@{}", self.name, self.major)
    }
}

impl std::fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}.{}", self.name, self.major, self.minor)
    }
}

/// A decoded RTK envelope: `schema`, `ts`, plus the arbitrary body fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub schema: String,
    pub ts: i64,
    #[serde(flatten)]
    pub body: Value,
}

impl Envelope {
    /// Parses the raw MQTT payload bytes, checking only that `schema` and
    /// `ts` are present and well-typed. Full schema conformance is the
    /// Schema Validator's job, not the envelope's.
    pub fn parse(payload: &[u8]) -> Result<Self, DomainError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| DomainError::InvalidField {
                field: "payload",
                reason: e.to_string(),
            })?;

        let schema = value
            .get("schema")
            .and_then(Value::as_str)
            .ok_or(DomainError::MissingField("schema"))?
            .to_string();

        let ts = value
            .get("ts")
            .and_then(Value::as_i64)
            .ok_or(DomainError::MissingField("ts"))?;

        Ok(Envelope {
            schema,
            ts,
            body: value,
        })
    }

    pub fn schema_ref(&self) -> Result<SchemaRef, DomainError> {
        SchemaRef::parse(&self.schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schema_ref() {
        let s = SchemaRef::parse("telemetry.cpu/1.0").unwrap();
        assert_eq!(s.name, "telemetry.cpu");
        assert_eq!(s.major, 1);
        assert_eq!(s.minor, 0);
        assert_eq!(s.registry_key(), "telemetry.cpu@1.0");
    }

    #[test]
    fn rejects_malformed_schema_ref() {
        assert!(SchemaRef::parse("telemetry.cpu").is_err());
        assert!(SchemaRef::parse("telemetry.cpu/1").is_err());
        assert!(SchemaRef::parse("/1.0").is_err());
    }

    #[test]
    fn parses_envelope_with_required_fields() {
        let payload = br#"{"schema":"state/1.0","ts":1700000000000,"online":true}"#;
        let env = Envelope::parse(payload).unwrap();
        assert_eq!(env.schema, "state/1.0");
        assert_eq!(env.ts, 1700000000000);
        assert_eq!(env.body["online"], serde_json::json!(true));
    }

    #[test]
    fn rejects_envelope_missing_schema() {
        let payload = br#"{"ts":1700000000000}"#;
        assert!(Envelope::parse(payload).is_err());
    }

    #[test]
    fn rejects_envelope_missing_ts() {
        let payload = br#"{"schema":"state/1.0"}"#;
        assert!(Envelope::parse(payload).is_err());
    }
}
