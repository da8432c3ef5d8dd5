//! Schema Registry & Validator: compiles JSON Schema documents once and
//! validates envelope payloads against them, caching results by
//! `(schema, sha256(payload))`.

use domain::envelope::Envelope;
use domain::error::DomainError;
use domain::validation::ValidationResult;
use jsonschema::JSONSchema;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Schemas embedded at compile time, one per RTK message family.
const BUILTIN_SCHEMAS: &[(&str, &str)] = &[
    ("state@1.0", include_str!("../schemas/state.v1.json")),
    ("event@1.0", include_str!("../schemas/event.v1.json")),
    ("cmd.req@1.0", include_str!("../schemas/cmd_req.v1.json")),
    ("cmd.ack@1.0", include_str!("../schemas/cmd_ack.v1.json")),
    ("cmd.res@1.0", include_str!("../schemas/cmd_res.v1.json")),
    ("lwt@1.0", include_str!("../schemas/lwt.v1.json")),
    ("attr@1.0", include_str!("../schemas/attr.v1.json")),
    (
        "topology.discovery@1.0",
        include_str!("../schemas/topology_discovery.v1.json"),
    ),
    (
        "topology.connections@1.0",
        include_str!("../schemas/topology_connections.v1.json"),
    ),
    (
        "telemetry.wifi_clients@1.0",
        include_str!("../schemas/wifi_clients.v1.json"),
    ),
];

pub struct SchemaRegistry {
    compiled: HashMap<String, JSONSchema>,
    cache: Mutex<LruCache<(String, [u8; 32]), bool>>,
    strict: bool,
}

impl SchemaRegistry {
    /// Loads the built-in schema set plus any `.json` files found under
    /// `extra_dir`, each compiled once with `jsonschema::JSONSchema::compile`.
    pub fn load(extra_dir: Option<&str>, cache_size: usize, strict: bool) -> Result<Self, DomainError> {
        let mut compiled = HashMap::new();

        for (key, raw) in BUILTIN_SCHEMAS {
            let value: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| DomainError::Storage(format!("builtin schema {key}: {e}")))?;
            let schema = JSONSchema::options()
                .compile(&value)
                .map_err(|e| DomainError::Storage(format!("builtin schema {key}: {e}")))?;
            compiled.insert((*key).to_string(), schema);
        }

        if let Some(dir) = extra_dir {
            let entries = std::fs::read_dir(dir)
                .map_err(|e| DomainError::Storage(format!("reading schema dir {dir}: {e}")))?;
            for entry in entries {
                let entry = entry.map_err(|e| DomainError::Storage(e.to_string()))?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .ok_or_else(|| DomainError::Storage(format!("bad schema filename {path:?}")))?
                    .to_string();
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| DomainError::Storage(format!("reading {path:?}: {e}")))?;
                let value: serde_json::Value = serde_json::from_str(&raw)
                    .map_err(|e| DomainError::Storage(format!("parsing {path:?}: {e}")))?;
                let schema = JSONSchema::options()
                    .compile(&value)
                    .map_err(|e| DomainError::Storage(format!("compiling {path:?}: {e}")))?;
                compiled.insert(key, schema);
            }
        }

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Ok(SchemaRegistry {
            compiled,
            cache: Mutex::new(LruCache::new(cache_size)),
            strict,
        })
    }

    /// Validates the raw payload against the schema named by the envelope's
    /// `schema` field. Unknown schemas are rejected in `strict` mode and
    /// accepted (with a `schema_matched: None` result) otherwise.
    pub fn validate(&self, topic: &str, payload: &[u8]) -> ValidationResult {
        let envelope = match Envelope::parse(payload) {
            Ok(e) => e,
            Err(e) => return ValidationResult::unknown_schema(vec![e.to_string()]),
        };

        let schema_ref = match envelope.schema_ref() {
            Ok(s) => s,
            Err(e) => return ValidationResult::unknown_schema(vec![e.to_string()]),
        };
        let registry_key = schema_ref.registry_key();

        let digest: [u8; 32] = Sha256::digest(payload).into();
        if let Some(&valid) = self
            .cache
            .lock()
            .unwrap()
            .get(&(registry_key.clone(), digest))
        {
            return if valid {
                ValidationResult::ok(registry_key)
            } else {
                ValidationResult::invalid(Some(registry_key), vec!["cached failure".to_string()])
            };
        }

        let Some(schema) = self.compiled.get(&registry_key) else {
            return if self.strict {
                let errors = vec![format!("no schema registered for {registry_key} (topic {topic})")];
                ValidationResult::invalid(None, errors)
            } else {
                // Lenient mode: an unresolvable schema still passes, tagged
                // `unknown`, so the kind handler fires rather than the
                // message being silently dropped.
                ValidationResult::ok("unknown")
            };
        };

        let result = match schema.validate(&envelope.body) {
            Ok(()) => ValidationResult::ok(registry_key.clone()),
            Err(errs) => {
                let messages = errs.map(|e| e.to_string()).collect();
                ValidationResult::invalid(Some(registry_key.clone()), messages)
            }
        };

        self.cache
            .lock()
            .unwrap()
            .put((registry_key, digest), result.valid);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::load(None, 64, false).unwrap()
    }

    #[test]
    fn validates_well_formed_state_message() {
        let payload = br#"{"schema":"state/1.0","ts":1700000000000,"online":true}"#;
        let result = registry().validate("rtk/v1/acme/a/dev-1/state", payload);
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.schema_matched.as_deref(), Some("state@1.0"));
    }

    #[test]
    fn rejects_payload_missing_required_field() {
        let payload = br#"{"schema":"state/1.0","ts":1700000000000}"#;
        let result = registry().validate("rtk/v1/acme/a/dev-1/state", payload);
        assert!(!result.valid);
    }

    #[test]
    fn unknown_schema_is_lenient_by_default() {
        let payload = br#"{"schema":"custom.thing/1.0","ts":1,"x":1}"#;
        let result = registry().validate("rtk/v1/acme/a/dev-1/custom", payload);
        assert!(result.valid, "lenient mode passes unresolvable schemas through tagged unknown");
        assert_eq!(result.schema_matched.as_deref(), Some("unknown"));
    }

    #[test]
    fn strict_mode_rejects_unknown_schema_too() {
        let strict = SchemaRegistry::load(None, 64, true).unwrap();
        let payload = br#"{"schema":"custom.thing/1.0","ts":1,"x":1}"#;
        let result = strict.validate("rtk/v1/acme/a/dev-1/custom", payload);
        assert!(!result.valid);
    }

    #[test]
    fn second_identical_payload_hits_cache() {
        let r = registry();
        let payload = br#"{"schema":"state/1.0","ts":1700000000000,"online":true}"#;
        let first = r.validate("t", payload);
        let second = r.validate("t", payload);
        assert_eq!(first, second);
    }
}
