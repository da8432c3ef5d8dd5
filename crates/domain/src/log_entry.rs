//! The persisted form of every accepted inbound MQTT message.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub ts: i64,
    pub schema_matched: Option<String>,
}

impl MessageLogEntry {
    /// Storage key: `mqtt_log:{ts_padded}:{id}`, zero-padded to 20 digits
    /// so lexicographic byte order matches chronological order under the
    /// Storage Engine's ordered iteration.
    pub fn key(ts: i64, id: &str) -> String {
        format!("mqtt_log:{ts:020}:{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_chronologically_as_bytes() {
        let k1 = MessageLogEntry::key(5, "a");
        let k2 = MessageLogEntry::key(10, "b");
        assert!(k1.as_bytes() < k2.as_bytes());
    }
}
