//! Device-reported events (kind `event`), classified by severity.

use crate::device::DeviceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Classifies a reported event by its declared `severity` field,
    /// defaulting to `Info` when absent or unrecognized rather than
    /// rejecting the event outright.
    pub fn classify(raw: Option<&str>) -> Self {
        match raw {
            Some("critical") => Severity::Critical,
            Some("error") => Severity::Error,
            Some("warning") | Some("warn") => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub device: DeviceId,
    pub severity: Severity,
    pub name: String,
    pub ts: i64,
    pub body: Value,
}
