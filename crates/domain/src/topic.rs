//! RTK topic grammar: `rtk/v1/{tenant}/{site}/{device}/{kind}[/{sub}]`.
//!
//! Parsing and wildcard matching are pure, allocation-conscious operations
//! with no dependency on the broker client that carries these topics.

use crate::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const RTK_PREFIX: &str = "rtk";
pub const RTK_VERSION: &str = "v1";

/// A parsed RTK topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub tenant: String,
    pub site: String,
    pub device: String,
    pub kind: String,
    pub sub: Option<String>,
}

impl Topic {
    /// Parses `rtk/v1/{tenant}/{site}/{device}/{kind}[/{sub}]`.
    ///
    /// Single pass over `/`-delimited segments; rejects empty segments and
    /// the wrong prefix/version rather than silently defaulting.
    pub fn parse(topic: &str) -> Result<Self, DomainError> {
        if topic.ends_with('/') {
            return Err(DomainError::InvalidTopic(topic.to_string()));
        }

        let mut segments = topic.split('/');

        let prefix = segments.next().unwrap_or_default();
        let version = segments.next().unwrap_or_default();
        if prefix != RTK_PREFIX || version != RTK_VERSION {
            return Err(DomainError::InvalidTopic(topic.to_string()));
        }

        let tenant = segments.next().unwrap_or_default();
        let site = segments.next().unwrap_or_default();
        let device = segments.next().unwrap_or_default();
        let kind = segments.next().unwrap_or_default();
        if kind.is_empty() || !is_valid_identity_segment(tenant) || !is_valid_identity_segment(site) || !is_valid_identity_segment(device) {
            return Err(DomainError::InvalidTopic(topic.to_string()));
        }

        let sub = segments.next().filter(|s| !s.is_empty()).map(str::to_string);
        if segments.next().is_some() {
            // trailing extra segment beyond {sub}
            return Err(DomainError::InvalidTopic(topic.to_string()));
        }

        Ok(Topic {
            tenant: tenant.to_string(),
            site: site.to_string(),
            device: device.to_string(),
            kind: kind.to_string(),
            sub,
        })
    }

    /// Builds the canonical wire-form topic string.
    pub fn build(&self) -> String {
        match &self.sub {
            Some(sub) => format!(
                "{RTK_PREFIX}/{RTK_VERSION}/{}/{}/{}/{}/{sub}",
                self.tenant, self.site, self.device, self.kind
            ),
            None => format!(
                "{RTK_PREFIX}/{RTK_VERSION}/{}/{}/{}/{}",
                self.tenant, self.site, self.device, self.kind
            ),
        }
    }

    /// The device identity this topic refers to, as `tenant:site:device`.
    pub fn device_key(&self) -> String {
        format!("{}:{}:{}", self.tenant, self.site, self.device)
    }
}

/// `tenant`/`site`/`device` are 1-64 bytes of `[a-z0-9_.-]`.
fn is_valid_identity_segment(s: &str) -> bool {
    (1..=64).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-'))
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build())
    }
}

/// Checks whether `filter` (an MQTT 3.1.1 topic filter, possibly containing
/// `+`/`#` wildcards) matches a concrete `topic`.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');

    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(fs), Some(ts)) if fs == ts => continue,
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            (Some("#"), None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_topic() {
        let t = Topic::parse("rtk/v1/acme/site-a/dev-1/state").unwrap();
        assert_eq!(t.tenant, "acme");
        assert_eq!(t.site, "site-a");
        assert_eq!(t.device, "dev-1");
        assert_eq!(t.kind, "state");
        assert_eq!(t.sub, None);
    }

    #[test]
    fn parses_topic_with_sub() {
        let t = Topic::parse("rtk/v1/acme/site-a/dev-1/cmd/req").unwrap();
        assert_eq!(t.kind, "cmd");
        assert_eq!(t.sub.as_deref(), Some("req"));
    }

    #[test]
    fn round_trips_through_build() {
        let original = "rtk/v1/acme/site-a/dev-1/cmd/ack";
        let t = Topic::parse(original).unwrap();
        assert_eq!(t.build(), original);
    }

    #[test]
    fn rejects_wrong_prefix_or_version() {
        assert!(Topic::parse("scada/v1/acme/site-a/dev-1/state").is_err());
        assert!(Topic::parse("rtk/v2/acme/site-a/dev-1/state").is_err());
    }

    #[test]
    fn rejects_missing_segments() {
        assert!(Topic::parse("rtk/v1/acme/site-a").is_err());
        assert!(Topic::parse("rtk/v1/acme//dev-1/state").is_err());
    }

    #[test]
    fn rejects_trailing_extra_segment() {
        assert!(Topic::parse("rtk/v1/acme/site-a/dev-1/cmd/req/extra").is_err());
    }

    #[test]
    fn rejects_trailing_slash() {
        assert!(Topic::parse("rtk/v1/acme/site-a/dev-1/state/").is_err());
    }

    #[test]
    fn rejects_identity_segments_with_disallowed_characters_or_length() {
        assert!(Topic::parse("rtk/v1/ACME/site-a/dev-1/state").is_err());
        assert!(Topic::parse("rtk/v1/acme/site a/dev-1/state").is_err());
        let too_long = "a".repeat(65);
        assert!(Topic::parse(&format!("rtk/v1/{too_long}/site-a/dev-1/state")).is_err());
    }

    #[test]
    fn plus_wildcard_matches_single_segment() {
        assert!(matches("rtk/v1/acme/+/+/state", "rtk/v1/acme/site-a/dev-1/state"));
        assert!(!matches("rtk/v1/acme/+/state", "rtk/v1/acme/site-a/dev-1/state"));
    }

    #[test]
    fn hash_wildcard_matches_remaining_segments() {
        assert!(matches("rtk/v1/acme/#", "rtk/v1/acme/site-a/dev-1/state"));
        assert!(matches("rtk/v1/acme/#", "rtk/v1/acme"));
    }

    #[test]
    fn exact_literal_segments_must_match() {
        assert!(!matches(
            "rtk/v1/acme/site-a/dev-1/state",
            "rtk/v1/acme/site-b/dev-1/state"
        ));
    }
}
