//! The composite `<target>@<routing-key>` identity.

use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;

/// Where an inbound session should be relayed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteIdentity {
    /// Backend target (device) name.
    pub target: String,

    /// Broker-scoped routing key, for example a service serial.
    pub routing_key: String,
}

impl RouteIdentity {
    /// Build an identity from its parts.
    pub fn new(target: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Parse a presented username.
    ///
    /// The routing key is everything after the last `@`, so targets may
    /// themselves contain `@`. Both parts must be non-empty and free of
    /// whitespace and control characters.
    pub fn parse(identity: &str) -> Result<Self, RelayError> {
        let invalid = || RelayError::InvalidIdentity {
            identity: identity.to_string(),
        };

        let (target, routing_key) = identity.rsplit_once('@').ok_or_else(invalid)?;
        let well_formed =
            |part: &str| !part.is_empty() && !part.chars().any(|c| c.is_whitespace() || c.is_control());
        if !well_formed(target) || !well_formed(routing_key) {
            return Err(invalid());
        }

        Ok(Self::new(target, routing_key))
    }
}

impl FromStr for RouteIdentity {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RouteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.target, self.routing_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity() {
        let identity = RouteIdentity::parse("devA@svc123").unwrap();
        assert_eq!(identity, RouteIdentity::new("devA", "svc123"));
        assert_eq!(identity.to_string(), "devA@svc123");
    }

    #[test]
    fn test_target_may_contain_delimiter() {
        let identity: RouteIdentity = "admin@devA@svc123".parse().unwrap();
        assert_eq!(identity.target, "admin@devA");
        assert_eq!(identity.routing_key, "svc123");
    }

    #[test]
    fn test_rejects_malformed_identities() {
        for bad in ["devA", "", "@svc123", "devA@", "@", "dev A@svc", "devA@svc\r"] {
            assert!(
                matches!(
                    RouteIdentity::parse(bad),
                    Err(RelayError::InvalidIdentity { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }
}
