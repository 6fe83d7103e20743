//! Exchange binding specifications.

use std::fmt;
use std::str::FromStr;

use crate::error::TapError;

/// An exchange to tap and the binding key to tap it with.
///
/// The key is a wildcard pattern for topic exchanges, a literal routing key
/// for direct exchanges and ignored by fanout and headers exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBinding {
    pub exchange: String,
    pub binding_key: String,
}

impl ExchangeBinding {
    pub fn new(exchange: impl Into<String>, binding_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            binding_key: binding_key.into(),
        }
    }
}

impl fmt::Display for ExchangeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.binding_key)
    }
}

impl FromStr for ExchangeBinding {
    type Err = TapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(exchange), Some(key), None) => Ok(Self::new(exchange, key)),
            _ => Err(TapError::InvalidBinding(s.to_string())),
        }
    }
}

/// Parse a comma separated list of `exchange:key` pairs, e.g.
/// `"amq.topic:#,orders:order.*"`.
pub fn parse_bindings(s: &str) -> Result<Vec<ExchangeBinding>, TapError> {
    s.split(',').map(str::parse).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_bindings() {
        let bindings = parse_bindings("exchange1:key1,exchange2:key2").unwrap();
        assert_eq!(
            bindings,
            vec![
                ExchangeBinding::new("exchange1", "key1"),
                ExchangeBinding::new("exchange2", "key2"),
            ]
        );
    }

    #[test]
    fn test_parse_missing_colon_fails() {
        let err = parse_bindings("exchange").unwrap_err();
        assert!(matches!(err, TapError::InvalidBinding(ref s) if s == "exchange"));
    }

    #[test]
    fn test_parse_rejects_extra_colon() {
        assert!(parse_bindings("a:b:c").is_err());
        assert!(parse_bindings("a:b,broken").is_err());
    }

    #[test]
    fn test_empty_key_is_allowed() {
        let bindings = parse_bindings("fanout-ex:").unwrap();
        assert_eq!(bindings[0].binding_key, "");
        assert_eq!(bindings[0].to_string(), "fanout-ex:");
    }
}
