// src/address.rs
//
// Reply-to addressing: "<destination>/<routingKey>" publishes to the named
// exchange, a bare "<routingKey>" goes through the default exchange.

use std::fmt;
use thiserror::Error;

pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("empty reply-to")]
    Empty,

    #[error("malformed reply-to '{0}': expected <destination>/<routing key> or <routing key>")]
    Malformed(String),
}

/// Where a reply is published. An empty destination means the default exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    destination: String,
    routing_key: String,
}

impl ResolvedAddress {
    pub fn new(destination: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn uses_default_exchange(&self) -> bool {
        self.destination.is_empty()
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.uses_default_exchange() {
            write!(f, "(default)/{}", self.routing_key)
        } else {
            write!(f, "{}/{}", self.destination, self.routing_key)
        }
    }
}

/// Parse a reply-to header.
///
/// A separator must split the input into exactly two non-empty segments;
/// a leading, trailing or repeated separator is rejected as malformed.
pub fn resolve(reply_to: &str) -> Result<ResolvedAddress, AddressError> {
    if reply_to.is_empty() {
        return Err(AddressError::Empty);
    }

    if !reply_to.contains(SEPARATOR) {
        return Ok(ResolvedAddress::new("", reply_to));
    }

    let segments: Vec<&str> = reply_to.split(SEPARATOR).collect();
    match segments.as_slice() {
        [destination, routing_key] if !destination.is_empty() && !routing_key.is_empty() => {
            Ok(ResolvedAddress::new(*destination, *routing_key))
        }
        _ => Err(AddressError::Malformed(reply_to.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_reply_to_is_rejected() {
        assert_eq!(resolve(""), Err(AddressError::Empty));
    }

    #[test]
    fn test_destination_and_routing_key() {
        let address = resolve("a/b").unwrap();
        assert_eq!(address.destination(), "a");
        assert_eq!(address.routing_key(), "b");
        assert!(!address.uses_default_exchange());
    }

    #[test]
    fn test_too_many_segments_is_malformed() {
        assert_eq!(
            resolve("a/b/c"),
            Err(AddressError::Malformed("a/b/c".to_string()))
        );
        assert!(resolve("a//b").is_err());
    }

    #[test]
    fn test_plain_routing_key_uses_default_exchange() {
        let address = resolve("onlykey").unwrap();
        assert_eq!(address.destination(), "");
        assert_eq!(address.routing_key(), "onlykey");
        assert!(address.uses_default_exchange());
    }

    #[test]
    fn test_empty_segments_are_malformed() {
        assert_eq!(
            resolve("/onlyslash"),
            Err(AddressError::Malformed("/onlyslash".to_string()))
        );
        assert!(matches!(resolve("replies/"), Err(AddressError::Malformed(_))));
        assert!(matches!(resolve("/"), Err(AddressError::Malformed(_))));
    }

    #[test]
    fn test_routing_key_may_contain_topic_syntax() {
        let address = resolve("replies/fromfakedata.v1.#").unwrap();
        assert_eq!(address.destination(), "replies");
        assert_eq!(address.routing_key(), "fromfakedata.v1.#");
    }

    #[test]
    fn test_non_empty_success_never_has_empty_routing_key() {
        for input in ["x", "x/y", "amq.topic/key", "q.reply"] {
            let address = resolve(input).unwrap();
            assert!(!address.routing_key().is_empty(), "input {input}");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(resolve("replies/fromfakedata").unwrap().to_string(), "replies/fromfakedata");
        assert_eq!(resolve("callback").unwrap().to_string(), "(default)/callback");
    }
}
