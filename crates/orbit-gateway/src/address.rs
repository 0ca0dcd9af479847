//! Network addresses and their kinds.

use std::fmt;

use orbit_gateway_protocol::ContactKind;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Server part used for individual accounts.
pub const INDIVIDUAL_SERVER: &str = "s.whatsapp.net";

/// Classification of an address by its server part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Individual,
    Group,
    Linked,
    /// Status updates and broadcast lists.
    Broadcast,
    Newsletter,
    Other,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("invalid address {0:?}")]
    Invalid(String),
}

/// A stable identifier on the messaging network (`user@server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Parse an address.
    ///
    /// A bare phone number (no `@`) is taken to be an individual account;
    /// `+`, spaces and dashes are stripped from it.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }

        match raw.split_once('@') {
            Some((user, server)) => {
                if user.is_empty() || server.is_empty() || server.contains('@') {
                    return Err(AddressError::Invalid(raw.to_string()));
                }
                if raw.chars().any(char::is_whitespace) {
                    return Err(AddressError::Invalid(raw.to_string()));
                }
                Ok(Self(raw.to_string()))
            }
            None => {
                let digits: String = raw
                    .chars()
                    .filter(|c| !matches!(c, '+' | ' ' | '-'))
                    .collect();
                if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                    return Err(AddressError::Invalid(raw.to_string()));
                }
                Ok(Self(format!("{}@{}", digits, INDIVIDUAL_SERVER)))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before `@`.
    pub fn user(&self) -> &str {
        self.0.split_once('@').map(|(u, _)| u).unwrap_or(&self.0)
    }

    /// The part after `@`.
    pub fn server(&self) -> &str {
        self.0.split_once('@').map(|(_, s)| s).unwrap_or("")
    }

    pub fn kind(&self) -> AddressKind {
        match self.server() {
            "s.whatsapp.net" | "c.us" => AddressKind::Individual,
            "g.us" => AddressKind::Group,
            "lid" => AddressKind::Linked,
            "broadcast" => AddressKind::Broadcast,
            "newsletter" => AddressKind::Newsletter,
            _ => AddressKind::Other,
        }
    }

    /// Broadcast, status and newsletter addresses never name a person.
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self.kind(),
            AddressKind::Broadcast | AddressKind::Newsletter | AddressKind::Other
        )
    }

    pub fn is_group(&self) -> bool {
        self.kind() == AddressKind::Group
    }

    /// The contact kind exposed to the orchestrator, if this address is
    /// exposed at all. Only individual and linked identities are.
    pub fn exposed_kind(&self) -> Option<ContactKind> {
        match self.kind() {
            AddressKind::Individual => Some(ContactKind::Individual),
            AddressKind::Linked => Some(ContactKind::Linked),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Address::parse(&raw).map_err(serde::de::Error::custom)
    }
}
