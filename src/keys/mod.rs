/// Server Key Resolution System
///
/// Resolves and caches the verification keys that remote servers sign
/// federation traffic with. Lookups go through a waterfall of tiers:
/// local cache, persistent key database, then an ordered list of fetchers.

pub mod api;
pub mod cache;
pub mod client;
pub mod fetchers;
pub mod ring;
pub mod routes;
pub mod sqlite;
pub mod store;
#[cfg(test)]
pub(crate) mod testutil;

pub use api::{ServerKeyApi, ServerKeyInternalApi};
pub use cache::ServerKeyCache;
pub use client::HttpServerKeyClient;
pub use fetchers::{DirectKeyFetcher, PerspectiveKeyFetcher};
pub use ring::KeyRing;
pub use sqlite::SqliteKeyDatabase;
pub use store::{KeyDatabase, KeyFetcher};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Separator between server name and key ID in the text form of a [`KeyIdentifier`]
const IDENTIFIER_SEPARATOR: char = '\u{1f}';

/// Milliseconds since the UNIX epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self::from_millis(chrono::Utc::now().timestamp_millis())
    }

    /// Build from signed milliseconds, clamping anything before the epoch to zero
    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis.max(0) as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (server name, key ID) pair naming one verification key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyIdentifier {
    pub server_name: String,
    pub key_id: String,
}

impl KeyIdentifier {
    pub fn new(server_name: impl Into<String>, key_id: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            key_id: key_id.into(),
        }
    }
}

impl fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_name, self.key_id)
    }
}

// Identifiers are map keys in every batch, so they travel as a single string.
impl Serialize for KeyIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!(
            "{}{}{}",
            self.server_name, IDENTIFIER_SEPARATOR, self.key_id
        ))
    }
}

impl<'de> Deserialize<'de> for KeyIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let (server_name, key_id) = text
            .split_once(IDENTIFIER_SEPARATOR)
            .ok_or_else(|| de::Error::custom(format!("invalid key identifier: {:?}", text)))?;

        if server_name.is_empty() || key_id.is_empty() {
            return Err(de::Error::custom(format!("invalid key identifier: {:?}", text)));
        }

        Ok(KeyIdentifier::new(server_name, key_id))
    }
}

/// Raw public key bytes, unpadded base64 on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyKey(pub Vec<u8>);

impl VerifyKey {
    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        // Some servers pad their keys anyway
        STANDARD_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map(VerifyKey)
    }

    pub fn to_base64(&self) -> String {
        STANDARD_NO_PAD.encode(&self.0)
    }
}

impl Serialize for VerifyKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for VerifyKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        VerifyKey::from_base64(&encoded).map_err(de::Error::custom)
    }
}

/// A resolved verification key and its validity window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLookupResult {
    pub verify_key: VerifyKey,
    /// After this instant the key is no longer authoritative
    pub valid_until_ts: Timestamp,
    /// Set when the key was explicitly revoked or superseded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_ts: Option<Timestamp>,
}

impl KeyLookupResult {
    /// Whether a cached or stored copy of this result may be served at `now`.
    ///
    /// An explicit expiry is a definitive answer and stays valid forever.
    /// Without one, the result is only usable up to `valid_until_ts`.
    pub fn is_usable_at(&self, now: Timestamp) -> bool {
        self.expired_ts.is_some() || now <= self.valid_until_ts
    }
}

/// Batch of lookups: identifier to the earliest instant the key must be valid at
pub type LookupRequests = HashMap<KeyIdentifier, Timestamp>;

/// Batch of resolved keys
pub type LookupResults = HashMap<KeyIdentifier, KeyLookupResult>;
