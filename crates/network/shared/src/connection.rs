//! Connection identity merged from both traffic directions.
//!
//! A proxy session keeps one [`ConnectionInfo`] per channel (primary and
//! aux). Messages that carry identity fields contribute an
//! [`IdentityUpdate`]; each update is merged into whatever was known before,
//! so partial information from either direction accumulates into one record.

use serde::{Deserialize, Serialize};

/// Merged identity/metadata for one channel of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Stable client identity (login name), carried across backend swaps.
    pub identifier: String,
    /// Entity id minted by the peer on this channel, if one is known yet.
    pub entity_id: Option<u32>,
}

/// Partial identity fields carried by a single message.
///
/// Fields left as `None` keep whatever the previous merge produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityUpdate {
    pub identifier: Option<String>,
    pub entity_id: Option<u32>,
}

impl IdentityUpdate {
    pub fn identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            entity_id: None,
        }
    }

    pub fn with_entity_id(mut self, entity_id: u32) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Merges this update over the previously known info.
    ///
    /// An update with no identifier and no previous info produces a record
    /// with an empty identifier; callers that care should send identity
    /// first, which is what the handshake protocols do.
    pub fn merge(&self, previous: Option<&ConnectionInfo>) -> ConnectionInfo {
        ConnectionInfo {
            identifier: self
                .identifier
                .clone()
                .or_else(|| previous.map(|info| info.identifier.clone()))
                .unwrap_or_default(),
            entity_id: self.entity_id.or(previous.and_then(|info| info.entity_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_from_nothing() {
        let update = IdentityUpdate::identifier("elaria").with_entity_id(7);
        let info = update.merge(None);
        assert_eq!(info.identifier, "elaria");
        assert_eq!(info.entity_id, Some(7));
    }

    #[test]
    fn merge_keeps_previous_fields() {
        let first = IdentityUpdate::identifier("elaria").merge(None);
        let second = IdentityUpdate::default().with_entity_id(42).merge(Some(&first));
        assert_eq!(second.identifier, "elaria");
        assert_eq!(second.entity_id, Some(42));
    }

    #[test]
    fn merge_overwrites_with_newer_fields() {
        let first = IdentityUpdate::identifier("elaria").with_entity_id(1).merge(None);
        let second = IdentityUpdate::default().with_entity_id(2).merge(Some(&first));
        assert_eq!(second.entity_id, Some(2));
        assert_eq!(second.identifier, "elaria");
    }
}
