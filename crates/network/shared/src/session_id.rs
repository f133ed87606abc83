//! Compact per-connection identifier.
//!
//! Eight bytes, hex rendered, minted without an RNG: a mix of wall-clock
//! nanos and a process-wide counter is unique enough for log correlation
//! and handshake bookkeeping, which is all this id is used for.

use core::{fmt, str::FromStr};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// 8-byte session identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        SessionId(now ^ counter.rotate_left(17))
    }

    pub const fn from_raw(raw: u64) -> Self {
        SessionId(raw)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    /// Parse from a hex string (strict length = 16 chars).
    pub fn from_hex(s: &str) -> Result<Self, SessionIdParseError> {
        if s.len() != 16 {
            return Err(SessionIdParseError::Length);
        }
        u64::from_str_radix(s, 16)
            .map(SessionId)
            .map_err(|_| SessionIdParseError::Hex)
    }

    /// Encode to lowercase hex (16 chars).
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({:016x})", self.0)
    }
}

impl FromStr for SessionId {
    type Err = SessionIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionId::from_hex(s)
    }
}

/// Parsing errors for the hex representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionIdParseError {
    #[error("invalid length (expected 16 hex chars)")]
    Length,
    #[error("invalid hex character")]
    Hex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let id = SessionId::new();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 16);
        assert_eq!(SessionId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn distinct_ids() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(
            SessionId::from_hex("abcd"),
            Err(SessionIdParseError::Length)
        ));
        assert!(matches!(
            SessionId::from_hex("zzzzzzzzzzzzzzzz"),
            Err(SessionIdParseError::Hex)
        ));
    }
}
