//! Client, group and peer identifiers.
//!
//! All three are 16-byte UUIDs. The binary form is the raw UUID bytes and the
//! textual form is the hyphenated UUID, so `from_bytes(to_bytes(id)) == id` and
//! `id.to_string().parse() == Ok(id)`.

use crate::error::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// The all-zero id.
            pub const NIL: Self = Self(Uuid::nil());

            /// Length of the binary encoding.
            pub const BYTE_LEN: usize = 16;

            /// Generate a fresh random (v4) id.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Decode from the 16-byte binary form.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                let raw: [u8; 16] = bytes.try_into().map_err(|_| RaftError::InvalidRequest {
                    reason: format!(
                        "{} must be {} bytes, got {}",
                        $label,
                        Self::BYTE_LEN,
                        bytes.len()
                    ),
                })?;
                Ok(Self(Uuid::from_bytes(raw)))
            }

            pub fn to_bytes(&self) -> [u8; 16] {
                *self.0.as_bytes()
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = RaftError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| RaftError::InvalidRequest {
                        reason: format!("invalid {} {:?}: {}", $label, s, e),
                    })
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Identifies the client that issued a request.
    ClientId,
    "client id"
);

uuid_id!(
    /// Identifies a Raft group (one replicated log).
    GroupId,
    "group id"
);

uuid_id!(
    /// Identifies a server within a Raft group.
    PeerId,
    "peer id"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_round_trip() {
        for _ in 0..16 {
            let client = ClientId::random();
            assert_eq!(ClientId::from_bytes(&client.to_bytes()).unwrap(), client);

            let group = GroupId::random();
            assert_eq!(GroupId::from_bytes(&group.to_bytes()).unwrap(), group);

            let peer = PeerId::random();
            assert_eq!(PeerId::from_bytes(&peer.to_bytes()).unwrap(), peer);
        }
    }

    #[test]
    fn test_string_round_trip() {
        let peer = PeerId::random();
        let text = peer.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.parse::<PeerId>().unwrap(), peer);
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            GroupId::from_bytes(&[0u8; 15]),
            Err(RaftError::InvalidRequest { .. })
        ));
        assert!("not-a-uuid".parse::<ClientId>().is_err());
    }

    #[test]
    fn test_nil() {
        assert!(PeerId::NIL.is_nil());
        assert_eq!(PeerId::NIL.to_bytes(), [0u8; 16]);
        assert!(!PeerId::random().is_nil());
    }
}
