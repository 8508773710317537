//! Cluster, credential and event identifiers.
//!
//! The string ids are transparent on the wire and in storage rows, so a
//! `ClusterId` written by the gateway reads back as the same text column.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Globally unique cluster identifier, shared by the registry and storage.
    ClusterId
);

string_newtype!(
    /// Opaque identifier of a stored (or environment-backed) cloud credential.
    CredentialId
);

/// Position of an event in the installer's event log. Strictly increasing.
pub type EventId = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_id_display_and_as_ref() {
        let id = ClusterId::new("stratus-abc123");
        assert_eq!(id.to_string(), "stratus-abc123");
        assert_eq!(id.as_str(), "stratus-abc123");
        assert_eq!(AsRef::<str>::as_ref(&id), "stratus-abc123");
    }

    #[test]
    fn cluster_id_serializes_as_plain_string() {
        let id = ClusterId::new("c1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"c1\"");
        let back: ClusterId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn credential_id_compares_with_str() {
        let id = CredentialId::from("aws_env");
        assert_eq!(id, "aws_env");
        assert_eq!(id, String::from("aws_env"));
    }

    #[test]
    fn map_lookup_by_str() {
        let mut map = std::collections::HashMap::new();
        map.insert(ClusterId::new("c1"), 1);
        assert_eq!(map.get("c1"), Some(&1));
    }

    #[test]
    fn credential_id_into_inner() {
        let id = CredentialId::new("key".to_owned());
        assert_eq!(id.into_inner(), "key");
    }
}
