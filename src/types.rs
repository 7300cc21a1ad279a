//! NewType wrappers and access-level ranks shared across the gateway.
//!
//! The newtypes keep request ids, service names and key ids from being mixed
//! up in stage signatures. The two access-level enums are deliberately separate
//! total orders: an API client's tier and a user's role tier are different axes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_string!(
    /// Opaque per-request identifier generated at pipeline entry.
    ///
    /// It is the only internal identifier ever returned to a caller in an
    /// error body.
    RequestId
);

newtype_string!(
    /// Logical name of the backend service a path resolves to
    /// (e.g., "orders", "weather").
    ///
    /// Passed as `serviceName` to every identity-service call.
    ServiceName
);

newtype_string!(
    /// Identifier the identity service assigns to an API key.
    ///
    /// Safe to log and forward, unlike the key itself.
    KeyId
);

impl RequestId {
    /// Generate a fresh random request id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Error returned when an access-level name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAccessLevel(pub String);

impl fmt::Display for UnknownAccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown access level: {}", self.0)
    }
}

impl std::error::Error for UnknownAccessLevel {}

/// Generates an ordered access-level enum. Variant order is the rank order.
macro_rules! access_level {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        pub enum $name {
            #[default]
            $($variant),+
        }

        impl $name {
            /// Canonical name, as used on the wire and in forwarding headers.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),+
                }
            }

            /// True if this level is at least `required`.
            pub fn satisfies(&self, required: Self) -> bool {
                required <= *self
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownAccessLevel;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().replace(['_', '-'], "");
                $(
                    if wanted.eq_ignore_ascii_case(stringify!($variant)) {
                        return Ok(Self::$variant);
                    }
                )+
                Err(UnknownAccessLevel(s.to_string()))
            }
        }
    };
}

// The `#[default]` attribute in the macro lands on the first variant only.
access_level!(
    /// Tier attached to an API key (client application).
    ApiAccessLevel { None, ReadOnly, Limited, Standard, Premium, Admin }
);

access_level!(
    /// Tier attached to an authenticated user or service principal.
    UserAccessLevel { None, Guest, User, PowerUser, Manager, Admin, SuperAdmin }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_access_level_order() {
        assert!(ApiAccessLevel::None < ApiAccessLevel::ReadOnly);
        assert!(ApiAccessLevel::ReadOnly < ApiAccessLevel::Limited);
        assert!(ApiAccessLevel::Limited < ApiAccessLevel::Standard);
        assert!(ApiAccessLevel::Standard < ApiAccessLevel::Premium);
        assert!(ApiAccessLevel::Premium < ApiAccessLevel::Admin);
        assert!(ApiAccessLevel::Admin.satisfies(ApiAccessLevel::Standard));
        assert!(!ApiAccessLevel::ReadOnly.satisfies(ApiAccessLevel::Standard));
        assert!(ApiAccessLevel::Standard.satisfies(ApiAccessLevel::Standard));
    }

    #[test]
    fn test_user_access_level_order() {
        assert!(UserAccessLevel::Guest < UserAccessLevel::User);
        assert!(UserAccessLevel::Manager < UserAccessLevel::Admin);
        assert!(UserAccessLevel::Admin < UserAccessLevel::SuperAdmin);
        assert_eq!(UserAccessLevel::default(), UserAccessLevel::None);
    }

    #[test]
    fn test_access_level_parse() {
        assert_eq!(
            "read_only".parse::<ApiAccessLevel>().unwrap(),
            ApiAccessLevel::ReadOnly
        );
        assert_eq!(
            "PowerUser".parse::<UserAccessLevel>().unwrap(),
            UserAccessLevel::PowerUser
        );
        assert_eq!(
            "super-admin".parse::<UserAccessLevel>().unwrap(),
            UserAccessLevel::SuperAdmin
        );
        assert!("Owner".parse::<ApiAccessLevel>().is_err());
    }

    #[test]
    fn test_access_level_serde() {
        let json = serde_json::to_string(&ApiAccessLevel::ReadOnly).unwrap();
        assert_eq!(json, "\"ReadOnly\"");
        let level: UserAccessLevel = serde_json::from_str("\"Manager\"").unwrap();
        assert_eq!(level, UserAccessLevel::Manager);
    }

    #[test]
    fn test_newtype_display() {
        let service = ServiceName::new("orders");
        assert_eq!(service.to_string(), "orders");
        assert_eq!(service.as_str(), "orders");
        assert_ne!(RequestId::generate(), RequestId::generate());
    }
}
