//! Common types used throughout scoresync.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from a string.
            ///
            /// # Errors
            /// - Returns error if id is empty or only whitespace
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(crate::Error::InvalidInput(concat!(
                        $label,
                        " cannot be empty"
                    )
                    .to_string()));
                }
                Ok(Self(id))
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
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

string_id!(
    /// Identity of one installation. Generated once and kept for as long as
    /// local storage survives.
    DeviceId,
    "DeviceId"
);

string_id!(
    /// Identifier of a queued offline action.
    ActionId,
    "ActionId"
);

string_id!(
    /// Identifier of a conflict record.
    ConflictId,
    "ConflictId"
);

/// A remote resource addressed by type and id, e.g. `scores/abc-123`.
///
/// Resource types map onto the authority's collection paths
/// (`/api/{type}` and `/api/{type}/{id}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceKey {
    /// Create a resource key.
    ///
    /// # Preconditions
    /// - Neither component may be empty
    /// - Neither component may contain `/`
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> crate::Result<Self> {
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();
        for (label, part) in [("resource type", &resource_type), ("resource id", &resource_id)] {
            if part.trim().is_empty() {
                return Err(crate::Error::InvalidInput(format!("{} cannot be empty", label)));
            }
            if part.contains('/') {
                return Err(crate::Error::InvalidInput(format!(
                    "{} cannot contain '/': {}",
                    label, part
                )));
            }
        }
        Ok(Self {
            resource_type,
            resource_id,
        })
    }

    /// Parse `type/id`.
    pub fn parse(key: &str) -> crate::Result<Self> {
        let key = key.trim_matches('/');
        let (resource_type, resource_id) = key.split_once('/').ok_or_else(|| {
            crate::Error::InvalidInput(format!("Resource key must be 'type/id': {}", key))
        })?;
        Self::new(resource_type, resource_id)
    }

    /// Key under which the record is stored locally.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }

    /// Authority path of this single record.
    pub fn api_path(&self) -> String {
        format!("/api/{}/{}", self.resource_type, self.resource_id)
    }

    /// Authority path of the collection containing this record.
    pub fn collection_path(&self) -> String {
        format!("/api/{}", self.resource_type)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}
