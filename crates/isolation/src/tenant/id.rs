//! Tenant identifier type.
//!
//! [`TenantId`] is the globally unique, immutable key of a tenant record. It is
//! distinct from the tenant's *identifier* slug: the id is what registries and
//! premium sets key on, while the slug is the one value that ever reaches DDL.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::IdentifierError;

/// Longest accepted tenant id, in characters.
pub const MAX_TENANT_ID_CHARS: usize = 255;

/// An opaque, globally unique tenant id.
///
/// Ids from untrusted input go through [`TenantId::parse`], which rejects
/// empty and overlong values. Deserialization and [`FromStr`] use it too.
///
/// # Examples
///
/// ```
/// use tenantry_isolation::tenant::TenantId;
///
/// let id = TenantId::parse("tnt_01").unwrap();
/// assert_eq!(id.as_str(), "tnt_01");
/// assert_eq!(id.to_string(), "tnt_01");
/// assert!(TenantId::parse("").is_err());
///
/// let generated = TenantId::generate();
/// assert_ne!(generated, TenantId::generate());
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant id from trusted input without validating it.
    ///
    /// Registries re-check ids on creation, so an unchecked id never gets
    /// stored.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a tenant id, rejecting empty ids and ids over
    /// [`MAX_TENANT_ID_CHARS`] characters.
    pub fn parse(id: impl Into<String>) -> Result<Self, IdentifierError> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    /// Checks the id against the rules of [`TenantId::parse`].
    pub fn validate(&self) -> Result<(), IdentifierError> {
        let chars = self.0.chars().count();
        if chars == 0 || chars > MAX_TENANT_ID_CHARS || self.0.chars().any(char::is_control) {
            let mut value: String = self.0.chars().take(64).collect();
            if chars > 64 {
                value.push_str("...");
            }
            return Err(IdentifierError::InvalidTenantId {
                value,
                context: format!("ids are 1 to {MAX_TENANT_ID_CHARS} printable characters"),
            });
        }
        Ok(())
    }

    /// Whether the id can be pasted into a URL as is.
    pub fn is_url_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
    }

    /// Generates a fresh random tenant id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the tenant id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({})", self.0)
    }
}

impl FromStr for TenantId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TenantId::parse(s)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TenantId::parse(raw).map_err(serde::de::Error::custom)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        TenantId::new(s)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for TenantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tenant_id_roundtrip_json() {
        let id = TenantId::new("tenant-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"tenant-7\"");
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_tenant_id_borrow_lookup() {
        let mut set = HashSet::new();
        set.insert(TenantId::new("premium-1"));
        assert!(set.contains("premium-1"));
        assert!(!set.contains("premium-2"));
    }

    #[test]
    fn test_parse_rejects_empty_and_overlong_ids() {
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("t\n1").is_err());
        assert!(TenantId::parse("x".repeat(MAX_TENANT_ID_CHARS + 1)).is_err());
        assert!(TenantId::parse("x".repeat(MAX_TENANT_ID_CHARS)).is_ok());
        assert!("".parse::<TenantId>().is_err());

        let err = TenantId::parse("").unwrap_err();
        assert!(matches!(err, IdentifierError::InvalidTenantId { .. }));
        assert!(serde_json::from_str::<TenantId>("\"\"").is_err());
    }

    #[test]
    fn test_url_safe_ids() {
        assert!(TenantId::new("t-1_a.b~c").is_url_safe());
        assert!(!TenantId::new("t1/../admin").is_url_safe());
        assert!(!TenantId::new("u@evil").is_url_safe());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: HashSet<_> = (0..100).map(|_| TenantId::generate()).collect();
        assert_eq!(ids.len(), 100);
    }
}
