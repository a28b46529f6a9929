//! Key permissions and scopes.

use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

use crate::{errors::ProtocolError, ops::OpType};

/// Permission to sign one operation type.
///
/// Outer permissions authorize the message signature. Inner permissions
/// (`<code>#inner`) authorize a signature on the enveloped operation data,
/// which lets a key author an action that a different key submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Permission {
    /// Operation type covered by this permission
    pub op: OpType,
    /// Whether this is the inner-signature variant
    pub inner: bool,
}

impl Permission {
    const INNER_SUFFIX: &'static str = "#inner";

    /// Permission to sign messages of type `op`.
    #[must_use]
    pub const fn outer(op: OpType) -> Self {
        Self { op, inner: false }
    }

    /// Permission to sign the enveloped data of an `op` message.
    #[must_use]
    pub const fn inner(op: OpType) -> Self {
        Self { op, inner: true }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op.code())?;
        if self.inner {
            f.write_str(Self::INNER_SUFFIX)?;
        }
        Ok(())
    }
}

impl FromStr for Permission {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (code, inner) = match s.strip_suffix(Self::INNER_SUFFIX) {
            Some(code) => (code, true),
            None => (s, false),
        };
        let op = OpType::from_code(code).ok_or_else(|| ProtocolError::InvalidPermission(s.to_owned()))?;
        Ok(Self { op, inner })
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Either everything (`"*"`) or an explicit set.
///
/// Used for key permissions and allowed actions. An empty set allows nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope<T: Ord> {
    /// Wildcard
    All,
    /// Explicit allow-list
    Only(BTreeSet<T>),
}

impl<T: Ord> Scope<T> {
    /// Scope that allows nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::Only(BTreeSet::new())
    }

    /// Whether `item` is allowed.
    pub fn allows(&self, item: &T) -> bool {
        match self {
            Self::All => true,
            Self::Only(items) => items.contains(item),
        }
    }

    /// Whether every item allowed by `self` is also allowed by `other`.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        match (self, other) {
            (_, Self::All) => true,
            (Self::All, Self::Only(_)) => false,
            (Self::Only(mine), Self::Only(theirs)) => mine.is_subset(theirs),
        }
    }
}

impl<T: Ord> Default for Scope<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T: Ord> FromIterator<T> for Scope<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::Only(iter.into_iter().collect())
    }
}

impl<T: Ord + Serialize> Serialize for Scope<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("*"),
            Self::Only(items) => items.serialize(serializer),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScopeRepr<T: Ord> {
    Wildcard(String),
    List(BTreeSet<T>),
}

impl<'de, T: Ord + Deserialize<'de>> Deserialize<'de> for Scope<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ScopeRepr::<T>::deserialize(deserializer)? {
            ScopeRepr::Wildcard(w) if w == "*" => Ok(Self::All),
            ScopeRepr::Wildcard(w) => Err(D::Error::custom(format!("invalid scope wildcard {w:?}"))),
            ScopeRepr::List(items) => Ok(Self::Only(items)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn permission_string_forms() {
        assert_eq!(Permission::outer(OpType::KeyAdd).to_string(), "ka");
        assert_eq!(Permission::inner(OpType::ActionEncrypted).to_string(), "ae#inner");
        assert_eq!("krs".parse::<Permission>(), Ok(Permission::outer(OpType::KeyRequestSeen)));
        assert_eq!("au#inner".parse::<Permission>(), Ok(Permission::inner(OpType::ActionUnencrypted)));
        assert!("zz".parse::<Permission>().is_err());
        assert!("#inner".parse::<Permission>().is_err());
    }

    #[test]
    fn wildcard_is_superset_of_everything() {
        let some: Scope<Permission> = [Permission::outer(OpType::KeyDel)].into_iter().collect();
        assert!(some.is_subset_of(&Scope::All));
        assert!(!Scope::<Permission>::All.is_subset_of(&some));
        assert!(Scope::<Permission>::none().is_subset_of(&some));
    }

    #[test]
    fn scope_serializes_wildcard_as_star() {
        let all: Scope<String> = Scope::All;
        let bytes = codec::encode(&all).unwrap();
        let text: String = codec::decode(&bytes).unwrap();
        assert_eq!(text, "*");

        let decoded: Scope<String> = codec::decode(&bytes).unwrap();
        assert_eq!(decoded, Scope::All);
    }

    #[test]
    fn scope_list_survives_encoding() {
        let scope: Scope<Permission> =
            [Permission::outer(OpType::ActionEncrypted), Permission::inner(OpType::ActionEncrypted)]
                .into_iter()
                .collect();
        let decoded: Scope<Permission> = codec::decode(&codec::encode(&scope).unwrap()).unwrap();
        assert_eq!(decoded, scope);
    }

    #[test]
    fn scope_rejects_other_strings() {
        let bytes = codec::encode("everything").unwrap();
        assert!(codec::decode::<Scope<String>>(&bytes).is_err());
    }
}
