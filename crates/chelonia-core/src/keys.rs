//! Authorized keys and the rules for changing them.
//!
//! A contract's key table only ever grows: revoked keys stay in the table with
//! `not_after_height` set, so that historical messages keep verifying when a
//! contract is re-processed from genesis.
//!
//! # Invariants
//!
//! - At most one active key per name.
//! - A key is valid at height `h` iff `not_before_height <= h`, it is not
//!   revoked at or before `h`, and `h` does not fall in a window during which
//!   it was revoked before being re-added.
//! - A signer can only add, remove or update keys whose ring level is at
//!   least its own, and cannot grant permissions or actions it lacks.

use std::collections::{BTreeMap, BTreeSet};

use chelonia_proto::{
    ForeignKeyRef, KeyDescriptor, KeyId, KeyMeta, KeyPurpose, KeyUpdate, Permission, Scope,
};
use serde::{Deserialize, Serialize};

use crate::{error::ChelError, secrets::SecretKeyStore};

/// A key in a contract's key table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedKey {
    /// Key identifier
    pub id: KeyId,
    /// Key name
    pub name: String,
    /// Allowed uses
    pub purpose: BTreeSet<KeyPurpose>,
    /// Privilege level (lower is more privileged)
    pub ring_level: u32,
    /// Operation types the key may sign
    pub permissions: Scope<Permission>,
    /// Action names the key may sign
    pub allowed_actions: Scope<String>,
    /// Serialized public key
    pub data: String,
    /// Mirrored foreign key
    pub foreign_key: Option<ForeignKeyRef>,
    /// Metadata as last written
    pub meta: KeyMeta,
    /// First height the key is valid at
    pub not_before_height: u64,
    /// Height the key was revoked at, exclusive
    pub not_after_height: Option<u64>,
    /// Key that added this one (absent for genesis keys)
    pub added_by: Option<KeyId>,
    /// Past `[revoked_at, re_added_at)` windows
    pub revoked_windows: Vec<(u64, u64)>,
}

impl AuthorizedKey {
    /// Key added at `height` by `added_by`.
    #[must_use]
    pub fn from_descriptor(descriptor: KeyDescriptor, height: u64, added_by: Option<KeyId>) -> Self {
        Self {
            id: descriptor.id,
            name: descriptor.name,
            purpose: descriptor.purpose,
            ring_level: descriptor.ring_level,
            permissions: descriptor.permissions,
            allowed_actions: descriptor.allowed_actions,
            data: descriptor.data,
            foreign_key: descriptor.foreign_key,
            meta: descriptor.meta,
            not_before_height: height,
            not_after_height: None,
            added_by,
            revoked_windows: Vec::new(),
        }
    }

    /// Public descriptor.
    #[must_use]
    pub fn descriptor(&self) -> KeyDescriptor {
        KeyDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            purpose: self.purpose.clone(),
            ring_level: self.ring_level,
            permissions: self.permissions.clone(),
            allowed_actions: self.allowed_actions.clone(),
            data: self.data.clone(),
            foreign_key: self.foreign_key.clone(),
            meta: self.meta.clone(),
        }
    }

    /// Not revoked.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.not_after_height.is_none()
    }

    /// Valid for a message at `height`.
    #[must_use]
    pub fn is_valid_at(&self, height: u64) -> bool {
        self.not_before_height <= height
            && self.not_after_height.is_none_or(|after| height < after)
            && !self.revoked_windows.iter().any(|&(from, to)| from <= height && height < to)
    }

    /// Has `purpose`.
    #[must_use]
    pub fn has_purpose(&self, purpose: KeyPurpose) -> bool {
        self.purpose.contains(&purpose)
    }

    /// May sign `permission`.
    #[must_use]
    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.allows(&permission)
    }

    /// May sign `action`.
    #[must_use]
    pub fn allows_action(&self, action: &str) -> bool {
        match &self.allowed_actions {
            Scope::All => true,
            Scope::Only(actions) => actions.contains(action),
        }
    }

    /// Private keys must stay private across updates.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.meta.private.is_some()
    }
}

/// Key table keyed by id.
pub type KeyTable = BTreeMap<KeyId, AuthorizedKey>;

/// Active key named `name`.
#[must_use]
pub fn find_key_by_name<'a>(keys: &'a KeyTable, name: &str) -> Option<&'a AuthorizedKey> {
    keys.values().find(|key| key.is_active() && key.name == name)
}

/// Id of the active key named `name`.
#[must_use]
pub fn find_key_id_by_name(keys: &KeyTable, name: &str) -> Option<KeyId> {
    find_key_by_name(keys, name).map(|key| key.id.clone())
}

/// Criteria for choosing a local signing or encryption key.
#[derive(Debug, Clone, Default)]
pub struct KeyQuery<'a> {
    /// Every one of these must be allowed
    pub permissions: &'a [Permission],
    /// Every one of these purposes is required
    pub purposes: &'a [KeyPurpose],
    /// Highest acceptable ring level (lower is more privileged)
    pub max_ring_level: Option<u32>,
    /// Every one of these actions must be allowed
    pub allowed_actions: &'a [&'a str],
}

/// Choose the least privileged active key whose secret is held locally and
/// which satisfies `query`.
///
/// "Least privileged" means the highest ring level not above the query's
/// ceiling. Ties break on key id so every client picks the same key.
#[must_use]
pub fn find_suitable_secret_key_id(keys: &KeyTable, secrets: &SecretKeyStore, query: &KeyQuery<'_>) -> Option<KeyId> {
    keys.values()
        .filter(|key| key.is_active())
        .filter(|key| query.max_ring_level.is_none_or(|ceiling| key.ring_level <= ceiling))
        .filter(|key| query.purposes.iter().all(|purpose| key.has_purpose(*purpose)))
        .filter(|key| query.permissions.iter().all(|permission| key.allows(*permission)))
        .filter(|key| query.allowed_actions.iter().all(|action| key.allows_action(action)))
        .filter(|key| secrets.contains(&key.id))
        .max_by(|a, b| a.ring_level.cmp(&b.ring_level).then_with(|| b.id.cmp(&a.id)))
        .map(|key| key.id.clone())
}

/// Active encryption keys, most privileged first.
#[must_use]
pub fn encryption_keys(keys: &KeyTable) -> Vec<&AuthorizedKey> {
    let mut found: Vec<_> =
        keys.values().filter(|key| key.is_active() && key.has_purpose(KeyPurpose::Enc)).collect();
    found.sort_by(|a, b| a.ring_level.cmp(&b.ring_level).then_with(|| a.id.cmp(&b.id)));
    found
}

/// Whether `signer` may add `key`.
pub fn validate_key_add_permissions(signer: &AuthorizedKey, key: &KeyDescriptor) -> Result<(), ChelError> {
    check_ring(signer, key.ring_level, &key.id)?;
    check_grants(signer, &key.permissions, &key.allowed_actions, &key.id)?;
    if key.is_private() && !signer.is_private() {
        return Err(ChelError::PermissionDenied(format!(
            "public signer {} cannot add private key {}",
            signer.id, key.id
        )));
    }
    Ok(())
}

/// Whether `signer` may revoke `key`.
pub fn validate_key_del_permissions(signer: &AuthorizedKey, key: &AuthorizedKey) -> Result<(), ChelError> {
    check_ring(signer, key.ring_level, &key.id)
}

/// Whether `signer` may apply `update` to `existing`.
pub fn validate_key_update_permissions(
    signer: &AuthorizedKey,
    existing: &AuthorizedKey,
    update: &KeyUpdate,
) -> Result<(), ChelError> {
    check_ring(signer, existing.ring_level, &existing.id)?;
    let permissions = update.permissions.as_ref().unwrap_or(&existing.permissions);
    let allowed_actions = update.allowed_actions.as_ref().unwrap_or(&existing.allowed_actions);
    check_grants(signer, permissions, allowed_actions, &existing.id)?;

    if existing.is_private() && update.meta.as_ref().is_some_and(|meta| meta.private.is_none()) {
        return Err(ChelError::PermissionDenied(format!(
            "key {} is private and cannot be made public",
            existing.id
        )));
    }
    Ok(())
}

fn check_ring(signer: &AuthorizedKey, target_ring: u32, target: &KeyId) -> Result<(), ChelError> {
    if target_ring < signer.ring_level {
        return Err(ChelError::PermissionDenied(format!(
            "signer {} at ring {} cannot manage key {target} at ring {target_ring}",
            signer.id, signer.ring_level
        )));
    }
    Ok(())
}

fn check_grants(
    signer: &AuthorizedKey,
    permissions: &Scope<Permission>,
    allowed_actions: &Scope<String>,
    target: &KeyId,
) -> Result<(), ChelError> {
    if !permissions.is_subset_of(&signer.permissions) {
        return Err(ChelError::PermissionDenied(format!(
            "signer {} cannot grant key {target} permissions it lacks",
            signer.id
        )));
    }
    if !allowed_actions.is_subset_of(&signer.allowed_actions) {
        return Err(ChelError::PermissionDenied(format!(
            "signer {} cannot grant key {target} actions it lacks",
            signer.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chelonia_crypto::{Key, KeyAlgorithm};
    use chelonia_proto::OpType;

    use super::*;

    fn descriptor(id: &str, name: &str, ring: u32, permissions: Scope<Permission>) -> KeyDescriptor {
        KeyDescriptor {
            id: KeyId::from(id),
            name: name.into(),
            purpose: [KeyPurpose::Sig].into(),
            ring_level: ring,
            permissions,
            allowed_actions: Scope::All,
            data: String::new(),
            foreign_key: None,
            meta: KeyMeta::default(),
        }
    }

    fn key(id: &str, name: &str, ring: u32, permissions: Scope<Permission>) -> AuthorizedKey {
        AuthorizedKey::from_descriptor(descriptor(id, name, ring, permissions), 0, None)
    }

    #[test]
    fn validity_window() {
        let mut k = AuthorizedKey::from_descriptor(descriptor("k", "n", 0, Scope::All), 3, None);
        assert!(!k.is_valid_at(2));
        assert!(k.is_valid_at(3));

        k.not_after_height = Some(7);
        assert!(k.is_valid_at(6));
        assert!(!k.is_valid_at(7));
        assert!(!k.is_active());
    }

    #[test]
    fn revoked_window_excludes_gap() {
        let mut k = key("k", "n", 0, Scope::All);
        k.revoked_windows.push((4, 9));
        assert!(k.is_valid_at(3));
        assert!(!k.is_valid_at(4));
        assert!(!k.is_valid_at(8));
        assert!(k.is_valid_at(9));
    }

    #[test]
    fn ring_level_limits_management() {
        let signer = key("s", "signer", 1, Scope::All);
        let more_privileged = descriptor("t", "target", 0, Scope::none());
        let equal = descriptor("u", "peer", 1, Scope::none());

        assert!(matches!(
            validate_key_add_permissions(&signer, &more_privileged),
            Err(ChelError::PermissionDenied(_))
        ));
        assert!(validate_key_add_permissions(&signer, &equal).is_ok());
    }

    #[test]
    fn cannot_grant_missing_permissions() {
        let signer = key("s", "signer", 0, [Permission::outer(OpType::KeyAdd)].into_iter().collect());
        let wants_more = descriptor("t", "target", 1, Scope::All);
        let subset = descriptor("u", "target", 1, [Permission::outer(OpType::KeyAdd)].into_iter().collect());

        assert!(validate_key_add_permissions(&signer, &wants_more).is_err());
        assert!(validate_key_add_permissions(&signer, &subset).is_ok());
    }

    #[test]
    fn only_private_signers_add_private_keys() {
        let mut signer = key("s", "signer", 0, Scope::All);
        let mut target = descriptor("t", "target", 1, Scope::none());
        target.meta.private = Some(chelonia_proto::PrivateKeyMeta { content: None, shareable: false });

        assert!(validate_key_add_permissions(&signer, &target).is_err());
        signer.meta.private = Some(chelonia_proto::PrivateKeyMeta { content: None, shareable: false });
        assert!(validate_key_add_permissions(&signer, &target).is_ok());
    }

    #[test]
    fn private_keys_stay_private() {
        let signer = key("s", "signer", 0, Scope::All);
        let mut existing = key("k", "k", 1, Scope::none());
        existing.meta.private = Some(chelonia_proto::PrivateKeyMeta { content: None, shareable: true });

        let update = KeyUpdate {
            name: "k".into(),
            old_key_id: KeyId::from("k"),
            id: None,
            data: None,
            purpose: None,
            permissions: None,
            allowed_actions: None,
            meta: Some(KeyMeta::default()),
        };
        assert!(validate_key_update_permissions(&signer, &existing, &update).is_err());
    }

    #[test]
    fn suitable_key_prefers_least_privileged_held_secret() {
        let secrets = SecretKeyStore::new();
        let root = Key::generate(KeyAlgorithm::Ed25519, [1; 32]);
        let member = Key::generate(KeyAlgorithm::Ed25519, [2; 32]);
        let unheld = Key::generate(KeyAlgorithm::Ed25519, [3; 32]);

        let mut table = KeyTable::new();
        for (k, ring) in [(&root, 0), (&member, 1), (&unheld, 2)] {
            let id = KeyId::new(k.id());
            table.insert(id.clone(), key(id.as_str(), id.as_str(), ring, Scope::All));
        }
        secrets.insert(root.clone());
        secrets.insert(member.clone());

        let query = KeyQuery { purposes: &[KeyPurpose::Sig], ..KeyQuery::default() };
        assert_eq!(find_suitable_secret_key_id(&table, &secrets, &query), Some(KeyId::new(member.id())));

        let privileged = KeyQuery { max_ring_level: Some(0), ..query };
        assert_eq!(find_suitable_secret_key_id(&table, &secrets, &privileged), Some(KeyId::new(root.id())));
    }

    #[test]
    fn lookup_by_name_ignores_revoked() {
        let mut table = KeyTable::new();
        let mut old = key("old", "csk", 0, Scope::All);
        old.not_after_height = Some(2);
        table.insert(old.id.clone(), old);
        assert_eq!(find_key_id_by_name(&table, "csk"), None);

        table.insert(KeyId::from("new"), key("new", "csk", 0, Scope::All));
        assert_eq!(find_key_id_by_name(&table, "csk"), Some(KeyId::from("new")));
    }
}
