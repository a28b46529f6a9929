//! Property-based tests for key management permissions.

use std::collections::BTreeSet;

use chelonia_core::{
    ChelError,
    keys::{AuthorizedKey, validate_key_add_permissions, validate_key_del_permissions, validate_key_update_permissions},
};
use chelonia_proto::{KeyDescriptor, KeyId, KeyMeta, KeyPurpose, KeyUpdate, OpType, Permission, Scope};
use proptest::prelude::*;

const OPS: [OpType; 6] = [
    OpType::ActionEncrypted,
    OpType::ActionUnencrypted,
    OpType::KeyAdd,
    OpType::KeyDel,
    OpType::KeyUpdate,
    OpType::KeyRequest,
];

fn permission() -> impl Strategy<Value = Permission> {
    (prop::sample::select(OPS.to_vec()), any::<bool>()).prop_map(|(op, inner)| Permission { op, inner })
}

fn scope() -> impl Strategy<Value = Scope<Permission>> {
    prop_oneof![
        1 => Just(Scope::All),
        3 => prop::collection::btree_set(permission(), 0..4).prop_map(Scope::Only),
    ]
}

fn descriptor(id: &str, ring_level: u32, permissions: Scope<Permission>) -> KeyDescriptor {
    KeyDescriptor {
        id: KeyId::from(id),
        name: id.into(),
        purpose: BTreeSet::from([KeyPurpose::Sig]),
        ring_level,
        permissions,
        allowed_actions: Scope::All,
        data: String::new(),
        foreign_key: None,
        meta: KeyMeta::default(),
    }
}

fn key(id: &str, ring_level: u32, permissions: Scope<Permission>) -> AuthorizedKey {
    AuthorizedKey::from_descriptor(descriptor(id, ring_level, permissions), 0, None)
}

/// Whether every permission in `wanted` is held by `held`.
fn within(wanted: &Scope<Permission>, held: &Scope<Permission>) -> bool {
    match (wanted, held) {
        (_, Scope::All) => true,
        (Scope::All, Scope::Only(_)) => false,
        (Scope::Only(wanted), Scope::Only(held)) => wanted.iter().all(|permission| held.contains(permission)),
    }
}

fn update_of(target: &AuthorizedKey, permissions: Option<Scope<Permission>>) -> KeyUpdate {
    KeyUpdate {
        name: target.name.clone(),
        old_key_id: target.id.clone(),
        id: None,
        data: None,
        purpose: None,
        permissions,
        allowed_actions: None,
        meta: None,
    }
}

proptest! {
    #[test]
    fn add_never_reaches_a_more_privileged_ring(
        signer_ring in 0u32..4,
        target_ring in 0u32..4,
        held in scope(),
        wanted in scope(),
    ) {
        let signer = key("signer", signer_ring, held.clone());
        let result = validate_key_add_permissions(&signer, &descriptor("target", target_ring, wanted.clone()));

        // ORACLE: a signer manages only its own ring or less privileged
        // ones, and grants only what it holds.
        let allowed = target_ring >= signer_ring && within(&wanted, &held);
        prop_assert_eq!(result.is_ok(), allowed, "signer ring {} target ring {}", signer_ring, target_ring);
        if let Err(err) = result {
            prop_assert!(matches!(err, ChelError::PermissionDenied(_)), "got {err:?}");
        }
    }

    #[test]
    fn del_never_reaches_a_more_privileged_ring(signer_ring in 0u32..4, target_ring in 0u32..4, held in scope()) {
        let signer = key("signer", signer_ring, held);
        let target = key("target", target_ring, Scope::All);

        // INVARIANT: revocation follows the ring order alone.
        prop_assert_eq!(validate_key_del_permissions(&signer, &target).is_ok(), target_ring >= signer_ring);
    }

    #[test]
    fn update_never_reaches_a_more_privileged_ring(
        signer_ring in 0u32..4,
        target_ring in 0u32..4,
        held in scope(),
        existing in scope(),
        replacement in prop::option::of(scope()),
    ) {
        let signer = key("signer", signer_ring, held.clone());
        let target = key("target", target_ring, existing.clone());
        let result = validate_key_update_permissions(&signer, &target, &update_of(&target, replacement.clone()));

        // ORACLE: the permissions the key ends up with must be held by the
        // signer, whether replaced or kept.
        let effective = replacement.unwrap_or(existing);
        let allowed = target_ring >= signer_ring && within(&effective, &held);
        prop_assert_eq!(result.is_ok(), allowed);
    }
}
