//! Contract lifecycle scenarios: creation, actions, key revocation, atomic
//! operations, restarts and reference counting.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use chelonia_core::{
    ActionParams, ChelError, Chelonia, CheloniaConfig, ContractMeta, ContractState, Hooks, Signer, SyncOptions,
    action_op, key_add_op, prop_set_op,
};
use chelonia_harness::{
    InvariantRegistry, SimClient, SimCluster, SimTransport, SystemSnapshot,
    fixtures::{self, member_key},
    init_tracing,
};
use chelonia_proto::ContractId;
use serde_json::json;

fn increment(by: u64) -> ActionParams {
    ActionParams { action: "counter/increment".into(), data: json!({ "by": by }), ..ActionParams::default() }
}

fn count(client: &SimClient, contract_id: &ContractId) -> Option<u64> {
    client.state(contract_id)?.data.get("count")?.as_u64()
}

#[tokio::test(start_paused = true)]
async fn genesis_replicates_to_a_second_client() {
    init_tracing();
    let cluster = SimCluster::new(1, 2, &fixtures::registry().unwrap());
    let (alice, bob) = (cluster.client(0), cluster.client(1));

    let contract_id = alice.create_counter().await.unwrap();
    assert_eq!(alice.meta(&contract_id).unwrap().height, 0);
    assert_eq!(cluster.server.log_len(&contract_id), 1);

    bob.engine.retain(std::slice::from_ref(&contract_id), false).await.unwrap();
    alice.engine.action(&contract_id, increment(3)).await.unwrap();
    cluster.quiesce().await;

    // ORACLE: both clients replayed the same two messages.
    assert_eq!(count(alice, &contract_id), Some(3));
    assert_eq!(count(bob, &contract_id), Some(3));
    assert_eq!(alice.meta(&contract_id).unwrap().head, bob.meta(&contract_id).unwrap().head);
    InvariantRegistry::standard().assert_all(&SystemSnapshot::capture(&cluster, &[contract_id]), "after replication");
}

#[tokio::test(start_paused = true)]
async fn duplicate_event_changes_nothing() {
    init_tracing();
    let cluster = SimCluster::new(2, 1, &fixtures::registry().unwrap());
    let alice = cluster.client(0);

    let contract_id = alice.create_counter().await.unwrap();
    alice.engine.action(&contract_id, increment(1)).await.unwrap();
    alice.quiesce().await;
    let before = alice.state(&contract_id).unwrap();
    let meta = alice.meta(&contract_id).unwrap();

    let replay = cluster.server.message_at(&contract_id, 1).unwrap();
    alice.engine.handle_event(replay).await.unwrap();

    assert_eq!(alice.state(&contract_id).unwrap(), before);
    assert_eq!(alice.meta(&contract_id).unwrap(), meta);
}

#[tokio::test(start_paused = true)]
async fn revoked_member_can_no_longer_publish() {
    init_tracing();
    let cluster = SimCluster::new(3, 2, &fixtures::registry().unwrap());
    let (alice, bob) = (cluster.client(0), cluster.client(1));
    let contract_id = alice.create_counter().await.unwrap();

    alice.engine.key_add(&contract_id, vec![member_key(&bob.identity.signing, "bob")], None).await.unwrap();
    bob.engine.retain(std::slice::from_ref(&contract_id), false).await.unwrap();

    let as_bob = ActionParams { signing_key_id: Some(bob.identity.signing_id()), ..increment(1) };
    bob.engine.action(&contract_id, as_bob.clone()).await.unwrap();
    cluster.quiesce().await;
    assert_eq!(count(alice, &contract_id), Some(1));

    alice.engine.key_del(&contract_id, vec![bob.identity.signing_id()]).await.unwrap();
    cluster.quiesce().await;

    let revoked = bob.engine.action(&contract_id, as_bob).await;
    assert!(matches!(revoked, Err(ChelError::SignatureKeyUnauthorized { .. })), "got {revoked:?}");
    assert_eq!(count(alice, &contract_id), Some(1));
}

#[tokio::test(start_paused = true)]
async fn member_key_cannot_call_outside_its_permissions() {
    init_tracing();
    let cluster = SimCluster::new(4, 2, &fixtures::registry().unwrap());
    let (alice, bob) = (cluster.client(0), cluster.client(1));
    let contract_id = alice.create_counter().await.unwrap();
    alice.engine.key_add(&contract_id, vec![member_key(&bob.identity.signing, "bob")], None).await.unwrap();
    bob.engine.retain(std::slice::from_ref(&contract_id), false).await.unwrap();

    // Member keys may only act; no held key may set properties.
    let result = bob.engine.prop_set(&contract_id, "title", json!("bob was here")).await;
    assert!(matches!(result, Err(ChelError::PermissionDenied(_))), "got {result:?}");
}

#[tokio::test(start_paused = true)]
async fn atomic_applies_children_in_order_and_skips_no_ops() {
    init_tracing();
    let cluster = SimCluster::new(5, 1, &fixtures::registry().unwrap());
    let alice = cluster.client(0);
    let contract_id = alice.create_counter().await.unwrap();

    let existing = alice.identity.contract_keys();
    let hash = alice
        .engine
        .atomic(
            &contract_id,
            vec![prop_set_op("title", json!("hello")), key_add_op(existing, None), action_op(&increment(2))],
            Signer::default(),
        )
        .await
        .unwrap();
    assert!(hash.is_some());
    alice.quiesce().await;

    let state = alice.state(&contract_id).unwrap();
    assert_eq!(state.data["count"], json!(2));
    assert_eq!(state.vm.authorized_keys.len(), 2);
    insta::assert_json_snapshot!(state.vm.props, @r###"
    {
      "title": "hello"
    }
    "###);
}

#[tokio::test(start_paused = true)]
async fn no_op_publish_sends_nothing() {
    init_tracing();
    let cluster = SimCluster::new(6, 1, &fixtures::registry().unwrap());
    let alice = cluster.client(0);
    let contract_id = alice.create_counter().await.unwrap();
    let published = cluster.server.published();

    let hash = alice.engine.prop_del(&contract_id, "never-set").await.unwrap();
    let again = alice.engine.key_add(&contract_id, alice.identity.contract_keys(), None).await.unwrap();

    assert_eq!(hash, None);
    assert_eq!(again, None);
    assert_eq!(cluster.server.published(), published);
}

#[tokio::test(start_paused = true)]
async fn invalid_action_is_rejected_before_publishing() {
    init_tracing();
    let cluster = SimCluster::new(7, 1, &fixtures::registry().unwrap());
    let alice = cluster.client(0);
    let contract_id = alice.create_counter().await.unwrap();

    let result = alice.engine.action(&contract_id, increment(0)).await;
    assert!(matches!(result, Err(ChelError::ActionFailed { .. })), "got {result:?}");

    let unknown = ActionParams { action: "counter/explode".into(), ..increment(1) };
    let result = alice.engine.action(&contract_id, unknown).await;
    assert!(matches!(result, Err(ChelError::UnknownAction(_))), "got {result:?}");
    assert_eq!(cluster.server.log_len(&contract_id), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_restores_state_and_references() {
    init_tracing();
    let cluster = SimCluster::new(8, 1, &fixtures::registry().unwrap());
    let alice = cluster.client(0);
    let contract_id = alice.create_counter().await.unwrap();
    alice.engine.action(&contract_id, increment(4)).await.unwrap();
    alice.quiesce().await;
    let state = alice.state(&contract_id).unwrap();

    let transport = SimTransport::connect(cluster.server.clone());
    let restarted = Chelonia::new(
        alice.env.clone(),
        alice.storage.clone(),
        transport.clone(),
        CheloniaConfig::default(),
        fixtures::registry().unwrap(),
    );
    let restored = restarted.restore().unwrap();

    assert_eq!(restored, vec![contract_id.clone()]);
    assert_eq!(restarted.state(&contract_id).unwrap(), state);
    assert_eq!(restarted.references(&contract_id), 1);

    // Resubscribing is a real fetch that finds nothing new.
    restarted.sync_contract(contract_id.clone(), SyncOptions::default()).await.unwrap();
    assert_eq!(restarted.meta(&contract_id).unwrap().height, 1);
    assert!(cluster.server.is_subscribed(transport.client_id(), &contract_id));
}

#[tokio::test(start_paused = true)]
async fn releasing_the_last_reference_removes_the_contract() {
    init_tracing();
    let cluster = SimCluster::new(9, 2, &fixtures::registry().unwrap());
    let (alice, bob) = (cluster.client(0), cluster.client(1));
    let contract_id = alice.create_counter().await.unwrap();

    let ids = std::slice::from_ref(&contract_id);
    bob.engine.retain(ids, false).await.unwrap();
    bob.engine.retain(ids, true).await.unwrap();
    assert_eq!(bob.engine.references(&contract_id), 2);

    bob.engine.release(ids, true).await.unwrap();
    assert!(bob.state(&contract_id).is_some());

    bob.engine.release(ids, false).await.unwrap();
    assert!(bob.state(&contract_id).is_none());
    assert!(!bob.engine.is_subscribed(&contract_id));
    assert!(!cluster.server.is_subscribed(bob.transport.client_id(), &contract_id));
    assert_eq!(bob.storage.contract_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn reset_drops_in_memory_state() {
    init_tracing();
    let cluster = SimCluster::new(10, 1, &fixtures::registry().unwrap());
    let alice = cluster.client(0);
    let contract_id = alice.create_counter().await.unwrap();
    let epoch = alice.engine.epoch();

    alice.engine.reset();
    assert_eq!(alice.engine.epoch(), epoch + 1);
    assert!(alice.state(&contract_id).is_none());
    assert!(alice.engine.secrets().is_empty());

    // Storage survives; restore brings the contract back.
    assert_eq!(alice.engine.restore().unwrap(), vec![contract_id]);
}

#[derive(Clone, Default)]
struct CountingHooks {
    commits: Arc<AtomicUsize>,
}

impl Hooks for CountingHooks {
    fn state_committed(&self, _contract_id: &ContractId, _meta: &ContractMeta, _state: &ContractState) {
        self.commits.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn every_commit_reaches_the_hooks() {
    init_tracing();
    let hooks = CountingHooks::default();
    let server = chelonia_harness::create_shared_server();
    let alice =
        SimClient::with_hooks(server, 11, CheloniaConfig::default(), fixtures::registry().unwrap(), hooks.clone());

    let contract_id = alice.create_counter().await.unwrap();
    alice.engine.action(&contract_id, increment(1)).await.unwrap();
    alice.engine.prop_set(&contract_id, "title", json!("x")).await.unwrap();
    alice.quiesce().await;

    // Pushes of our own messages are duplicates and commit nothing.
    assert_eq!(hooks.commits.load(Ordering::SeqCst), 3);
}
