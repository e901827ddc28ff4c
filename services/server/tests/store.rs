//! ProfileStore behavior: session rules, follow rules, publish fan-out,
//! pending-queue conservation, and snapshot persistence.

use std::collections::BTreeSet;

use nf_proto::{Address, NotifMessage, Username};
use nf_transport::mailbox::mailbox;
use server::{ProfileStore, StoreError, MAX_SESSIONS_PER_PROFILE};

fn username(content: &str) -> Username {
    Username::new(content).unwrap()
}

fn notif(content: &str) -> NotifMessage {
    NotifMessage::new(content).unwrap()
}

fn temp_store() -> (tempfile::TempDir, ProfileStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ProfileStore::new(dir.path().join("server_data"));
    (dir, store)
}

/// Assert the pending-queue conservation invariant: queued entries across
/// all followers equal the summed retained pending counts.
fn assert_conserved(store: &ProfileStore) {
    let (queued, retained) = store.pending_counts();
    assert_eq!(queued, retained, "pending queues out of sync with retained notifs");
}

// ---------------------------------------------------------------------------
// Connect / disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_creates_profile_and_session() {
    let (_dir, store) = temp_store();
    let client = Address::localhost(3232);
    store.connect(client, &username("@helloworld"), 100).unwrap();

    assert!(store.has_profile(&username("@helloworld")));
    assert_eq!(store.session_username(client), Some(username("@helloworld")));
}

#[tokio::test]
async fn session_cap_is_enforced() {
    let (_dir, store) = temp_store();
    let handle = username("@helloworld");
    for i in 0..MAX_SESSIONS_PER_PROFILE {
        store
            .connect(Address::localhost(4000 + i as u16), &handle, 1)
            .unwrap();
    }
    let extra = store.connect(Address::localhost(4999), &handle, 1);
    assert_eq!(extra, Err(StoreError::TooManySessions));
    assert_eq!(store.session_username(Address::localhost(4999)), None);
}

#[tokio::test]
async fn disconnect_reports_whether_a_session_existed() {
    let (_dir, store) = temp_store();
    let client = Address::localhost(3232);
    store.connect(client, &username("@helloworld"), 1).unwrap();

    assert!(store.disconnect(client, 2));
    assert_eq!(store.session_username(client), None);
    assert!(!store.disconnect(client, 3));
    // The profile itself survives its sessions.
    assert!(store.has_profile(&username("@helloworld")));
}

// ---------------------------------------------------------------------------
// Follow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn follow_rules() {
    let (_dir, store) = temp_store();
    let alice = Address::localhost(3232);
    let bob = Address::localhost(4545);
    store.connect(alice, &username("@helloworld"), 1).unwrap();
    store.connect(bob, &username("@goodbye"), 1).unwrap();

    // No session yet for this address.
    assert_eq!(
        store.follow(Address::localhost(5000), &username("@helloworld"), 2),
        Err(StoreError::NoConnection)
    );
    // Nobody owns that profile.
    assert_eq!(
        store.follow(bob, &username("@missing_one"), 2),
        Err(StoreError::UnknownUsername)
    );
    // Self-follow is refused.
    assert_eq!(
        store.follow(alice, &username("@helloworld"), 2),
        Err(StoreError::CannotFollowSelf)
    );

    store.follow(bob, &username("@helloworld"), 2).unwrap();
    // Re-follow is idempotent, not an error.
    store.follow(bob, &username("@helloworld"), 3).unwrap();
    assert_eq!(
        store.followers_of(&username("@helloworld")),
        Some(BTreeSet::from([username("@goodbye")]))
    );
}

// ---------------------------------------------------------------------------
// Publish and consume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_reaches_the_follower_queue_once() {
    let (_dir, store) = temp_store();
    let alice = Address::localhost(3232);
    let bob = Address::localhost(4545);
    store.connect(alice, &username("@helloworld"), 1).unwrap();
    store.connect(bob, &username("@goodbye"), 1).unwrap();
    store.follow(bob, &username("@helloworld"), 2).unwrap();

    let (wake_tx, wake_rx) = mailbox();
    store
        .notify(alice, notif("Hello, World!"), &wake_tx, 50)
        .unwrap();
    assert_conserved(&store);

    // Exactly one wake, for the one follower.
    assert_eq!(wake_rx.try_recv().unwrap(), Some(username("@goodbye")));
    assert_eq!(wake_rx.try_recv().unwrap(), None);

    let pending = store.consume_one_pending(&username("@goodbye")).unwrap();
    assert_eq!(pending.sender, username("@helloworld"));
    assert_eq!(pending.message, notif("Hello, World!"));
    assert_eq!(pending.sent_at, 50);
    assert_eq!(pending.receivers, BTreeSet::from([bob]));
    assert_conserved(&store);

    assert_eq!(store.consume_one_pending(&username("@goodbye")), None);
}

#[tokio::test]
async fn publish_fans_out_to_every_follower() {
    let (_dir, store) = temp_store();
    let author = Address::localhost(3000);
    store.connect(author, &username("@helloworld"), 1).unwrap();

    let followers = ["@aaaa", "@bbbb", "@cccc"];
    for (i, handle) in followers.iter().enumerate() {
        let client = Address::localhost(3100 + i as u16);
        store.connect(client, &username(handle), 1).unwrap();
        store.follow(client, &username("@helloworld"), 2).unwrap();
    }

    let (wake_tx, wake_rx) = mailbox();
    store.notify(author, notif("fan out"), &wake_tx, 9).unwrap();
    assert_conserved(&store);

    let mut woken = Vec::new();
    while let Ok(Some(follower)) = wake_rx.try_recv() {
        woken.push(follower);
    }
    let mut expected: Vec<Username> = followers.iter().map(|h| username(h)).collect();
    woken.sort();
    expected.sort();
    assert_eq!(woken, expected);

    let mut consumed = 0;
    for handle in followers {
        while store.consume_one_pending(&username(handle)).is_some() {
            consumed += 1;
            assert_conserved(&store);
        }
    }
    assert_eq!(consumed, followers.len());
    assert_conserved(&store);
}

#[tokio::test]
async fn pending_queues_conserve_under_interleaving() {
    let (_dir, store) = temp_store();
    let alice = Address::localhost(3001);
    let bob = Address::localhost(3002);
    let carol = Address::localhost(3003);
    store.connect(alice, &username("@alice_a"), 1).unwrap();
    store.connect(bob, &username("@bobby_b"), 1).unwrap();
    store.connect(carol, &username("@carol_c"), 1).unwrap();
    store.follow(bob, &username("@alice_a"), 2).unwrap();
    store.follow(carol, &username("@alice_a"), 2).unwrap();
    store.follow(carol, &username("@bobby_b"), 2).unwrap();

    let (wake_tx, _wake_rx) = mailbox();
    store.notify(alice, notif("one"), &wake_tx, 10).unwrap();
    assert_conserved(&store);
    store.notify(bob, notif("two"), &wake_tx, 11).unwrap();
    assert_conserved(&store);

    // Carol has one pending from each sender, FIFO by publish order.
    let first = store.consume_one_pending(&username("@carol_c")).unwrap();
    assert_eq!(first.sender, username("@alice_a"));
    assert_conserved(&store);

    store.notify(alice, notif("three"), &wake_tx, 12).unwrap();
    assert_conserved(&store);

    let mut remaining = 0;
    for handle in ["@bobby_b", "@carol_c"] {
        while store.consume_one_pending(&username(handle)).is_some() {
            remaining += 1;
            assert_conserved(&store);
        }
    }
    // bob: "one" + "three"; carol: "two" + "three".
    assert_eq!(remaining, 4);
    let (queued, retained) = store.pending_counts();
    assert_eq!((queued, retained), (0, 0));
}

#[tokio::test]
async fn publish_without_session_is_refused() {
    let (_dir, store) = temp_store();
    let (wake_tx, wake_rx) = mailbox();
    let err = store
        .notify(Address::localhost(9999), notif("nope"), &wake_tx, 1)
        .unwrap_err();
    assert_eq!(err, StoreError::NoConnection);
    assert_eq!(wake_rx.try_recv().unwrap(), None);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_round_trips_without_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server_data");

    {
        let store = ProfileStore::new(&path);
        let alice = Address::localhost(3232);
        let bob = Address::localhost(4545);
        store.connect(alice, &username("@helloworld"), 1).unwrap();
        store.connect(bob, &username("@goodbye"), 1).unwrap();
        store.follow(bob, &username("@helloworld"), 2).unwrap();
        let (wake_tx, _wake_rx) = mailbox();
        store.notify(alice, notif("persist me"), &wake_tx, 77).unwrap();

        // The store is dirty, so the persistence call returns immediately
        // after writing.
        assert!(store.persist_if_dirty().await);
    }

    let store = ProfileStore::new(&path);
    assert!(store.load().await);
    assert!(store.has_profile(&username("@helloworld")));
    assert_eq!(
        store.followers_of(&username("@helloworld")),
        Some(BTreeSet::from([username("@goodbye")]))
    );
    assert_conserved(&store);

    // Sessions are runtime state and never survive a reload.
    assert_eq!(store.session_username(Address::localhost(3232)), None);

    // The queued notification survived; its receiver set is empty because
    // nobody reconnected yet.
    let pending = store.consume_one_pending(&username("@goodbye")).unwrap();
    assert_eq!(pending.message, notif("persist me"));
    assert_eq!(pending.sent_at, 77);
    assert!(pending.receivers.is_empty());
}

#[tokio::test]
async fn corrupt_snapshot_clears_to_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server_data");
    std::fs::write(&path, b"definitely not a snapshot").unwrap();

    let store = ProfileStore::new(&path);
    assert!(!store.load().await);
    assert!(!store.has_profile(&username("@helloworld")));
}

#[tokio::test]
async fn missing_snapshot_is_not_an_error() {
    let (_dir, store) = temp_store();
    assert!(!store.load().await);
}

#[tokio::test]
async fn shutdown_releases_the_persistence_waiter() {
    let (_dir, store) = temp_store();
    let store = std::sync::Arc::new(store);
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.persist_if_dirty().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    store.shutdown();
    let still_active = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(!still_active);
}
