//! Presence tests: directory flags, snapshot ordering and broadcast reach.
//!
//! Tests cover:
//! - Online-first, then username ordering of every snapshot
//! - Broadcast to all live connections, anonymous ones included
//! - Disconnect and logout cleanup, and their idempotence
//! - Renaming a connection, and logging out under another name
//! - The duplicate-identity gap (second connection for one username)
//! - A seeded randomized event sequence checked after every step
//! - Fail-open behaviour when the directory table is gone

mod common;

use common::{flags, is_online, state, Client};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn snapshot_orders_online_first_then_username() {
    let state = state();
    let alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    let carol = Client::connect(&state);
    let mut observer = Client::connect(&state);

    bob.identify(&state, "bob");
    carol.identify(&state, "carol");
    alice.identify(&state, "alice");
    bob.logout(&state, "bob");

    let snapshots = observer.snapshots();
    assert_eq!(snapshots.len(), 4, "one broadcast per transition");
    assert_eq!(
        flags(snapshots.last().unwrap()),
        vec![
            ("alice".to_string(), true),
            ("carol".to_string(), true),
            ("bob".to_string(), false),
        ]
    );
    // The logging-out connection still receives the broadcast.
    assert_eq!(bob.snapshots().len(), 4);
}

#[test]
fn identify_broadcasts_to_every_connection() {
    let state = state();
    let mut anon = Client::connect(&state);
    let mut alice = Client::connect(&state);

    alice.identify(&state, "alice");

    for client in [&mut anon, &mut alice] {
        let snapshots = client.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(flags(&snapshots[0]), vec![("alice".to_string(), true)]);
    }
    assert_eq!(state.registry.username_of(alice.id).as_deref(), Some("alice"));
}

#[test]
fn disconnect_marks_offline_and_broadcasts() {
    let state = state();
    let alice = Client::connect(&state);
    let mut observer = Client::connect(&state);
    alice.identify(&state, "alice");
    let seen_online = state.with_db(|db| db.find_user("alice")).flatten().unwrap().last_seen;
    observer.events();

    assert_eq!(alice.disconnect(&state).as_deref(), Some("alice"));

    let user = state.with_db(|db| db.find_user("alice")).flatten().unwrap();
    assert!(!user.is_online);
    assert!(user.last_seen >= seen_online);
    let snapshots = observer.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(flags(&snapshots[0]), vec![("alice".to_string(), false)]);
    assert!(!state.registry.is_anyone_bound("alice"));
}

#[test]
fn anonymous_disconnect_is_silent() {
    let state = state();
    let anon = Client::connect(&state);
    let mut observer = Client::connect(&state);

    assert_eq!(anon.disconnect(&state), None);

    assert!(observer.events().is_empty());
    assert!(state.with_db(|db| db.list_users()).unwrap().is_empty());
    assert_eq!(state.registry.len(), 1);
}

#[test]
fn logout_keeps_connection_open_and_anonymous() {
    let state = state();
    let mut alice = Client::connect(&state);
    alice.identify(&state, "alice");
    alice.logout(&state, "alice");

    assert_eq!(is_online(&state, "alice"), Some(false));
    assert_eq!(state.registry.username_of(alice.id), None);
    assert_eq!(state.registry.len(), 1);
    alice.events();

    // The later close finds no binding: no second write, no broadcast.
    let mut observer = Client::connect(&state);
    assert_eq!(alice.disconnect(&state), None);
    assert!(observer.events().is_empty());
}

#[test]
fn repeated_logout_and_unbind_are_harmless() {
    let state = state();
    let alice = Client::connect(&state);
    alice.identify(&state, "alice");

    alice.logout(&state, "alice");
    alice.logout(&state, "alice");
    assert_eq!(is_online(&state, "alice"), Some(false));

    assert_eq!(state.registry.unbind(alice.id), None);
    assert_eq!(state.registry.unbind(alice.id), None);
    assert_eq!(state.registry.unbind(9999), None);
}

#[test]
fn logout_of_unknown_user_creates_no_record() {
    let state = state();
    let mut anon = Client::connect(&state);
    anon.logout(&state, "ghost");

    assert_eq!(is_online(&state, "ghost"), None);
    // The user list is still broadcast, empty.
    let snapshots = anon.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].is_empty());
}

#[test]
fn reconnect_brings_user_back_online() {
    let state = state();
    let first = Client::connect(&state);
    first.identify(&state, "alice");
    first.disconnect(&state);
    assert_eq!(is_online(&state, "alice"), Some(false));

    let second = Client::connect(&state);
    second.identify(&state, "alice");
    assert_eq!(is_online(&state, "alice"), Some(true));
    assert_eq!(state.with_db(|db| db.list_users()).unwrap().len(), 1);
}

#[test]
fn reidentify_under_new_name_takes_old_name_offline() {
    let state = state();
    let a = Client::connect(&state);
    let mut observer = Client::connect(&state);
    a.identify(&state, "alice");
    a.identify(&state, "alicia");

    assert_eq!(is_online(&state, "alice"), Some(false));
    assert_eq!(is_online(&state, "alicia"), Some(true));
    assert!(!state.registry.is_anyone_bound("alice"));
    let last = observer.snapshots().pop().unwrap();
    assert_eq!(
        flags(&last),
        vec![("alicia".to_string(), true), ("alice".to_string(), false)]
    );

    a.disconnect(&state);
    assert_eq!(is_online(&state, "alicia"), Some(false));
}

#[test]
fn reidentify_under_same_name_stays_online() {
    let state = state();
    let a = Client::connect(&state);
    a.identify(&state, "alice");
    a.identify(&state, "alice");
    assert_eq!(is_online(&state, "alice"), Some(true));
}

#[test]
fn logout_under_other_name_takes_bound_name_offline() {
    let state = state();
    let a = Client::connect(&state);
    let b = Client::connect(&state);
    a.identify(&state, "alice");
    b.identify(&state, "bob");

    a.logout(&state, "bob");

    // Both the named user and the name this connection held go offline.
    assert_eq!(is_online(&state, "alice"), Some(false));
    assert_eq!(is_online(&state, "bob"), Some(false));
    assert_eq!(state.registry.username_of(a.id), None);
    assert_eq!(state.registry.username_of(b.id).as_deref(), Some("bob"));

    a.disconnect(&state);
    assert_eq!(is_online(&state, "alice"), Some(false));
}

/// Two connections identify as the same user and the first one leaves.
/// The user is reported offline even though the second connection is still
/// bound and still receives deliveries. Whether to count bindings per
/// username or reject the second identify is undecided.
#[test]
fn duplicate_identity_disconnect_marks_user_offline() {
    let state = state();
    let a = Client::connect(&state);
    let mut c = Client::connect(&state);
    a.identify(&state, "alice");
    c.identify(&state, "alice");
    assert_eq!(state.registry.lookup_connection("alice"), Some(a.id));

    a.disconnect(&state);

    assert_eq!(is_online(&state, "alice"), Some(false));
    assert!(state.registry.is_anyone_bound("alice"));
    assert_eq!(state.registry.lookup_connection("alice"), Some(c.id));
    let last = c.snapshots().pop().unwrap();
    assert_eq!(flags(&last), vec![("alice".to_string(), false)]);

    // Still reachable despite the flag.
    let sender = Client::connect(&state);
    sender.send(&state, Some("bob"), "alice", "still there?");
    assert_eq!(c.deliveries().len(), 1);
}

#[test]
fn directory_failure_does_not_break_the_connection() {
    let state = state();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    state.with_db(|db| db.execute_raw("DROP TABLE users")).unwrap();

    alice.identify(&state, "alice");
    bob.identify(&state, "bob");

    // Bindings still happen; the snapshot is skipped because it can't be read.
    assert_eq!(state.registry.username_of(alice.id).as_deref(), Some("alice"));
    assert!(alice.snapshots().is_empty());

    // Routing is independent of the directory.
    alice.send(&state, Some("alice"), "bob", "hi");
    assert_eq!(bob.deliveries().len(), 1);

    assert_eq!(alice.disconnect(&state).as_deref(), Some("alice"));
    assert!(!state.registry.is_anyone_bound("alice"));
}

/// Random identify/logout/disconnect/connect sequences over a small pool,
/// including renames and logouts under another name.
///
/// With at most one connection per username the directory matches the
/// registry after every step, and the last broadcast matches the directory.
#[test]
fn randomized_events_keep_directory_in_step_with_registry() {
    const NAMES: [&str; 4] = ["alice", "bob", "carol", "dave"];

    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let state = state();
        let mut observer = Client::connect(&state);
        let mut clients: Vec<Client> = (0..4).map(|_| Client::connect(&state)).collect();

        for step in 0..200 {
            let idx = rng.gen_range(0..clients.len());
            let id = clients[idx].id;
            let name = NAMES[rng.gen_range(0..NAMES.len())];
            // Only a connection that already holds `name`, or a name nobody
            // holds, keeps bindings unique.
            let free = state.registry.lookup_connection(name).is_none_or(|c| c == id);
            match rng.gen_range(0..4) {
                0 if free => clients[idx].identify(&state, name),
                1 if free => clients[idx].logout(&state, name),
                0 | 1 => {}
                2 => {
                    clients.swap_remove(idx).disconnect(&state);
                    clients.push(Client::connect(&state));
                }
                _ => clients.push(Client::connect(&state)),
            }

            for name in NAMES {
                assert_eq!(
                    is_online(&state, name).unwrap_or(false),
                    state.registry.is_anyone_bound(name),
                    "seed {seed} step {step}: {name} out of step"
                );
            }
            if let Some(last) = observer.snapshots().pop() {
                assert_eq!(last, state.with_db(|db| db.list_users()).unwrap());
            }
        }
    }
}

/// Same as above with no restrictions: duplicates, renames and logouts of
/// names held elsewhere. Only one direction still holds: a user marked
/// online always has a bound connection.
#[test]
fn randomized_duplicates_never_report_unbound_user_online() {
    const NAMES: [&str; 3] = ["alice", "bob", "carol"];

    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let state = state();
        let mut clients: Vec<Client> = (0..5).map(|_| Client::connect(&state)).collect();

        for _ in 0..200 {
            let idx = rng.gen_range(0..clients.len());
            let name = NAMES[rng.gen_range(0..NAMES.len())];
            match rng.gen_range(0..3) {
                0 => clients[idx].identify(&state, name),
                1 => clients[idx].logout(&state, name),
                _ => {
                    clients.swap_remove(idx).disconnect(&state);
                    clients.push(Client::connect(&state));
                }
            }

            for name in NAMES {
                if is_online(&state, name) == Some(true) {
                    assert!(state.registry.is_anyone_bound(name), "seed {seed}: {name}");
                }
            }
        }
    }
}
