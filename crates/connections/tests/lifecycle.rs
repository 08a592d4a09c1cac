// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

mod testing;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tether_common::{ConnectionId, RegistryError, SessionId};
use tether_connections::{CloseReason, Delivery, RegistryEvent, RegistryStats};
use test_case::test_case;

use testing::{DisposalProbe, RecordingTransport, Registry, messages};

#[test]
fn test_unattached_connection_is_evicted() {
    let fixture = Registry::new(1.0, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let c1 = registry.allocate_connection(&s1);
    assert!(registry.check_connection_exists(&c1));

    std::thread::sleep(Duration::from_millis(1200));

    assert!(!registry.check_connection_exists(&c1));
    assert_eq!(
        fixture.count_events(&RegistryEvent::ConnectionLost(c1.clone())),
        1
    );
    // Sessions are only ever ended explicitly.
    assert!(registry.check_session_is_valid(&s1));
    assert!(registry.connection_ids_for_session(&s1).unwrap().is_empty());
    assert_eq!(
        registry.session_for_connection(&c1),
        Err(RegistryError::ConnectionNotFound(c1))
    );
    registry.check_consistency().unwrap();
}

#[test]
fn test_allocation_events() {
    let fixture = Registry::new(15.0, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let c1 = registry.allocate_connection(&s1);
    let c2 = registry.allocate_connection(&s1);
    let transport = RecordingTransport::new(&s1, &c2);
    assert!(registry.register_transport(transport.shared(), false));

    assert_ne!(c1, c2);
    assert_eq!(
        fixture.events(),
        vec![
            RegistryEvent::SessionAllocated(s1.clone()),
            RegistryEvent::ConnectionAllocated(c1.clone()),
            RegistryEvent::ConnectionAllocated(c2.clone()),
            RegistryEvent::ConnectionRegistered(c2.clone()),
        ]
    );
    let mut expected = vec![c1.clone(), c2.clone()];
    expected.sort();
    assert_eq!(registry.connection_ids_for_session(&s1).unwrap(), expected);
    assert_eq!(registry.session_for_connection(&c1).unwrap(), s1);
}

#[test]
fn test_attach_detach_round_trip() {
    let fixture = Registry::new(0.4, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let c1 = registry.allocate_connection(&s1);
    let after_allocate = registry.stats();

    let transport = RecordingTransport::new(&s1, &c1);
    assert!(registry.register_transport(transport.shared(), true));
    assert!(registry.check_connection_is_available(&c1));
    assert_eq!(registry.stats().attached, 1);

    assert!(registry.unregister_transport(&transport.shared()));
    assert_eq!(registry.stats(), after_allocate);
    assert!(registry.check_connection_exists(&c1));
    assert!(!registry.check_connection_is_available(&c1));
    registry.check_consistency().unwrap();

    // The disconnection clock was restarted: the connection is evicted once it runs out.
    std::thread::sleep(Duration::from_millis(700));
    assert!(!registry.check_connection_exists(&c1));
    assert_eq!(
        fixture.count_events(&RegistryEvent::ConnectionLost(c1)),
        1
    );
    assert!(transport.closes().is_empty());
}

#[test]
fn test_attached_connection_is_not_evicted() {
    let fixture = Registry::new(0.2, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let (c1, _transport) = fixture.attached(&s1, false);

    std::thread::sleep(Duration::from_millis(500));
    assert!(registry.check_connection_exists(&c1));
    assert!(
        !fixture
            .events()
            .iter()
            .any(|event| matches!(event, RegistryEvent::ConnectionLost(_)))
    );
}

#[test]
fn test_stale_transport_is_reset_once() {
    let fixture = Registry::new(15.0, 0.2);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let (c1, transport) = fixture.attached(&s1, true);

    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(transport.closes(), vec![CloseReason::Reset]);

    // The reset client comes back with a fresh request.
    assert!(registry.unregister_transport(&transport.shared()));
    let fresh = RecordingTransport::new(&s1, &c1);
    assert!(registry.register_transport(fresh.shared(), false));
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(transport.closes(), vec![CloseReason::Reset]);
    assert!(fresh.closes().is_empty());
    registry.check_consistency().unwrap();
}

#[test]
fn test_delivery_stops_stale_clock() {
    let fixture = Registry::new(15.0, 0.3);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let (c1, transport) = fixture.attached(&s1, true);

    let delivery = registry.send_if_available(&c1, messages(&["hello"]));
    assert!(delivery.delivered());
    std::thread::sleep(Duration::from_millis(600));
    assert!(transport.closes().is_empty());
    assert_eq!(transport.sent_messages(), messages(&["hello"]));
}

#[test]
fn test_send_outcomes() {
    let fixture = Registry::new(15.0, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let detached = registry.allocate_connection(&s1);
    let (attached, transport) = fixture.attached(&s1, false);

    let Delivery::NotAvailable(returned) = registry.send_if_available(&detached, messages(&["a"]))
    else {
        panic!("expected NotAvailable for a detached connection");
    };
    assert_eq!(returned, messages(&["a"]));

    let missing = ConnectionId::from("nope");
    let outcome = registry.send_if_available(&missing, messages(&["b"]));
    assert!(!outcome.delivered() && !outcome.connection_exists());

    transport.fail_sends.store(true, Ordering::SeqCst);
    let outcome = registry.send_if_available(&attached, messages(&["c"]));
    assert!(matches!(outcome, Delivery::Failed(_)));
    // A failed send still frees the transport for the next one.
    assert!(registry.check_connection_is_available(&attached));
    transport.fail_sends.store(false, Ordering::SeqCst);
    assert!(
        registry
            .send_if_available(&attached, messages(&["d"]))
            .delivered()
    );
    assert_eq!(transport.sent_messages(), messages(&["d"]));
}

#[test]
fn test_register_rejects_untracked_connections() {
    let fixture = Registry::new(15.0, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let s2 = SessionId::from("s2");
    let c1 = registry.allocate_connection(&s1);

    let unknown = RecordingTransport::new(&s1, &ConnectionId::from("evicted"));
    assert!(!registry.register_transport(unknown.shared(), false));

    let wrong_session = RecordingTransport::new(&s2, &c1);
    assert!(!registry.register_transport(wrong_session.shared(), false));
    assert!(!registry.check_connection_is_available(&c1));
    assert!(!registry.check_connection_is_valid(&s2, &c1));
    assert!(registry.check_connection_is_valid(&s1, &c1));
    registry.check_consistency().unwrap();
}

#[test]
fn test_unregister_ignores_mismatched_transport() {
    let fixture = Registry::new(15.0, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let (c1, _transport) = fixture.attached(&s1, false);

    let impostor = RecordingTransport::new(&s1, &c1);
    assert!(!registry.unregister_transport(&impostor.shared()));
    assert!(registry.check_connection_is_available(&c1));
    assert_eq!(registry.stats().attached, 1);
}

#[test]
fn test_replacing_attached_transport_resets_old_one() {
    let fixture = Registry::new(15.0, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let (c1, first) = fixture.attached(&s1, true);

    let second = RecordingTransport::new(&s1, &c1);
    assert!(registry.register_transport(second.shared(), false));
    assert_eq!(first.closes(), vec![CloseReason::Reset]);
    assert!(second.closes().is_empty());
    assert!(!registry.unregister_transport(&first.shared()));
    assert!(registry.unregister_transport(&second.shared()));
    registry.check_consistency().unwrap();
}

#[test]
fn test_session_teardown() {
    let fixture = Registry::new(15.0, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let other = SessionId::from("other");
    let (c1, t1) = fixture.attached(&s1, true);
    let (c2, t2) = fixture.attached(&s1, false);
    let c3 = registry.allocate_connection(&s1);
    let (survivor, survivor_transport) = fixture.attached(&other, false);

    let upload = registry
        .connection_custom_object_or_insert_with(&c1, "upload", DisposalProbe::default)
        .unwrap();
    let backlog = registry
        .session_custom_object_or_insert_with(&s1, "backlog", DisposalProbe::default)
        .unwrap();

    assert!(registry.session_ended(&s1));

    assert!(!registry.check_session_is_valid(&s1));
    for connection_id in [&c1, &c2, &c3] {
        assert!(!registry.check_connection_is_valid(&s1, connection_id));
        assert!(!registry.check_connection_exists(connection_id));
    }
    assert_eq!(t1.closes(), vec![CloseReason::Logout]);
    assert_eq!(t2.closes(), vec![CloseReason::Logout]);
    assert_eq!(upload.disposals.load(Ordering::SeqCst), 1);
    assert_eq!(backlog.disposals.load(Ordering::SeqCst), 1);
    assert_eq!(
        fixture.count_events(&RegistryEvent::SessionClosed(s1.clone())),
        1
    );
    assert_eq!(
        registry.connection_ids_for_session(&s1),
        Err(RegistryError::SessionNotFound(s1.clone()))
    );

    // Other sessions are untouched.
    assert!(registry.check_connection_is_valid(&other, &survivor));
    assert!(survivor_transport.closes().is_empty());
    assert_eq!(
        registry.stats(),
        RegistryStats {
            sessions: 1,
            connections: 1,
            attached: 1,
            busy: 0,
        }
    );

    assert!(!registry.session_ended(&s1));
    assert_eq!(upload.disposals.load(Ordering::SeqCst), 1);
    registry.check_consistency().unwrap();
}

#[test]
fn test_evicted_connection_disposes_its_objects() {
    let fixture = Registry::new(0.2, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let c1 = registry.allocate_connection(&s1);
    let probe = registry
        .connection_custom_object_or_insert_with(&c1, "upload", DisposalProbe::default)
        .unwrap();
    std::thread::sleep(Duration::from_millis(500));
    assert!(!registry.check_connection_exists(&c1));
    assert_eq!(probe.disposals.load(Ordering::SeqCst), 1);
}

struct Marker;

impl tether_connections::CustomObject for Marker {}

#[test]
fn test_custom_objects() {
    let fixture = Registry::new(15.0, 15.0);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let c1 = registry.allocate_connection(&s1);

    assert!(
        registry
            .connection_custom_object::<DisposalProbe>(&c1, "probe")
            .unwrap()
            .is_none()
    );
    let created = registry
        .connection_custom_object_or_insert_with(&c1, "probe", DisposalProbe::default)
        .unwrap();
    let again = registry
        .connection_custom_object_or_insert_with(&c1, "probe", || -> DisposalProbe {
            panic!("factory must not run when the object exists")
        })
        .unwrap();
    assert!(Arc::ptr_eq(&created, &again));

    assert_eq!(
        registry.connection_custom_object::<Marker>(&c1, "probe").err(),
        Some(RegistryError::CustomObjectTypeMismatch {
            key: "probe".to_string()
        })
    );

    let removed = registry
        .unregister_connection_custom_object(&c1, "probe")
        .unwrap();
    assert!(removed.is_some());
    // Unregistering hands the object back without disposing it.
    assert_eq!(created.disposals.load(Ordering::SeqCst), 0);
    assert!(
        registry
            .unregister_connection_custom_object(&c1, "probe")
            .unwrap()
            .is_none()
    );

    registry
        .session_custom_object_or_insert_with(&s1, "marker", || Marker)
        .unwrap();
    assert!(
        registry
            .session_custom_object::<Marker>(&s1, "marker")
            .unwrap()
            .is_some()
    );
    assert!(
        registry
            .unregister_session_custom_object(&s1, "marker")
            .unwrap()
            .is_some()
    );
}

#[test_case("session" ; "session scope")]
#[test_case("connection" ; "connection scope")]
fn test_custom_objects_on_missing_owner(scope: &str) {
    let fixture = Registry::new(15.0, 15.0);
    let registry = &fixture.registry;
    let ghost_session = SessionId::from("ghost");
    let ghost_connection = ConnectionId::from("ghost");
    let probe = Arc::new(DisposalProbe::default());
    let factory_probe = probe.clone();

    let result = match scope {
        "session" => registry
            .session_custom_object_or_insert_with(&ghost_session, "k", move || {
                factory_probe.disposals.fetch_add(100, Ordering::SeqCst);
                DisposalProbe::default()
            })
            .map(|_| ()),
        _ => registry
            .connection_custom_object_or_insert_with(&ghost_connection, "k", move || {
                factory_probe.disposals.fetch_add(100, Ordering::SeqCst);
                DisposalProbe::default()
            })
            .map(|_| ()),
    };
    assert!(matches!(
        result,
        Err(RegistryError::SessionNotFound(_)) | Err(RegistryError::ConnectionNotFound(_))
    ));
    // The lookup fails before any factory runs.
    assert_eq!(probe.disposals.load(Ordering::SeqCst), 0);
}

#[test]
fn test_listener_panics_do_not_abort_teardown() {
    let fixture = Registry::new(15.0, 15.0);
    let registry = &fixture.registry;
    registry.subscribe(|event| {
        if matches!(event, RegistryEvent::SessionClosed(_)) {
            panic!("listener failure");
        }
    });
    let s1 = SessionId::from("s1");
    let (_c1, transport) = fixture.attached(&s1, false);
    assert!(registry.session_ended(&s1));
    assert_eq!(transport.closes(), vec![CloseReason::Logout]);
    assert_eq!(
        fixture.count_events(&RegistryEvent::SessionClosed(s1)),
        1
    );
}

#[test]
fn test_unrepresentable_timeouts_saturate() {
    let fixture = Registry::new(1e20, 1e20);
    let registry = &fixture.registry;
    let s1 = SessionId::from("s1");
    let (c1, transport) = fixture.attached(&s1, true);
    let c2 = registry.allocate_connection(&s1);
    assert!(registry.unregister_transport(&transport.shared()));
    assert!(registry.check_connection_exists(&c1));
    assert!(registry.check_connection_exists(&c2));
    registry.check_consistency().unwrap();
}
