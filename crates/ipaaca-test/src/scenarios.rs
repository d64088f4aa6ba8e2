//! End-to-end scenarios: two or three peers sharing one bus

use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use ipaaca_core::{
    link_map, DocumentMap, DocumentValue, EventMask, IpaacaConfig, IpaacaError, IuEventType,
};
use ipaaca_runtime::Unit;
use ipaaca_transport::LocalBus;

use crate::harness::{wait_until, EventRecorder, Peer, EVENT_TIMEOUT};

fn items(key: &str, value: impl Into<DocumentValue>) -> DocumentMap {
    let mut map = DocumentMap::new();
    map.insert(key.to_string(), value.into());
    map
}

fn settle() {
    thread::sleep(Duration::from_millis(50));
}

#[test]
fn test_remote_write_round_trip() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let b = Peer::new(&bus, "B", &["demo"]).unwrap();
    let owner_events = EventRecorder::new();
    owner_events.attach_output(&a.output, EventMask::ALL_EVENTS);

    let unit = Unit::builder("demo").payload(items("k", "v")).build().unwrap();
    a.output.add(&unit).unwrap();

    let mirror = b.mirror(&unit.uid()).unwrap();
    assert_eq!(mirror.payload().get("k"), DocumentValue::from("v"));
    assert_eq!(mirror.owner_name().as_deref(), Some(a.output.unique_name()));

    let revision = mirror
        .modify_payload(true, items("k", "v2"), BTreeSet::new())
        .unwrap();
    assert_eq!(revision, 2);
    assert_eq!(unit.revision(), 2);
    assert_eq!(mirror.revision(), 2);
    assert_eq!(unit.payload().get("k"), DocumentValue::from("v2"));

    assert!(b.events.wait_for(&unit.uid(), IuEventType::Updated, 1));
    settle();
    let updates: Vec<_> = b
        .events
        .events()
        .into_iter()
        .filter(|e| e.event == IuEventType::Updated)
        .collect();
    assert_eq!(updates.len(), 1);
    assert!(!updates[0].is_local);
    assert_eq!(updates[0].revision, 2);

    let owner_updates: Vec<_> = owner_events
        .events()
        .into_iter()
        .filter(|e| e.event == IuEventType::Updated)
        .collect();
    assert_eq!(owner_updates.len(), 1);
    assert!(owner_updates[0].is_local);
}

#[test]
fn test_owner_updates_reach_mirror_in_order() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let b = Peer::new(&bus, "B", &["demo"]).unwrap();
    let unit = Unit::new("demo");
    a.output.add(&unit).unwrap();
    let mirror = b.mirror(&unit.uid()).unwrap();

    for i in 0..20 {
        unit.payload().set("n", i).unwrap();
    }
    assert!(b.events.wait_for(&unit.uid(), IuEventType::Updated, 20));
    assert_eq!(mirror.revision(), 21);
    assert_eq!(mirror.payload().get("n"), DocumentValue::Integer(19));

    let revisions: Vec<_> = b
        .events
        .events()
        .into_iter()
        .filter(|e| e.event == IuEventType::Updated)
        .map(|e| e.revision)
        .collect();
    assert_eq!(revisions, (2..=21).collect::<Vec<_>>());
}

#[test]
fn test_transaction_emits_one_update() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let b = Peer::new(&bus, "B", &["demo"]).unwrap();
    let unit = Unit::new("demo");
    a.output.add(&unit).unwrap();
    let mirror = b.mirror(&unit.uid()).unwrap();

    {
        let payload = unit.payload();
        let tx = payload.transaction();
        payload.set("a", 1).unwrap();
        payload.set("a", 2).unwrap();
        payload.remove("a").unwrap();
        payload.set("a", 3).unwrap();
        payload.set("b", "x").unwrap();
        tx.finish().unwrap();
    }

    assert!(b.events.wait_for(&unit.uid(), IuEventType::Updated, 1));
    settle();
    assert_eq!(b.events.count(IuEventType::Updated), 1);
    assert_eq!(mirror.revision(), 2);
    assert_eq!(mirror.payload().get("a"), DocumentValue::Integer(3));
    assert_eq!(mirror.payload().get("b"), DocumentValue::from("x"));
}

#[test]
fn test_remote_commit_latches_both_sides() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let b = Peer::new(&bus, "B", &["demo"]).unwrap();
    let unit = Unit::new("demo");
    a.output.add(&unit).unwrap();
    let mirror = b.mirror(&unit.uid()).unwrap();

    mirror.commit().unwrap();
    assert!(mirror.is_committed());
    assert!(unit.is_committed());
    assert!(b.events.wait_for(&unit.uid(), IuEventType::Committed, 1));

    assert!(matches!(mirror.payload().set("k", 1), Err(IpaacaError::Committed(_))));
    assert!(matches!(unit.payload().set("k", 1), Err(IpaacaError::Committed(_))));
    assert_eq!(unit.revision(), 2);
}

#[test]
fn test_retraction_and_deletion_propagate() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let b = Peer::new(&bus, "B", &["demo"]).unwrap();
    let unit = Unit::new("demo");
    a.output.add(&unit).unwrap();
    let mirror = b.mirror(&unit.uid()).unwrap();

    a.output.retract(&unit.uid()).unwrap();
    assert!(b.events.wait_for(&unit.uid(), IuEventType::Retracted, 1));
    assert!(mirror.is_retracted());
    assert!(matches!(mirror.payload().set("k", 1), Err(IpaacaError::Retracted(_))));
    assert!(matches!(mirror.retract(), Err(IpaacaError::NotImplemented(_))));

    a.output.remove(&unit.uid()).unwrap();
    assert!(b.events.wait_for(&unit.uid(), IuEventType::Deleted, 1));
    assert!(b.input.get(&unit.uid()).is_none());
}

#[test]
fn test_messages_are_delivered_not_cached() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let b = Peer::new(&bus, "B", &["chat"]).unwrap();

    let message = a.handle.new_message("chat").unwrap();
    message.payload().set("text", "hello").unwrap();
    a.output.add(&message).unwrap();

    let seen = b.events.wait_for_any(IuEventType::Message).unwrap();
    assert_eq!(seen.uid, message.uid());
    assert_eq!(seen.category, "chat");
    assert!(b.input.is_empty());
    assert!(a.output.is_empty());

    message.payload().set("text", "ignored").unwrap();
    settle();
    assert_eq!(b.events.count(IuEventType::Updated), 0);
}

#[test]
fn test_links_propagate_both_ways() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let b = Peer::new(&bus, "B", &["demo"]).unwrap();
    let unit = Unit::new("demo");
    a.output.add(&unit).unwrap();
    let mirror = b.mirror(&unit.uid()).unwrap();

    unit.add_links("grin", ["x", "y"]).unwrap();
    assert!(b.events.wait_for(&unit.uid(), IuEventType::LinksUpdated, 1));
    assert_eq!(mirror.links("grin").len(), 2);

    mirror.remove_link("grin", "x").unwrap();
    assert_eq!(unit.links("grin"), BTreeSet::from(["y".to_string()]));
    assert!(b.events.wait_for(&unit.uid(), IuEventType::LinksUpdated, 2));

    mirror.set_links(&link_map("next", ["z"])).unwrap();
    assert!(unit.links("grin").is_empty());
    assert_eq!(unit.all_links(), link_map("next", ["z"]));
    assert!(b.events.wait_for(&unit.uid(), IuEventType::LinksUpdated, 3));
    assert_eq!(mirror.all_links(), unit.all_links());
}

#[test]
fn test_read_only_mirror_rejects_locally() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let b = Peer::new(&bus, "B", &["demo"]).unwrap();
    let unit = Unit::builder("demo").read_only(true).build().unwrap();
    a.output.add(&unit).unwrap();
    let mirror = b.mirror(&unit.uid()).unwrap();

    let calls = bus.stats().calls;
    assert!(matches!(mirror.payload().set("k", 1), Err(IpaacaError::ReadOnly(_))));
    assert_eq!(bus.stats().calls, calls);
    unit.payload().set("k", 1).unwrap();
    assert!(b.events.wait_for(&unit.uid(), IuEventType::Updated, 1));
}

#[test]
fn test_stale_mirror_write_is_rejected_by_owner() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let c = Peer::new(&bus, "C", &["demo"]).unwrap();
    let unit = Unit::new("demo");
    a.output.add(&unit).unwrap();
    let stale = c.mirror(&unit.uid()).unwrap();

    c.input.close();
    unit.commit().unwrap();
    assert!(!stale.is_committed());

    let err = stale.payload().set("k", "late").unwrap_err();
    assert!(matches!(err, IpaacaError::UpdateFailed(_)));
    assert_eq!(stale.revision(), 1);
    assert_eq!(stale.payload().get("k"), DocumentValue::Null);
    assert!(!unit.payload().contains_key("k"));
}

#[test]
fn test_late_joiner_recovers_by_resend() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let unit = Unit::new("demo");
    unit.payload().set("k", "early").unwrap();
    a.output.add(&unit).unwrap();

    let late = Peer::with_config(
        &bus,
        "late",
        &["demo"],
        IpaacaConfig::default().with_resend_active(true),
    )
    .unwrap();
    assert!(late.input.get(&unit.uid()).is_none());

    unit.payload().set("k", "fresh").unwrap();
    let mirror = late.mirror(&unit.uid()).unwrap();
    assert_eq!(mirror.payload().get("k"), DocumentValue::from("fresh"));

    unit.payload().set("k", "newest").unwrap();
    assert!(late.events.wait_for(&unit.uid(), IuEventType::Updated, 1));
    assert_eq!(mirror.payload().get("k"), DocumentValue::from("newest"));
    assert_eq!(mirror.revision(), unit.revision());
}

#[test]
fn test_updates_for_unknown_units_are_dropped_without_resend() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let unit = Unit::new("demo");
    a.output.add(&unit).unwrap();

    let late = Peer::new(&bus, "late", &["demo"]).unwrap();
    unit.payload().set("k", "v").unwrap();
    settle();
    assert!(late.input.is_empty());
    assert!(late.events.events().is_empty());
}

#[test]
fn test_handler_category_filter() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let b = Peer::new(&bus, "B", &["one", "two"]).unwrap();
    let only_two = EventRecorder::new();
    only_two.attach_input_filtered(&b.input, EventMask::from(IuEventType::Added), Some("two"));

    let one = Unit::new("one");
    let two = Unit::new("two");
    a.output.add(&one).unwrap();
    a.output.add(&two).unwrap();
    assert!(b.events.wait_for(&two.uid(), IuEventType::Added, 1));
    settle();
    let seen = only_two.events();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].uid, two.uid());
}

#[test]
fn test_concurrent_remote_writers_keep_revisions_gap_free() {
    let bus = LocalBus::new().unwrap();
    let a = Peer::new(&bus, "A", &[]).unwrap();
    let b = Peer::new(&bus, "B", &["demo"]).unwrap();
    let c = Peer::new(&bus, "C", &["demo"]).unwrap();
    let unit = Unit::new("demo");
    a.output.add(&unit).unwrap();
    let mb = b.mirror(&unit.uid()).unwrap();
    let mc = c.mirror(&unit.uid()).unwrap();

    let tb = thread::spawn(move || {
        (0..25)
            .map(|i| mb.payload().set("b", i).unwrap())
            .count()
    });
    let tc = thread::spawn(move || {
        (0..25)
            .map(|i| mc.payload().set("c", i).unwrap())
            .count()
    });
    assert_eq!(tb.join().unwrap() + tc.join().unwrap(), 50);
    assert_eq!(unit.revision(), 51);

    let mirror = b.input.get(&unit.uid()).unwrap();
    assert!(wait_until(EVENT_TIMEOUT, || mirror.revision() == 51));
    assert_eq!(mirror.payload().to_map(), unit.payload().to_map());
}
