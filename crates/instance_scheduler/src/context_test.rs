use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use super::*;
use crate::descriptor::ParamValue;
use crate::registry::{InstanceRecord, ObjectDesc, Registry};

fn handle() -> InstanceHandle {
  let mut registry = Registry::new();
  let object = registry.add_object(ObjectDesc {
    name: "test".into(),
    component_count: 1,
    lod_count: 2,
    source: None,
  });
  registry.insert(InstanceRecord::new(object))
}

fn context(priority: Priority) -> UpdateContext {
  UpdateContext::new(
    handle(),
    ObjectId(0),
    Descriptor::new().with("a", ParamValue::Int(1)),
    LodRequest::uniform(0, 1),
    priority,
  )
}

#[test]
fn test_finalize_delivers_once() {
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&calls);
  let ctx = context(Priority::Med).with_callback(Some(Box::new(move |outcome| {
    assert_eq!(outcome.result, UpdateResult::Warning);
    counter.fetch_add(1, AtomicOrdering::SeqCst);
  })));

  let outcome = ctx.finalize(UpdateResult::Warning);

  assert_eq!(outcome.result, UpdateResult::Warning);
  assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
}

#[test]
fn test_drop_without_finalize_reports_error() {
  let (ticket, callback) = UpdateTicket::channel();
  drop(context(Priority::Low).with_callback(Some(callback)));

  let outcome = ticket.try_outcome().unwrap();
  assert_eq!(outcome.result, UpdateResult::Error);
}

#[test]
fn test_ticket_receives_outcome() {
  let (ticket, callback) = UpdateTicket::channel();
  assert!(ticket.try_outcome().is_none());

  context(Priority::Low)
    .with_callback(Some(callback))
    .finalize(UpdateResult::ErrorOptimized);

  let outcome = ticket.wait(Duration::from_millis(100)).unwrap();
  assert_eq!(outcome.result, UpdateResult::ErrorOptimized);
  // Single consumer: nothing left
  assert!(ticket.try_outcome().is_none());
}

#[test]
fn test_schedule_key_order() {
  let now = Instant::now();
  let later = now + Duration::from_millis(5);
  let key = |priority, distance, enqueued_at| ScheduleKey {
    priority,
    distance,
    enqueued_at,
  };

  // Priority dominates
  assert!(key(Priority::High, 100.0, later).runs_before(&key(Priority::Med, 1.0, now)));
  // Then distance
  assert!(key(Priority::Med, 1.0, later).runs_before(&key(Priority::Med, 2.0, now)));
  // Then age
  assert!(key(Priority::Med, 1.0, now).runs_before(&key(Priority::Med, 1.0, later)));
  assert!(!key(Priority::Med, 1.0, now).runs_before(&key(Priority::Med, 1.0, now)));
}

#[test]
fn test_inherit_position_keeps_most_urgent() {
  let older = context(Priority::High);
  std::thread::sleep(Duration::from_millis(1));
  let mut newer = context(Priority::Low);

  newer.inherit_position(&older);

  assert_eq!(newer.priority, Priority::High);
  assert_eq!(newer.enqueued_at, older.enqueued_at);
}

#[test]
fn test_set_lods_updates_hash() {
  let mut ctx = context(Priority::Low);
  let before = ctx.hash.clone();

  ctx.set_lods(LodRequest::uniform(1, 1));

  assert_eq!(ctx.hash.parameters, before.parameters);
  assert_eq!(ctx.hash.min_lod, 1);
  assert!(ctx.hash.is_subset(&before));
}
