use super::*;

fn sample() -> Descriptor {
  Descriptor::new()
    .with("skin", ParamValue::Color([0.8, 0.6, 0.5, 1.0]))
    .with("hat", ParamValue::Text("cowboy".into()))
    .with("height", ParamValue::Float(1.8))
}

#[test]
fn test_hash_is_order_insensitive() {
  let a = sample();
  let b = Descriptor::new()
    .with("height", ParamValue::Float(1.8))
    .with("hat", ParamValue::Text("cowboy".into()))
    .with("skin", ParamValue::Color([0.8, 0.6, 0.5, 1.0]));

  assert_eq!(a.parameter_hash(), b.parameter_hash());
  assert_eq!(a.hash_with(0, &[0, 1]), b.hash_with(0, &[0, 1]));
}

#[test]
fn test_hash_changes_with_values() {
  let a = sample();
  let b = sample().with("hat", ParamValue::Text("beret".into()));
  assert_ne!(a.parameter_hash(), b.parameter_hash());

  // Same bits, different type
  let c = Descriptor::new().with("x", ParamValue::Int(1));
  let d = Descriptor::new().with("x", ParamValue::Bool(true));
  assert_ne!(c.parameter_hash(), d.parameter_hash());
}

#[test]
fn test_identical_hash_is_subset() {
  let hash = sample().hash_with(1, &[1, 2]);
  assert!(hash.is_subset(&hash.clone()));
}

#[test]
fn test_coarser_lods_are_subset() {
  let built = sample().hash_with(0, &[0, 0]);
  let coarser = sample().hash_with(1, &[2, 1]);

  assert!(coarser.is_subset(&built));
  assert!(!built.is_subset(&coarser));
}

#[test]
fn test_finer_component_lod_is_not_subset() {
  let built = sample().hash_with(0, &[1, 1]);
  let request = sample().hash_with(0, &[1, 0]);
  assert!(!request.is_subset(&built));
}

#[test]
fn test_different_parameters_never_subset() {
  let built = sample().hash_with(0, &[0]);
  let other = sample()
    .with("height", ParamValue::Float(1.9))
    .hash_with(3, &[3]);
  assert!(!other.is_subset(&built));
}

#[test]
fn test_component_count_mismatch_never_subset() {
  let built = sample().hash_with(0, &[0, 0]);
  let request = sample().hash_with(0, &[0]);
  assert!(!request.is_subset(&built));
}

#[test]
fn test_with_lods_keeps_parameters() {
  let hash = sample().hash_with(0, &[0, 0]);
  let moved = hash.with_lods(2, &[2, 2]);

  assert_eq!(moved.parameters, hash.parameters);
  assert_eq!(moved.min_lod, 2);
  assert!(moved.is_subset(&hash));
}
