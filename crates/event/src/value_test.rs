//! Field value tests

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::value::{FieldKind, FieldValue};

fn hash_of(value: &FieldValue) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[test]
fn test_kind_tags() {
    assert_eq!(FieldValue::Int(1).kind(), FieldKind::Int);
    assert_eq!(FieldValue::Long(1).kind(), FieldKind::Long);
    assert_eq!(FieldValue::Float(1.0).kind(), FieldKind::Float);
    assert_eq!(FieldValue::Bool(true).kind(), FieldKind::Bool);
    assert_eq!(FieldValue::Str("a".into()).kind(), FieldKind::Str);
    assert_eq!(FieldValue::Bytes(vec![1]).kind(), FieldKind::Bytes);
}

#[test]
fn test_as_long_widens_int() {
    assert_eq!(FieldValue::Int(-7).as_long(), Some(-7));
    assert_eq!(FieldValue::Long(1 << 40).as_long(), Some(1 << 40));
    assert_eq!(FieldValue::Str("x".into()).as_long(), None);
    assert_eq!(FieldValue::Float(1.0).as_long(), None);
}

#[test]
fn test_as_f64() {
    assert_eq!(FieldValue::Int(2).as_f64(), Some(2.0));
    assert_eq!(FieldValue::Float(0.5).as_f64(), Some(0.5));
    assert_eq!(FieldValue::Bool(true).as_f64(), None);
}

#[test]
fn test_int_and_long_are_distinct() {
    // Same numeric value, different wire type: must not compare equal,
    // otherwise dimension keys would collapse across schema changes.
    assert_ne!(FieldValue::Int(5), FieldValue::Long(5));
}

#[test]
fn test_float_equality_is_bitwise() {
    assert_eq!(FieldValue::Float(f32::NAN), FieldValue::Float(f32::NAN));
    assert_ne!(FieldValue::Float(0.0), FieldValue::Float(-0.0));
}

#[test]
fn test_equal_values_hash_equal() {
    let a = FieldValue::Str("wakelock".into());
    let b = FieldValue::Str("wakelock".into());
    assert_eq!(a, b);
    assert_eq!(hash_of(&a), hash_of(&b));

    let nan_a = FieldValue::Float(f32::NAN);
    let nan_b = FieldValue::Float(f32::NAN);
    assert_eq!(hash_of(&nan_a), hash_of(&nan_b));
}
