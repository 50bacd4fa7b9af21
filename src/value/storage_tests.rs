use super::{
    layout::{FlatteningPolicy, LayoutFactory, LayoutKind},
    object::Heap,
    storage::FieldStorage,
    Value,
};
use crate::{
    error::InvokeError,
    types::{BasicType, ClassBuilder, ClassDirectory, FieldDefinition, FieldFlags, FieldType},
    utils::{
        sync::{Arc, Ordering},
        ByteOffset,
    },
};
use std::thread;

fn heap() -> Heap {
    let dir = ClassDirectory::new();
    dir.define(
        ClassBuilder::value_class("geo/Point")
            .field(FieldDefinition::new("x", "I"))
            .field(FieldDefinition::new("y", "I")),
    )
    .unwrap();
    dir.define(
        ClassBuilder::value_class("geo/Tiny")
            .field(FieldDefinition::new("v", "S")),
    )
    .unwrap();
    dir.define(
        ClassBuilder::value_class("geo/Line")
            .field(FieldDefinition::new("a", "Lgeo/Point;").with_flags(FieldFlags::NULL_RESTRICTED))
            .field(FieldDefinition::new("b", "Lgeo/Point;").with_flags(FieldFlags::NULL_RESTRICTED))
            .field(FieldDefinition::new("label", "LObject;")),
    )
    .unwrap();
    let dir = Arc::new(dir);
    Heap::new(LayoutFactory::new(dir, FlatteningPolicy::default()))
}

fn point(heap: &Heap, x: i32, y: i32) -> Value {
    let class = heap.layouts().directory().find("geo/Point").unwrap();
    let obj = heap.allocate_instance(&class).unwrap();
    let object = obj.object().unwrap();
    let layout = object.instance_layout().unwrap().clone();
    for (name, v) in [("x", x), ("y", y)] {
        let field = layout.get_field_by_name(name).unwrap();
        heap.write_slot(
            object.storage(),
            ByteOffset(field.position),
            &field.layout,
            &Value::Int(v),
            Ordering::Relaxed,
        )
        .unwrap();
    }
    Value::Reference(obj)
}

#[test]
fn out_of_range_access_is_internal() {
    let storage = FieldStorage::new(4);
    let err = storage.load(ByteOffset(8), 8, Ordering::Relaxed).unwrap_err();
    assert!(err.is_internal());
    let err = storage.load(ByteOffset(2), 4, Ordering::Relaxed).unwrap_err();
    assert!(err.is_internal());
    let err = storage.load(ByteOffset(0), 3, Ordering::Relaxed).unwrap_err();
    assert!(err.is_internal());
}

#[test]
fn concurrent_fetch_update_loses_nothing() {
    let storage = Arc::new(FieldStorage::new(8));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let storage = storage.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    storage
                        .fetch_update(ByteOffset(4), 4, Ordering::SeqCst, |v| v + 1)
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(storage.load(ByteOffset(4), 4, Ordering::SeqCst).unwrap(), 4000);
}

#[test]
fn value_objects_compare_by_substitutability() {
    let heap = heap();
    let a = point(&heap, 1, 1);
    let b = point(&heap, 1, 1);
    let c = point(&heap, 1, 2);
    assert!(!a.as_reference().unwrap().ptr_eq(b.as_reference().unwrap()));
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(
        heap.hash_code(a.as_reference().unwrap()),
        heap.hash_code(b.as_reference().unwrap())
    );
    assert_eq!(a.to_string(), "geo/Point{x=1, y=1}");
}

#[test]
fn atomic_unit_round_trip_through_flat_slot() {
    let heap = heap();
    let dir = heap.layouts().directory().clone();
    let tiny = dir.find("geo/Tiny").unwrap();
    let array = heap
        .allocate_array(&FieldType::Reference(tiny.clone()), 2)
        .unwrap();
    let array = array.object().unwrap().as_array().unwrap();
    assert_eq!(array.layout().kind(), LayoutKind::NullableAtomicFlat);

    let element = &array.layout().element;
    let read = heap
        .read_slot(array.storage(), array.element_offset(1), element, Ordering::Acquire)
        .unwrap();
    assert!(read.is_null());

    let value = heap.default_value(&tiny).unwrap();
    heap.write_slot(
        array.storage(),
        array.element_offset(1),
        element,
        &Value::Reference(value.clone()),
        Ordering::Release,
    )
    .unwrap();
    let read = heap
        .read_slot(array.storage(), array.element_offset(1), element, Ordering::Acquire)
        .unwrap();
    assert_eq!(read, Value::Reference(value));
}

#[test]
fn non_atomic_flat_copies_every_leaf() {
    let heap = heap();
    let dir = heap.layouts().directory().clone();
    let line = dir.find("geo/Line").unwrap();
    let array = heap.allocate_null_restricted_array(&line, 3).unwrap();
    let array = array.object().unwrap().as_array().unwrap();
    let flat = array.layout().element.flat().unwrap().clone();
    assert_eq!(flat.kind, LayoutKind::NonAtomicFlat);

    let default = heap
        .read_slot(array.storage(), array.element_offset(2), &array.layout().element, Ordering::Relaxed)
        .unwrap();
    assert_eq!(default.runtime_class(), Some(&line));

    let err = heap
        .copy_in_flat(array.storage(), array.element_offset(0), &flat, &Default::default(), Ordering::Relaxed)
        .unwrap_err();
    assert!(matches!(err, InvokeError::NullPointer(_)));

    let wrong = point(&heap, 3, 4);
    let err = heap
        .copy_in_flat(
            array.storage(),
            array.element_offset(0),
            &flat,
            wrong.as_reference().unwrap(),
            Ordering::Relaxed,
        )
        .unwrap_err();
    assert!(matches!(err, InvokeError::IncompatibleType { .. }));
}

#[test]
fn primitive_slots_reject_mismatched_values() {
    let heap = heap();
    let array = heap
        .allocate_array(&FieldType::Primitive(BasicType::Long), 1)
        .unwrap();
    let array = array.object().unwrap().as_array().unwrap();
    let err = heap
        .write_slot(
            array.storage(),
            array.element_offset(0),
            &array.layout().element,
            &Value::Int(1),
            Ordering::Relaxed,
        )
        .unwrap_err();
    assert!(err.is_internal());
}

#[test]
fn materialized_copies_die_with_their_holders() {
    let heap = heap();
    let dir = heap.layouts().directory().clone();
    let line = dir.find("geo/Line").unwrap();
    let array = heap.allocate_null_restricted_array(&line, 1).unwrap();
    let array = array.object().unwrap().as_array().unwrap();
    let before = heap.object_count();
    for _ in 0..100 {
        let copy = heap
            .read_slot(array.storage(), array.element_offset(0), &array.layout().element, Ordering::Relaxed)
            .unwrap();
        assert_eq!(copy.runtime_class(), Some(&line));
    }
    assert_eq!(heap.object_count(), before);
}
