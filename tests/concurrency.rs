mod common;

use common::*;
use dyninvoke::{
    types::{BasicType, FieldType},
    value::Value,
    vm::{handles::HandleKind, AccessMode, TemplateCache},
};
use std::{
    sync::{atomic::Ordering, Arc, Barrier},
    thread,
};

const THREADS: usize = 8;
const ROUNDS: usize = 500;

#[test]
fn concurrent_get_and_add_loses_no_updates() {
    let fx = Fixture::new();
    let handle = fx
        .runtime
        .lookup()
        .find_var_handle(&fx.class(FIELDS), "j", &FieldType::from(BasicType::Long))
        .unwrap();
    let object = fx.instance(FIELDS);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    handle.get_and_add(&[object.clone(), Value::Long(1)]).unwrap();
                }
            });
        }
    });
    assert_eq!(handle.get(&[object]).unwrap(), Value::Long((THREADS * ROUNDS) as i64));
}

#[test]
fn weak_compare_and_set_loops_count_exactly() {
    let fx = Fixture::new();
    let handle = fx
        .runtime
        .lookup()
        .find_static_var_handle(&fx.class(FIELDS), "static_i", &FieldType::from(BasicType::Int))
        .unwrap();
    handle.set(&[Value::Int(0)]).unwrap();
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    loop {
                        let current = handle.get_volatile(&[]).unwrap();
                        let next = Value::Int(current.as_int().unwrap() + 1);
                        if handle.weak_compare_and_set(&[current, next]).unwrap() {
                            break;
                        }
                    }
                }
            });
        }
    });
    assert_eq!(handle.get(&[]).unwrap(), Value::Int((THREADS * ROUNDS) as i32));
}

#[test]
fn non_atomic_flat_updates_never_tear() {
    let fx = Fixture::new();
    let handle = fx
        .runtime
        .lookup()
        .find_var_handle(&fx.class(FIELDS), "pair", &fx.field_type("Lt/Pair;"))
        .unwrap();
    let object = fx.instance(FIELDS);
    let layout = object
        .as_reference()
        .unwrap()
        .object()
        .and_then(|o| o.instance_layout())
        .and_then(|l| l.get_field_by_name("pair"))
        .map(|f| f.layout.kind().to_string());
    assert_eq!(layout.as_deref(), Some("non-atomic-flat"));

    handle.set_volatile(&[object.clone(), fx.pair(0, 0)]).unwrap();
    let pairs: Vec<Value> = (1..=THREADS as i64).map(|n| fx.pair(n, -n)).collect();
    thread::scope(|s| {
        for pair in &pairs {
            let (fx, handle, object) = (&fx, &handle, &object);
            s.spawn(move || {
                for _ in 0..ROUNDS {
                    let seen = handle.get_and_set(&[object.clone(), pair.clone()]).unwrap();
                    let seen = seen.as_reference().unwrap();
                    let a = fx.runtime.read_field(seen, "a").unwrap().as_long().unwrap();
                    let b = fx.runtime.read_field(seen, "b").unwrap().as_long().unwrap();
                    assert_eq!(a, -b, "torn pair ({}, {})", a, b);
                }
            });
        }
    });

    let last = handle.get_volatile(&[object.clone()]).unwrap();
    assert!(pairs.contains(&last));
    let next = fx.pair(100, -100);
    assert!(handle.compare_and_set(&[object.clone(), last.clone(), next.clone()]).unwrap());
    assert!(!handle.compare_and_set(&[object.clone(), last, fx.pair(0, 0)]).unwrap());
    assert_eq!(handle.get(&[object]).unwrap(), next);
}

#[test]
fn racing_static_accesses_initialize_once() {
    let fx = Fixture::new();
    let handle = fx
        .runtime
        .lookup()
        .find_static_var_handle(&fx.class(LAZY), "count", &FieldType::from(BasicType::Int))
        .unwrap();
    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                assert_eq!(handle.get_acquire(&[]).unwrap(), Value::Int(100));
            });
        }
    });
    assert_eq!(fx.lazy_inits.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_first_uses_share_one_template() {
    let fx = Fixture::new();
    let getter = fx
        .runtime
        .lookup()
        .find_static_getter(&fx.class(FIELDS), "static_d", &FieldType::from(BasicType::Double))
        .unwrap();
    let key = getter.direct().template_key(Some(AccessMode::GetOpaque)).unwrap();
    let barrier = Barrier::new(THREADS);
    let templates: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    TemplateCache::global()
                        .get_or_synthesize(key, fx.runtime.metrics())
                        .unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    assert!(templates.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    let stats = fx.runtime.cache_stats();
    assert!(stats.templates.hits + stats.templates.misses >= THREADS as u64);
}
